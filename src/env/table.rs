//! The environment table.

use alloc::vec::Vec;

use super::{Env, EnvId, EnvStatus, ENVGENSHIFT, NENV};
use crate::error::Error;
use crate::mm::memlayout::{PGSIZE, USTACKTOP};
use crate::mm::{AddressSpace, FrameAllocator, PteFlags, VirtAddr};
use crate::trap::TrapFrame;

/// One loadable region of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub va: VirtAddr,
    pub data: Vec<u8>,
    pub writable: bool,
}

/// A user program: its segments and entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    pub entry: VirtAddr,
    pub segments: Vec<Segment>,
}

struct Slot {
    /// Id of the most recent occupant; seeds the next generation.
    last_id: u32,
    env: Option<Env>,
}

/// Fixed-size table of environments.
pub struct EnvTable {
    slots: Vec<Slot>,
}

impl EnvTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NENV);
        slots.resize_with(NENV, || Slot {
            last_id: 0,
            env: None,
        });
        Self { slots }
    }

    /// Allocate an environment with an empty address space.
    ///
    /// The new environment is `Runnable` with a frame that enters user
    /// mode at address 0 on the normal user stack; callers fill in the
    /// rest.
    ///
    /// # Errors
    /// - `NoFreeEnv` if every slot is taken
    /// - `NoMem` if the page directory cannot be allocated
    pub fn alloc(&mut self, frames: &mut FrameAllocator, parent: EnvId) -> Result<EnvId, Error> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.env.is_none())
            .ok_or(Error::NoFreeEnv)?;

        let space = AddressSpace::new(frames)?;

        let slot = &mut self.slots[index];
        let mut generation = slot.last_id.wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId::from_raw(generation | index as u32);

        slot.last_id = id.as_u32();
        slot.env = Some(Env {
            id,
            parent_id: parent,
            status: EnvStatus::Runnable,
            tf: TrapFrame::user(0, USTACKTOP),
            pgfault_upcall: None,
            space,
            cpunum: None,
            runs: 0,
        });

        log::debug!("[{}] new env {}", parent, id);
        Ok(id)
    }

    /// Load `image` into `id` and give it a one-page user stack.
    pub fn load(
        &mut self,
        frames: &mut FrameAllocator,
        id: EnvId,
        image: &ProgramImage,
    ) -> Result<(), Error> {
        let env = self.get_mut(id).ok_or(Error::BadEnv)?;

        for seg in &image.segments {
            let perm = if seg.writable {
                PteFlags::USER_RW
            } else {
                PteFlags::USER_RO
            };

            let len = (seg.data.len() as u32).max(1);
            let start = seg.va.align_down();
            let end = seg.va.add(len).align_up();

            let mut page = start;
            while page < end {
                if env.space.lookup(page).is_none() {
                    env.space.alloc_page(frames, page, perm)?;
                }
                page = page.add(PGSIZE);
            }

            env.space
                .copy_out(frames, seg.va, &seg.data)
                .map_err(|_| Error::Fault)?;
        }

        env.space
            .alloc_page(frames, VirtAddr::new(USTACKTOP - PGSIZE), PteFlags::USER_RW)?;
        env.tf.eip = image.entry.as_u32();

        Ok(())
    }

    /// Live environment with exactly this id.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.env.as_ref())
            .filter(|env| env.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.env.as_mut())
            .filter(|env| env.id == id)
    }

    /// Status of `id`; `Free` for ids that name nothing.
    pub fn status(&self, id: EnvId) -> EnvStatus {
        self.get(id).map_or(EnvStatus::Free, |env| env.status)
    }

    /// Resolve a user-supplied id.
    ///
    /// `EnvId::CURRENT` resolves to `caller`. With `checkperm`, only the
    /// caller itself and its immediate children are accepted.
    pub fn envid2env(&self, id: EnvId, caller: EnvId, checkperm: bool) -> Result<EnvId, Error> {
        if id.is_current() {
            return Ok(caller);
        }

        let env = self.get(id).ok_or(Error::BadEnv)?;
        if checkperm && env.id != caller && env.parent_id != caller {
            return Err(Error::BadEnv);
        }

        Ok(env.id)
    }

    /// Release `id` and everything its address space holds.
    pub fn free(&mut self, frames: &mut FrameAllocator, id: EnvId) {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return;
        };
        if slot.env.as_ref().map(|env| env.id) != Some(id) {
            return;
        }

        if let Some(env) = slot.env.take() {
            env.space.free(frames);
            log::debug!("free env {}", id);
        }
    }

    /// First `Runnable` environment in round-robin order after `after`.
    pub fn next_runnable(&self, after: Option<EnvId>) -> Option<EnvId> {
        let start = after.map_or(0, |id| id.index() + 1);

        (0..NENV)
            .map(|k| (start + k) % NENV)
            .filter_map(|i| self.slots[i].env.as_ref())
            .find(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id)
    }

    /// Whether anything is left for the scheduler to do, now or later.
    pub fn any_active(&self) -> bool {
        self.iter().any(|env| {
            matches!(
                env.status,
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
            )
        })
    }

    /// Iterate over live environments in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::memlayout::UTEXT;

    fn setup() -> (FrameAllocator, EnvTable) {
        (FrameAllocator::new(64), EnvTable::new())
    }

    #[test]
    fn test_ids_carry_generation() {
        let (mut frames, mut envs) = setup();
        let a = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        assert_eq!(a.as_u32(), 1 << ENVGENSHIFT);

        envs.free(&mut frames, a);
        let b = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(envs.get(a).is_none());
        assert_eq!(envs.status(a), EnvStatus::Free);
    }

    #[test]
    fn test_envid2env_permissions() {
        let (mut frames, mut envs) = setup();
        let parent = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        let child = envs.alloc(&mut frames, parent).unwrap();
        let other = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();

        assert_eq!(envs.envid2env(EnvId::CURRENT, parent, true), Ok(parent));
        assert_eq!(envs.envid2env(child, parent, true), Ok(child));
        assert_eq!(envs.envid2env(other, parent, true), Err(Error::BadEnv));
        assert_eq!(envs.envid2env(other, parent, false), Ok(other));
        assert_eq!(envs.envid2env(parent, child, true), Err(Error::BadEnv));
    }

    #[test]
    fn test_round_robin_order() {
        let (mut frames, mut envs) = setup();
        let a = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        let b = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        envs.get_mut(b).unwrap().status = EnvStatus::NotRunnable;
        let c = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();

        assert_eq!(envs.next_runnable(None), Some(a));
        assert_eq!(envs.next_runnable(Some(a)), Some(c));
        assert_eq!(envs.next_runnable(Some(c)), Some(a));
    }

    #[test]
    fn test_load_maps_segments_and_stack() {
        let (mut frames, mut envs) = setup();
        let id = envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        let image = ProgramImage {
            entry: VirtAddr::new(UTEXT + 0x20),
            segments: alloc::vec![
                Segment {
                    va: VirtAddr::new(UTEXT),
                    data: alloc::vec![0xCC; 16],
                    writable: false,
                },
                Segment {
                    va: VirtAddr::new(UTEXT + PGSIZE + 8),
                    data: alloc::vec![1, 2, 3],
                    writable: true,
                },
            ],
        };
        envs.load(&mut frames, id, &image).unwrap();

        let env = envs.get(id).unwrap();
        assert_eq!(env.tf.eip, UTEXT + 0x20);
        let (_, text) = env.space.lookup(VirtAddr::new(UTEXT)).unwrap();
        assert!(!text.contains(PteFlags::WRITABLE));
        let data = env
            .space
            .copy_in(&frames, VirtAddr::new(UTEXT + PGSIZE + 8), 3)
            .unwrap();
        assert_eq!(data, [1, 2, 3]);
        assert!(env.space.lookup(VirtAddr::new(USTACKTOP - PGSIZE)).is_some());
    }

    #[test]
    fn test_table_full() {
        let mut frames = FrameAllocator::new(NENV + 1);
        let mut envs = EnvTable::new();
        for _ in 0..NENV {
            envs.alloc(&mut frames, EnvId::CURRENT).unwrap();
        }
        assert_eq!(envs.alloc(&mut frames, EnvId::CURRENT), Err(Error::NoFreeEnv));
    }
}
