//! Binary semaphores shared by all processes.
//!
//! A fixed pool of slots addressed by small integer handles. `down` blocks
//! while the semaphore is locked; `up` releases it and wakes the waiters, of
//! which exactly one wins the re-check. Operations on handles that are out
//! of range or not allocated do nothing.

use log::trace;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sleep::Channel;
use crate::sync::Spinlock;
use crate::thread::ThreadRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsemState {
    Unused,
    Unlocked,
    Locked,
}

pub(crate) struct BsemPool {
    slots: Box<[Spinlock<BsemState>]>,
}

impl BsemPool {
    /// Pool of `n` unused semaphores.
    pub fn new(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| Spinlock::new("bsem", BsemState::Unused)).collect(),
        }
    }

    fn slot(&self, handle: i32) -> Option<(usize, &Spinlock<BsemState>)> {
        let i = usize::try_from(handle).ok()?;
        self.slots.get(i).map(|s| (i, s))
    }

    /// Claims the lowest unused slot, unlocked.
    pub fn alloc(&self) -> Option<i32> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            let mut s = s.lock();
            (*s == BsemState::Unused).then(|| {
                *s = BsemState::Unlocked;
                i as i32
            })
        })
    }

    /// Returns a slot to Unused; bad handles are ignored.
    pub fn free(&self, handle: i32) {
        if let Some((_, s)) = self.slot(handle) {
            *s.lock() = BsemState::Unused;
        }
    }

    /// State of `handle`, or `None` if it is out of range.
    pub fn state(&self, handle: i32) -> Option<BsemState> {
        self.slot(handle).map(|(_, s)| *s.lock())
    }
}

impl Kernel {
    /// Allocates an unlocked semaphore and returns its handle.
    pub fn bsem_alloc(&self) -> KernelResult<i32> {
        let handle = self.bsems.alloc().ok_or(KernelError::NoFreeSemaphore)?;
        trace!("bsem_alloc: {handle}");
        Ok(handle)
    }

    /// Frees the semaphore regardless of its state. Threads blocked on it
    /// stay blocked.
    pub fn bsem_free(&self, handle: i32) {
        self.bsems.free(handle);
    }

    /// Acquires the semaphore, sleeping while it is locked.
    pub fn bsem_down(&self, cur: ThreadRef, handle: i32) {
        let Some((i, slot)) = self.bsems.slot(handle) else {
            return;
        };
        let mut s = slot.lock();
        while *s == BsemState::Locked {
            s = self.sleep(cur, Channel::Bsem(i), s);
        }
        if *s == BsemState::Unlocked {
            *s = BsemState::Locked;
        }
    }

    /// Releases a locked semaphore and wakes its waiters.
    pub fn bsem_up(&self, handle: i32) {
        let Some((i, slot)) = self.bsems.slot(handle) else {
            return;
        };
        let mut s = slot.lock();
        if *s == BsemState::Locked {
            *s = BsemState::Unlocked;
            self.wakeup(Channel::Bsem(i));
        }
    }

    /// State of semaphore `handle`, or `None` when out of range.
    pub fn bsem_state(&self, handle: i32) -> Option<BsemState> {
        self.bsems.state(handle)
    }
}
