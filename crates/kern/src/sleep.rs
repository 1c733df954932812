//! Sleep and wakeup on typed channels.

use crate::kernel::Kernel;
use crate::sync::SpinlockGuard;
use crate::thread::{ThreadRef, ThreadState};

/// What a sleeping thread waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A child of the process in this slot changed state.
    Proc(usize),
    /// The thread exited.
    Thread(ThreadRef),
    /// The binary semaphore with this handle was released.
    Bsem(usize),
    /// The tick counter advanced.
    Ticks,
}

impl Channel {
    /// Process whose threads are the only possible sleepers, if known.
    ///
    /// `wait` sleeps on its own process and `join` on a sibling, so both
    /// reasons only ever match threads of one process.
    fn sleepers_in(self) -> Option<usize> {
        match self {
            Self::Proc(p) => Some(p),
            Self::Thread(t) => Some(t.proc),
            Self::Bsem(_) | Self::Ticks => None,
        }
    }
}

impl Kernel {
    /// Atomically releases `guard` and sleeps on `chan`; reacquires the
    /// lock when awakened.
    ///
    /// Once the thread's own lock is held no wakeup can be missed, since
    /// wakeup locks each thread before inspecting it.
    pub(crate) fn sleep<'a, T>(
        &self,
        cur: ThreadRef,
        chan: Channel,
        guard: SpinlockGuard<'a, T>,
    ) -> SpinlockGuard<'a, T> {
        let lk = SpinlockGuard::spinlock(&guard);
        let mut t = self.thread(cur).lock.lock();
        drop(guard);

        t.chan = Some(chan);
        t.state = ThreadState::Sleeping;
        let mut t = self.sched(cur, t);
        t.chan = None;
        drop(t);

        lk.lock()
    }

    /// Wakes every thread sleeping on `chan`.
    ///
    /// Must be called without holding any thread lock.
    pub(crate) fn wakeup(&self, chan: Channel) {
        let procs = match chan.sleepers_in() {
            Some(p) => p..p + 1,
            None => 0..self.procs.len(),
        };
        for p in &self.procs[procs] {
            for t in p.threads.iter() {
                let mut t = t.lock.lock();
                if t.state == ThreadState::Sleeping && t.chan == Some(chan) {
                    t.state = ThreadState::Runnable;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_and_joins_narrow_to_one_process() {
        let t = ThreadRef { proc: 3, slot: 1 };
        assert_eq!(Channel::Proc(2).sleepers_in(), Some(2));
        assert_eq!(Channel::Thread(t).sleepers_in(), Some(3));
        assert_eq!(Channel::Bsem(2).sleepers_in(), None);
        assert_eq!(Channel::Ticks.sleepers_in(), None);
    }
}
