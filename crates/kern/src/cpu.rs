//! Per-CPU state and interrupt-disable nesting.
//!
//! Each execution unit is driven by one OS thread at a time. The OS thread
//! currently holding a CPU's baton records it in a thread-local, which plays
//! the role of the hart id register: [`with_cpu`] always sees the CPU the
//! caller is executing on.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::thread::ThreadRef;

/// State of one execution unit.
pub struct Cpu {
    id: usize,
    /// Thread running on this CPU, if any.
    thread: Mutex<Option<ThreadRef>>,
    /// Scheduler loop context; threads switch back to it.
    pub(crate) context: Arc<Context>,
    /// Depth of push_off nesting.
    noff: AtomicUsize,
    /// Were interrupts enabled before the outermost push_off?
    intena: AtomicBool,
    intr: AtomicBool,
    /// Next timer deadline in nanoseconds since boot.
    next_tick: AtomicU64,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            thread: Mutex::new(None),
            context: Arc::new(Context::new(format!("cpu{id}"))),
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            intr: AtomicBool::new(false),
            next_tick: AtomicU64::new(0),
        }
    }

    /// Index of this CPU.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the thread currently running on this CPU.
    pub fn thread(&self) -> Option<ThreadRef> {
        *self.thread.lock()
    }

    pub(crate) fn set_thread(&self, thread: Option<ThreadRef>) {
        *self.thread.lock() = thread;
    }

    pub(crate) fn noff(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub(crate) fn set_intena(&self, on: bool) {
        self.intena.store(on, Ordering::Relaxed);
    }

    pub(crate) fn intr_get(&self) -> bool {
        self.intr.load(Ordering::Relaxed)
    }

    pub(crate) fn intr_on(&self) {
        self.intr.store(true, Ordering::Relaxed);
    }

    pub(crate) fn intr_off(&self) {
        self.intr.store(false, Ordering::Relaxed);
    }

    /// Consumes a timer interrupt if `now` has reached the deadline.
    pub(crate) fn timer_due(&self, now: u64, interval: u64) -> bool {
        let deadline = self.next_tick.load(Ordering::Relaxed);
        if now < deadline {
            return false;
        }
        self.next_tick.store(now + interval, Ordering::Relaxed);
        true
    }

    fn push_off(&self) {
        let old = self.intr_get();
        self.intr_off();
        if self.noff.load(Ordering::Relaxed) == 0 {
            self.intena.store(old, Ordering::Relaxed);
        }
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_off(&self) {
        if self.intr_get() {
            panic!("pop_off: cpu{} interruptible", self.id);
        }
        let depth = self.noff.load(Ordering::Relaxed);
        if depth == 0 {
            panic!("pop_off: cpu{} not pushed", self.id);
        }
        self.noff.store(depth - 1, Ordering::Relaxed);
        if depth == 1 && self.intena() {
            self.intr_on();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Cpu>>> = const { RefCell::new(None) };
}

/// Binds the calling OS thread to `cpu` (or unbinds it).
pub(crate) fn set_current(cpu: Option<Arc<Cpu>>) {
    CURRENT.with(|c| *c.borrow_mut() = cpu);
}

/// Returns the CPU the calling OS thread executes on.
pub(crate) fn mycpu() -> Option<Arc<Cpu>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Runs `f` against the current CPU, if the caller is on one.
pub(crate) fn with_cpu<R>(f: impl FnOnce(&Cpu) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_deref().map(f))
}

pub(crate) fn cpuid() -> Option<usize> {
    with_cpu(Cpu::id)
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Host threads
/// that are not bound to a CPU have no interrupts to mask.
pub(crate) fn push_off() {
    with_cpu(Cpu::push_off);
}

pub(crate) fn pop_off() {
    with_cpu(Cpu::pop_off);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_off_restores_interrupts_once() {
        let cpu = Arc::new(Cpu::new(0));
        set_current(Some(cpu.clone()));
        cpu.intr_on();

        push_off();
        push_off();
        assert!(!cpu.intr_get());
        assert_eq!(cpu.noff(), 2);

        pop_off();
        assert!(!cpu.intr_get());
        pop_off();
        assert!(cpu.intr_get());
        assert_eq!(cpu.noff(), 0);

        set_current(None);
    }

    #[test]
    fn unbound_threads_have_no_cpu() {
        set_current(None);
        assert!(cpuid().is_none());
        push_off();
        pop_off();
    }

    #[test]
    fn timer_fires_once_per_interval() {
        let cpu = Cpu::new(1);
        assert!(cpu.timer_due(10, 5));
        assert!(!cpu.timer_due(12, 5));
        assert!(cpu.timer_due(15, 5));
    }
}
