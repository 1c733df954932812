//! Saved execution contexts and the context switch.
//!
//! A context is a baton slot: the OS thread that owns it runs only while it
//! holds the baton. `swtch` hands the baton (and the CPU that comes with
//! it) to another context and parks until its own baton comes back. A
//! fresh context has no OS thread yet; the first switch into it starts one
//! at its entry point.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::cpu::Cpu;

/// Entry point of a fresh context; receives the CPU it starts on.
pub type Entry = Box<dyn FnOnce(Arc<Cpu>) + Send>;

enum Baton {
    Parked,
    Run(Arc<Cpu>),
    Cancelled,
}

/// Saved execution context of a kernel thread or a scheduler loop.
pub struct Context {
    name: String,
    baton: Mutex<Baton>,
    wake: Condvar,
    entry: Mutex<Option<Entry>>,
}

impl Context {
    /// Context of code that is already running, such as a scheduler loop.
    pub(crate) fn new(name: String) -> Self {
        Self::build(name, None)
    }

    /// Context that starts executing `entry` when first switched to.
    pub(crate) fn with_entry(name: String, entry: Entry) -> Self {
        Self::build(name, Some(entry))
    }

    fn build(name: String, entry: Option<Entry>) -> Self {
        Self {
            name,
            baton: Mutex::new(Baton::Parked),
            wake: Condvar::new(),
            entry: Mutex::new(entry),
        }
    }

    /// Hands the baton to this context.
    fn resume(&self, cpu: Arc<Cpu>) {
        if let Some(entry) = self.entry.lock().take() {
            let spawned = thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || entry(cpu));
            if let Err(err) = spawned {
                panic!("swtch: cannot start {}: {err}", self.name);
            }
            return;
        }
        let mut baton = self.baton.lock();
        if !matches!(*baton, Baton::Cancelled) {
            *baton = Baton::Run(cpu);
        }
        self.wake.notify_one();
    }

    /// Waits for the baton. Returns `None` once the context is cancelled.
    fn park(&self) -> Option<Arc<Cpu>> {
        let mut baton = self.baton.lock();
        loop {
            match core::mem::replace(&mut *baton, Baton::Parked) {
                Baton::Run(cpu) => return Some(cpu),
                Baton::Cancelled => {
                    *baton = Baton::Cancelled;
                    return None;
                }
                Baton::Parked => self.wake.wait(&mut baton),
            }
        }
    }

    /// Retires the context: a parked owner is woken to unwind, a fresh one
    /// never starts.
    pub(crate) fn cancel(&self) {
        if self.entry.lock().take().is_some() {
            return;
        }
        *self.baton.lock() = Baton::Cancelled;
        self.wake.notify_one();
    }

    /// Hands the baton to `self` and returns immediately; used by a context
    /// that is leaving for good.
    pub(crate) fn hand_off(&self, cpu: Arc<Cpu>) {
        self.resume(cpu);
    }
}

/// Switches from `old` to `new`, handing `new` the CPU.
///
/// Returns the CPU `old` was later resumed on, or `None` if `old` was
/// cancelled while parked.
pub(crate) fn swtch(old: &Context, new: &Context, cpu: Arc<Cpu>) -> Option<Arc<Cpu>> {
    new.resume(cpu);
    old.park()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn switch_into_fresh_context_and_back() {
        let cpu = Arc::new(Cpu::new(0));
        let home = Arc::new(Context::new(String::from("home")));
        let (tx, rx) = mpsc::channel();

        let back = home.clone();
        let worker = Arc::new(Context::with_entry(
            String::from("worker"),
            Box::new(move |cpu| {
                tx.send(cpu.id()).unwrap();
                back.hand_off(cpu);
            }),
        ));

        let resumed = swtch(&home, &worker, cpu).expect("scheduler is never cancelled");
        assert_eq!(resumed.id(), 0);
        assert_eq!(rx.recv().unwrap(), 0);
    }

    #[test]
    fn cancelled_context_stops_parking() {
        let ctx = Context::new(String::from("home"));
        ctx.cancel();
        assert!(ctx.park().is_none());
        ctx.resume(Arc::new(Cpu::new(0)));
        assert!(ctx.park().is_none());
    }
}
