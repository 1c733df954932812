//! Per-CPU round-robin scheduler and the switch into and out of threads.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use log::{error, trace};

use crate::context::swtch;
use crate::cpu::{self, Cpu};
use crate::kernel::Kernel;
use crate::proc::ProcState;
use crate::sleep::Channel;
use crate::sync::SpinlockGuard;
use crate::thread::{ThreadInner, ThreadRef, ThreadState};
use crate::trap::RunMode;

/// Unwind payload that ends a thread's execution context.
pub(crate) struct ThreadExit;

impl Kernel {
    /// Scheduler loop of CPU `id`; runs until the kernel halts.
    ///
    /// Each pass visits every thread of every live process in table order
    /// and runs the runnable ones until they give the CPU back.
    pub(crate) fn scheduler(&self, id: usize) {
        let c = Arc::clone(&self.cpus[id]);
        cpu::set_current(Some(Arc::clone(&c)));
        c.set_thread(None);
        trace!("cpu{id}: scheduling");

        while !self.is_halted() {
            // Avoid deadlock by letting devices interrupt.
            c.intr_on();
            self.devintr();

            let mut ran = false;
            for (pi, p) in self.procs.iter().enumerate() {
                if p.lock.lock().state != ProcState::Used {
                    continue;
                }
                for slot in 0..p.threads.len() {
                    ran |= self.run_thread(&c, ThreadRef { proc: pi, slot });
                }
                if self.is_halted() {
                    break;
                }
            }
            if !ran {
                thread::sleep(self.config.idle_backoff);
            }
        }
        cpu::set_current(None);
        trace!("cpu{id}: halted");
    }

    /// Runs `tref` on `c` if it is runnable. Returns whether it ran.
    fn run_thread(&self, c: &Arc<Cpu>, tref: ThreadRef) -> bool {
        let mut t = self.thread(tref).lock.lock();
        if t.state != ThreadState::Runnable {
            return false;
        }
        // The thread releases its lock once it is running and reacquires it
        // before jumping back here.
        t.state = ThreadState::Running;
        c.set_thread(Some(tref));
        let ctx = Arc::clone(&t.context);
        let _ = swtch(&c.context, &ctx, Arc::clone(c));

        c.set_thread(None);
        let state = t.state;
        let killed = t.killed;
        drop(t);

        // Only now is the thread off every CPU and safe to reclaim.
        if state == ThreadState::Zombie {
            self.wakeup(Channel::Thread(tref));
        }
        if state == ThreadState::Zombie || killed {
            self.notify_reaper(tref.proc);
        }
        true
    }

    /// Checks the conditions for leaving the CPU and returns it.
    fn switch_checks(&self, t: &SpinlockGuard<'_, ThreadInner>) -> Arc<Cpu> {
        let Some(c) = cpu::mycpu() else {
            self.panic("sched: no cpu");
        };
        if !SpinlockGuard::spinlock(t).holding() {
            self.panic("sched t->lock");
        }
        if c.noff() != 1 {
            self.panic("sched locks");
        }
        if t.state == ThreadState::Running {
            self.panic("sched running");
        }
        if c.intr_get() {
            self.panic("sched interruptible");
        }
        c
    }

    /// Switches from the calling thread to the scheduler and returns once
    /// the thread is scheduled again, possibly on another CPU.
    ///
    /// The caller holds only its own thread lock and has already changed
    /// its state.
    pub(crate) fn sched<'a>(
        &self,
        cur: ThreadRef,
        t: SpinlockGuard<'a, ThreadInner>,
    ) -> SpinlockGuard<'a, ThreadInner> {
        let c = self.switch_checks(&t);
        let intena = c.intena();
        let ctx = Arc::clone(&t.context);
        let sched_ctx = Arc::clone(&c.context);
        match swtch(&ctx, &sched_ctx, c) {
            Some(c) => {
                cpu::set_current(Some(Arc::clone(&c)));
                c.set_intena(intena);
                t
            }
            None => {
                // The slot was reclaimed while the thread was parked; its
                // lock now belongs to whoever freed it.
                trace!("sched: slot {}.{} retired", cur.proc, cur.slot);
                mem::forget(t);
                cpu::set_current(None);
                panic::resume_unwind(Box::new(ThreadExit))
            }
        }
    }

    /// Leaves the CPU for good. The scheduler releases `t` after the switch.
    pub(crate) fn sched_final(&self, t: SpinlockGuard<'_, ThreadInner>) -> ! {
        let c = self.switch_checks(&t);
        mem::forget(t);
        cpu::set_current(None);
        let sched_ctx = Arc::clone(&c.context);
        sched_ctx.hand_off(c);
        panic::resume_unwind(Box::new(ThreadExit))
    }

    /// Gives up the CPU for one scheduling round.
    pub(crate) fn yield_now(&self, cur: ThreadRef) {
        let mut t = self.thread(cur).lock.lock();
        t.state = ThreadState::Runnable;
        drop(self.sched(cur, t));
    }

    /// First code a new thread runs, on the CPU that scheduled it.
    pub(crate) fn thread_entry(&self, c: Arc<Cpu>, cur: ThreadRef) {
        cpu::set_current(Some(c));
        // Still holding the thread lock from the scheduler.
        // SAFETY: the scheduler locked it on this CPU before switching here.
        unsafe { self.thread(cur).lock.force_unlock() };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.usertrapret(cur);
            self.run_user(cur, RunMode::Thread);
        }));
        if let Err(payload) = outcome {
            if !payload.is::<ThreadExit>() {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("thread panicked"));
                error!("slot {}.{}: {reason}", cur.proc, cur.slot);
                self.record_halt(&reason);
                // Let the scheduler of this CPU see the halt and stop.
                if let Some(c) = cpu::mycpu() {
                    cpu::set_current(None);
                    let sched_ctx = Arc::clone(&c.context);
                    sched_ctx.hand_off(c);
                    return;
                }
            }
        }
        cpu::set_current(None);
    }
}
