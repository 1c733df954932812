//! Traps from user code, the return path to it, and the timer.
//!
//! User code is executed by [`Kernel::run_user`], which plays the part of the
//! hart: it fetches the saved pc of the current thread and runs whatever is
//! there. A registered text entry is called; the signal trampoline traps
//! into `sigret`; anything else faults. Before each return to user code the
//! thread passes the checkpoint in [`Kernel::usertrapret`], where signals
//! are delivered and kills take effect.

use log::warn;

use crate::cpu;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::signal::{HandlerState, SIGRET_TRAMPOLINE};
use crate::sleep::Channel;
use crate::syscall::{Sysno, UserContext};
use crate::text::UserAddr;
use crate::thread::ThreadRef;

/// Why `run_user` is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    /// The thread's own code; never returns.
    Thread,
    /// A signal handler nested in a system call; returns after `sigret`.
    Handler,
}

impl Kernel {
    /// Executes user code of `cur` starting at its saved pc.
    pub(crate) fn run_user(&self, cur: ThreadRef, mode: RunMode) {
        loop {
            if mode == RunMode::Handler && self.thread(cur).lock.lock().handler == HandlerState::Idle {
                return;
            }
            let tf = self.proc(cur.proc).lock.lock().trapframe(cur.slot);
            let pc = tf.epc;

            // Returning from the outermost function ends the thread.
            if pc == 0 {
                self.kthread_exit(cur, 0);
            }

            if let Some(f) = self.text.lookup(pc) {
                {
                    let mut t = self.thread(cur).lock.lock();
                    if t.handler == HandlerState::Pending {
                        t.handler = HandlerState::Running;
                    }
                }
                f(&mut UserContext::new(self, cur, tf.a0));

                // ret
                let mut p = self.proc(cur.proc).lock.lock();
                let mut tf = p.trapframe(cur.slot);
                tf.epc = tf.ra;
                p.set_trapframe(cur.slot, &tf);
            } else if self.at_trampoline(cur, pc) {
                self.ecall(cur, Sysno::Sigret, &[], None);
            } else {
                warn!("pid {}: bad pc {pc:#x}", self.getpid(cur));
                self.proc(cur.proc).lock.lock().killed = true;
                self.usertrapret(cur);
            }
        }
    }

    fn at_trampoline(&self, cur: ThreadRef, pc: UserAddr) -> bool {
        let Some(space) = self.proc(cur.proc).lock.lock().space else {
            return false;
        };
        let mut code = vec![0u8; SIGRET_TRAMPOLINE.code.len()];
        self.machine.copy_in(space, &mut code, pc).is_ok() && SIGRET_TRAMPOLINE.matches(&code)
    }

    /// Traps into the kernel with system call `num` and returns `a0`.
    ///
    /// `resume` replaces the saved pc first, for calls like `fork` whose
    /// result is observed at a different place than the call site. A
    /// handler installed on the way out runs before this returns.
    pub(crate) fn ecall(&self, cur: ThreadRef, num: Sysno, args: &[u64], resume: Option<UserAddr>) -> u64 {
        {
            let mut p = self.proc(cur.proc).lock.lock();
            let mut tf = p.trapframe(cur.slot);
            tf.set_args(args);
            tf.a7 = num as u64;
            if let Some(pc) = resume {
                tf.epc = pc;
            }
            p.set_trapframe(cur.slot, &tf);
        }
        self.usertrap(cur);
        if self.thread(cur).lock.lock().handler == HandlerState::Pending {
            self.run_user(cur, RunMode::Handler);
        }
        self.proc(cur.proc).lock.lock().trapframe(cur.slot).a0
    }

    /// Handles a trap from user code of `cur`.
    pub(crate) fn usertrap(&self, cur: ThreadRef) {
        if self.proc(cur.proc).lock.lock().killed {
            self.exit(cur, -1);
        }
        self.syscall(cur);
        // Give up the CPU if this is a timer interrupt.
        if self.devintr() {
            self.yield_now(cur);
        }
        self.usertrapret(cur);
    }

    /// Checkpoint on every return to user code: delivers signals, carries
    /// out kills and holds frozen processes.
    pub(crate) fn usertrapret(&self, cur: ThreadRef) {
        loop {
            self.handle_signals(cur);
            if self.thread(cur).lock.lock().killed {
                self.kthread_exit(cur, -1);
            }
            if self.proc(cur.proc).lock.lock().killed {
                self.exit(cur, -1);
            }
            if !self.proc(cur.proc).lock.lock().signals.frozen {
                return;
            }
            self.yield_now(cur);
        }
    }

    /// Polls the timer of the current CPU. Returns whether it fired.
    pub(crate) fn devintr(&self) -> bool {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let interval = self.config.tick.as_nanos() as u64;
        let fired = cpu::with_cpu(|c| (c.id(), c.timer_due(now, interval)));
        match fired {
            Some((0, true)) => {
                self.clockintr();
                true
            }
            Some((_, due)) => due,
            None => false,
        }
    }

    fn clockintr(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.wakeup(Channel::Ticks);
        drop(ticks);
    }

    /// Sleeps the calling thread for `n` ticks.
    pub fn sleep_ticks(&self, cur: ThreadRef, n: u64) -> KernelResult<()> {
        let mut ticks = self.ticks.lock();
        let start = *ticks;
        while *ticks - start < n {
            if self.doomed(cur.proc) || self.thread(cur).lock.lock().killed {
                return Err(KernelError::Killed);
            }
            ticks = self.sleep(cur, Channel::Ticks, ticks);
        }
        Ok(())
    }
}
