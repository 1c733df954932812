//! Threads: the unit of scheduling.
//!
//! Each process owns a fixed array of thread slots. A slot is reused once
//! its thread has been joined or its process reaped; the slot index is the
//! thread's stable handle inside the kernel, the tid is what user code sees.

use std::sync::{Arc, Weak};

use log::{debug, trace};

use crate::context::Context;
use crate::error::{KernelError, KernelResult};
use crate::hal::PageFrame;
use crate::kernel::Kernel;
use crate::proc::ProcInner;
use crate::signal::HandlerState;
use crate::sleep::Channel;
use crate::sync::{Spinlock, SpinlockGuard};
use crate::text::UserAddr;

/// Thread id as seen by user code.
pub type Tid = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreadState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Location of a thread slot: process slot and thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef {
    pub proc: usize,
    pub slot: usize,
}

/// Thread fields; only touched with the thread's lock held.
pub(crate) struct ThreadInner {
    pub state: ThreadState,
    pub tid: Tid,
    pub xstate: i32,
    pub killed: bool,
    /// Valid only while Sleeping.
    pub chan: Option<Channel>,
    pub handler: HandlerState,
    pub context: Arc<Context>,
    pub backup_page: Option<PageFrame>,
    /// User address of the frame saved by the running signal handler.
    pub backup: u64,
}

impl ThreadInner {
    fn unused() -> Self {
        Self {
            state: ThreadState::Unused,
            tid: 0,
            xstate: 0,
            killed: false,
            chan: None,
            handler: HandlerState::Idle,
            context: Arc::new(Context::new(String::from("unused"))),
            backup_page: None,
            backup: 0,
        }
    }

    /// Allocated and not yet exited.
    pub fn is_live(&self) -> bool {
        !matches!(self.state, ThreadState::Unused | ThreadState::Zombie)
    }
}

/// A thread slot.
pub struct Thread {
    pub(crate) lock: Spinlock<ThreadInner>,
}

impl Thread {
    pub(crate) fn new() -> Self {
        Self {
            lock: Spinlock::new("thread", ThreadInner::unused()),
        }
    }
}

impl Kernel {
    /// Claims an Unused thread slot of process `proc`.
    ///
    /// The caller holds the process lock. The new thread starts at the
    /// kernel entry stub when first scheduled; its trap frame is the slot's
    /// region of the process trap frame page. Returns with the thread lock
    /// held, or `None` with nothing left allocated.
    pub(crate) fn allocthread<'a>(
        &'a self,
        proc: usize,
        _p: &mut ProcInner,
    ) -> Option<(usize, SpinlockGuard<'a, ThreadInner>)> {
        for (slot, t) in self.procs[proc].threads.iter().enumerate() {
            let mut g = t.lock.lock();
            if g.state != ThreadState::Unused {
                continue;
            }
            g.tid = self.tids.next();
            g.state = ThreadState::Used;
            g.xstate = 0;
            g.killed = false;
            g.chan = None;
            g.handler = HandlerState::Idle;
            g.backup = 0;

            match self.machine.alloc_page() {
                Some(page) => g.backup_page = Some(page),
                None => {
                    self.freethread(&mut g);
                    return None;
                }
            }

            let cur = ThreadRef { proc, slot };
            let kernel: Weak<Kernel> = self.me.clone();
            g.context = Arc::new(Context::with_entry(
                format!("{}-tid{}", self.config.name, g.tid),
                Box::new(move |cpu| {
                    if let Some(kernel) = kernel.upgrade() {
                        kernel.thread_entry(cpu, cur);
                    }
                }),
            ));
            trace!("allocthread: tid {} in slot {proc}.{slot}", g.tid);
            return Some((slot, g));
        }
        None
    }

    /// Returns a thread slot to Unused, releasing its backup page and
    /// retiring its execution context.
    pub(crate) fn freethread(&self, t: &mut ThreadInner) {
        if let Some(page) = t.backup_page.take() {
            self.machine.free_page(page);
        }
        t.context.cancel();
        t.context = Arc::new(Context::new(String::from("unused")));
        t.tid = 0;
        t.xstate = 0;
        t.killed = false;
        t.chan = None;
        t.handler = HandlerState::Idle;
        t.backup = 0;
        t.state = ThreadState::Unused;
    }

    /// Creates a sibling of `cur` that starts at `entry` on `stack`.
    pub fn kthread_create(&self, cur: ThreadRef, entry: UserAddr, stack: u64) -> KernelResult<Tid> {
        if entry == 0 || stack == 0 {
            return Err(KernelError::InvalidArgument("null thread entry or stack"));
        }
        let sp = stack
            .checked_add(self.config.thread_stack_size)
            .and_then(|top| top.checked_sub(16))
            .ok_or(KernelError::InvalidArgument("thread stack out of range"))?;
        let mut p = self.proc(cur.proc).lock.lock();
        let (slot, mut t) = self
            .allocthread(cur.proc, &mut p)
            .ok_or(KernelError::NoFreeThread)?;

        let mut tf = p.trapframe(cur.slot);
        tf.epc = entry;
        tf.sp = sp;
        p.set_trapframe(slot, &tf);

        t.state = ThreadState::Runnable;
        let tid = t.tid;
        debug!("kthread_create: pid {} tid {tid} at {entry:#x}", p.pid);
        Ok(tid)
    }

    /// Returns the tid of `cur`.
    pub fn kthread_id(&self, cur: ThreadRef) -> Tid {
        self.thread(cur).lock.lock().tid
    }

    /// Terminates the calling thread. The last live thread of a process
    /// takes the whole process down with it.
    pub fn kthread_exit(&self, cur: ThreadRef, status: i32) -> ! {
        let p = self.proc(cur.proc);
        let g = p.lock.lock();
        if g.exiting {
            drop(g);
            self.vanish(cur);
        }

        // Counting and retiring under the process lock keeps two last
        // threads from each seeing the other alive.
        let siblings = p
            .threads
            .iter()
            .enumerate()
            .filter(|(slot, _)| *slot != cur.slot)
            .filter(|(_, t)| t.lock.lock().is_live())
            .count();
        if siblings == 0 {
            drop(g);
            self.exit(cur, status);
        }

        // Joiners are woken by the scheduler once this thread is off the
        // CPU, so a joiner never reclaims a slot that is still running.
        let mut t = self.thread(cur).lock.lock();
        t.xstate = status;
        t.state = ThreadState::Zombie;
        drop(g);
        debug!("kthread_exit: tid {} status {status}", t.tid);
        self.sched_final(t)
    }

    /// Waits for sibling `tid` to exit and reclaims it.
    ///
    /// The exit status is copied to `status_addr` when given.
    pub fn kthread_join(&self, cur: ThreadRef, tid: Tid, status_addr: Option<u64>) -> KernelResult<()> {
        let p = self.proc(cur.proc);
        let space = p.lock.lock().space()?;

        let found = p.threads.iter().enumerate().find_map(|(slot, t)| {
            if slot == cur.slot {
                return None;
            }
            let g = t.lock.lock();
            (g.tid == tid && g.state != ThreadState::Unused).then_some((slot, g))
        });
        let Some((slot, mut t)) = found else {
            return Err(KernelError::NoSuchThread(tid));
        };

        let target = ThreadRef { proc: cur.proc, slot };
        while t.state != ThreadState::Zombie {
            t = self.sleep(cur, Channel::Thread(target), t);
        }

        if let Some(addr) = status_addr {
            self.machine.copy_out(space, addr, &t.xstate.to_le_bytes())?;
        }
        debug!("kthread_join: tid {tid} status {}", t.xstate);
        self.freethread(&mut t);
        Ok(())
    }

    /// Ends the calling thread without touching its process, for a thread
    /// whose process is already being torn down by a sibling.
    pub(crate) fn vanish(&self, cur: ThreadRef) -> ! {
        let mut t = self.thread(cur).lock.lock();
        t.killed = true;
        t.state = ThreadState::Zombie;
        self.sched_final(t)
    }
}
