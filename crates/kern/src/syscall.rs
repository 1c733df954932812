//! System call numbers, dispatch, and the user-side calling surface.
//!
//! Arguments travel in `a0..a5` of the caller's trap frame, the call number
//! in `a7`, and the result comes back in `a0`; `-1` reports any failure.

use log::{debug, warn};
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::proc::Pid;
use crate::text::UserAddr;
use crate::thread::{ThreadRef, Tid};
use crate::trapframe::TrapFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Sysno {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Sigprocmask = 22,
    Sigaction = 23,
    Sigret = 24,
    KthreadCreate = 25,
    KthreadId = 26,
    KthreadExit = 27,
    KthreadJoin = 28,
    BsemAlloc = 29,
    BsemFree = 30,
    BsemDown = 31,
    BsemUp = 32,
}

impl TryFrom<u64> for Sysno {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Fork,
            2 => Self::Exit,
            3 => Self::Wait,
            6 => Self::Kill,
            11 => Self::Getpid,
            12 => Self::Sbrk,
            13 => Self::Sleep,
            14 => Self::Uptime,
            22 => Self::Sigprocmask,
            23 => Self::Sigaction,
            24 => Self::Sigret,
            25 => Self::KthreadCreate,
            26 => Self::KthreadId,
            27 => Self::KthreadExit,
            28 => Self::KthreadJoin,
            29 => Self::BsemAlloc,
            30 => Self::BsemFree,
            31 => Self::BsemDown,
            32 => Self::BsemUp,
            other => return Err(other),
        })
    }
}

fn user_ptr(raw: u64) -> Option<UserAddr> {
    (raw != 0).then_some(raw)
}

impl Kernel {
    /// Runs the system call named in the trap frame of `cur` and stores the
    /// result in its `a0`.
    pub(crate) fn syscall(&self, cur: ThreadRef) {
        let tf = self.proc(cur.proc).lock.lock().trapframe(cur.slot);
        let ret = match Sysno::try_from(tf.a7) {
            Ok(num) => self.dispatch(cur, num, &tf).unwrap_or_else(|err| {
                debug!("{num:?}: {err}");
                -1
            }),
            Err(num) => {
                warn!("pid {}: unknown sys call {num}", self.getpid(cur));
                -1
            }
        };
        let mut p = self.proc(cur.proc).lock.lock();
        let mut tf = p.trapframe(cur.slot);
        tf.a0 = ret as u64;
        p.set_trapframe(cur.slot, &tf);
    }

    fn dispatch(&self, cur: ThreadRef, num: Sysno, tf: &TrapFrame) -> KernelResult<i64> {
        let int = |n: usize| tf.arg(n) as i32;
        Ok(match num {
            Sysno::Fork => self.fork(cur)?.into(),
            Sysno::Exit => self.exit(cur, int(0)),
            Sysno::Wait => self.wait(cur, user_ptr(tf.a0))?.into(),
            Sysno::Kill => {
                self.kill(int(0), int(1))?;
                0
            }
            Sysno::Getpid => self.getpid(cur).into(),
            Sysno::Sbrk => self.growproc(cur, tf.a0 as i64)? as i64,
            Sysno::Sleep => {
                self.sleep_ticks(cur, int(0).max(0) as u64)?;
                0
            }
            Sysno::Uptime => self.ticks() as i64,
            Sysno::Sigprocmask => self.sigprocmask(cur, int(0))?.into(),
            Sysno::Sigaction => {
                self.sys_sigaction(cur, int(0), tf.a1, user_ptr(tf.a2))?;
                0
            }
            Sysno::Sigret => {
                // Restores the whole frame; a0 is written back unchanged.
                self.sigret(cur);
                self.proc(cur.proc).lock.lock().trapframe(cur.slot).a0 as i64
            }
            Sysno::KthreadCreate => self.kthread_create(cur, tf.a0, tf.a1)?.into(),
            Sysno::KthreadId => self.kthread_id(cur).into(),
            Sysno::KthreadExit => self.kthread_exit(cur, int(0)),
            Sysno::KthreadJoin => {
                self.kthread_join(cur, int(0), user_ptr(tf.a1))?;
                0
            }
            Sysno::BsemAlloc => self.bsem_alloc()?.into(),
            Sysno::BsemFree => {
                self.bsem_free(int(0));
                0
            }
            Sysno::BsemDown => {
                self.bsem_down(cur, int(0));
                0
            }
            Sysno::BsemUp => {
                self.bsem_up(int(0));
                0
            }
        })
    }
}

/// A system call returned `-1`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{0:?} failed")]
pub struct SysError(pub Sysno);

/// Result of a system call made from user code.
pub type SysResult<T> = Result<T, SysError>;

/// What user code can do: make system calls and touch its own memory.
///
/// Handed to every user function; `arg` is the value of `a0` on entry,
/// which is the signal number for a handler and zero in a forked child.
pub struct UserContext<'k> {
    kernel: &'k Kernel,
    cur: ThreadRef,
    arg: u64,
}

impl<'k> UserContext<'k> {
    pub(crate) fn new(kernel: &'k Kernel, cur: ThreadRef, arg: u64) -> Self {
        Self { kernel, cur, arg }
    }

    /// Value of `a0` when the function was entered.
    pub fn arg(&self) -> u64 {
        self.arg
    }

    /// The kernel, for inspection only.
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// Kernel-side handle of the calling thread.
    pub fn thread(&self) -> ThreadRef {
        self.cur
    }

    fn call(&mut self, num: Sysno, args: &[u64]) -> SysResult<i64> {
        let ret = self.kernel.ecall(self.cur, num, args, None) as i64;
        if ret < 0 {
            Err(SysError(num))
        } else {
            Ok(ret)
        }
    }

    /// Forks the process. The parent gets the child's pid; the child starts
    /// over at `resume` with `arg() == 0`.
    pub fn fork(&mut self, resume: UserAddr) -> SysResult<Pid> {
        let ret = self.kernel.ecall(self.cur, Sysno::Fork, &[], Some(resume)) as i64;
        if ret < 0 {
            return Err(SysError(Sysno::Fork));
        }
        Ok(ret as Pid)
    }

    /// Exits the process with `status`.
    pub fn exit(&mut self, status: i32) -> ! {
        self.kernel.ecall(self.cur, Sysno::Exit, &[status as u64], None);
        unreachable!("exit returned");
    }

    /// Waits for a child; its status is stored at `status` when given.
    pub fn wait(&mut self, status: Option<UserAddr>) -> SysResult<Pid> {
        self.call(Sysno::Wait, &[status.unwrap_or(0)]).map(|pid| pid as Pid)
    }

    /// Sends `signum` to process `pid`.
    pub fn kill(&mut self, pid: Pid, signum: i32) -> SysResult<()> {
        self.call(Sysno::Kill, &[pid as u64, signum as u64]).map(drop)
    }

    /// Pid of the calling process.
    pub fn getpid(&mut self) -> Pid {
        self.call(Sysno::Getpid, &[]).map_or(-1, |pid| pid as Pid)
    }

    /// Grows memory by `n` bytes; returns the start of the new region.
    pub fn sbrk(&mut self, n: i64) -> SysResult<UserAddr> {
        self.call(Sysno::Sbrk, &[n as u64]).map(|old| old as UserAddr)
    }

    /// Sleeps for `ticks` timer ticks; fails early once killed.
    pub fn sleep(&mut self, ticks: i32) -> SysResult<()> {
        self.call(Sysno::Sleep, &[ticks as u64]).map(drop)
    }

    /// Ticks since boot.
    pub fn uptime(&mut self) -> u64 {
        self.call(Sysno::Uptime, &[]).map_or(0, |t| t as u64)
    }

    /// Replaces the signal mask; returns the old one.
    pub fn sigprocmask(&mut self, mask: i32) -> SysResult<u32> {
        self.call(Sysno::Sigprocmask, &[mask as u32 as u64]).map(|old| old as u32)
    }

    /// Installs the [`SigAction`](crate::signal::SigAction) stored at `act`,
    /// saving the previous one at `oldact` when given.
    pub fn sigaction(&mut self, signum: i32, act: UserAddr, oldact: Option<UserAddr>) -> SysResult<()> {
        self.call(Sysno::Sigaction, &[signum as u64, act, oldact.unwrap_or(0)])
            .map(drop)
    }

    /// Returns from a signal handler. Normally reached through the
    /// trampoline rather than called directly.
    pub fn sigret(&mut self) {
        self.kernel.ecall(self.cur, Sysno::Sigret, &[], None);
    }

    /// Starts a sibling thread at `start` using the `stack` block.
    pub fn kthread_create(&mut self, start: UserAddr, stack: UserAddr) -> SysResult<Tid> {
        self.call(Sysno::KthreadCreate, &[start, stack]).map(|tid| tid as Tid)
    }

    /// Tid of the calling thread.
    pub fn kthread_id(&mut self) -> Tid {
        self.call(Sysno::KthreadId, &[]).map_or(-1, |tid| tid as Tid)
    }

    /// Ends the calling thread with `status`.
    pub fn kthread_exit(&mut self, status: i32) -> ! {
        self.kernel.ecall(self.cur, Sysno::KthreadExit, &[status as u64], None);
        unreachable!("kthread_exit returned");
    }

    /// Waits for sibling `tid`; its status is stored at `status` when given.
    pub fn kthread_join(&mut self, tid: Tid, status: Option<UserAddr>) -> SysResult<()> {
        self.call(Sysno::KthreadJoin, &[tid as u64, status.unwrap_or(0)])
            .map(drop)
    }

    /// Allocates a binary semaphore.
    pub fn bsem_alloc(&mut self) -> SysResult<i32> {
        self.call(Sysno::BsemAlloc, &[]).map(|h| h as i32)
    }

    /// Frees a binary semaphore.
    pub fn bsem_free(&mut self, handle: i32) {
        let _ = self.call(Sysno::BsemFree, &[handle as u64]);
    }

    /// Locks a binary semaphore, blocking while it is locked.
    pub fn bsem_down(&mut self, handle: i32) {
        let _ = self.call(Sysno::BsemDown, &[handle as u64]);
    }

    /// Unlocks a binary semaphore.
    pub fn bsem_up(&mut self, handle: i32) {
        let _ = self.call(Sysno::BsemUp, &[handle as u64]);
    }

    /// Loads from user memory. A bad address is a fault that kills the
    /// process.
    pub fn load(&mut self, addr: UserAddr, buf: &mut [u8]) {
        let space = self.kernel.proc(self.cur.proc).lock.lock().space;
        let loaded = space.map(|s| self.kernel.machine.copy_in(s, buf, addr));
        if !matches!(loaded, Some(Ok(()))) {
            self.fault(addr);
        }
    }

    /// Stores to user memory. A bad address is a fault that kills the
    /// process.
    pub fn store(&mut self, addr: UserAddr, bytes: &[u8]) {
        let space = self.kernel.proc(self.cur.proc).lock.lock().space;
        let stored = space.map(|s| self.kernel.machine.copy_out(s, addr, bytes));
        if !matches!(stored, Some(Ok(()))) {
            self.fault(addr);
        }
    }

    /// Reads a `T` from user memory.
    pub fn read<T: FromBytes + AsBytes>(&mut self, addr: UserAddr) -> T {
        let mut value = T::new_zeroed();
        self.load(addr, value.as_bytes_mut());
        value
    }

    /// Writes `value` to user memory.
    pub fn write<T: AsBytes>(&mut self, addr: UserAddr, value: &T) {
        self.store(addr, value.as_bytes());
    }

    fn fault(&mut self, addr: UserAddr) -> ! {
        warn!("pid {}: page fault at {addr:#x}", self.kernel.getpid(self.cur));
        self.kernel.proc(self.cur.proc).lock.lock().killed = true;
        self.kernel.usertrapret(self.cur);
        unreachable!("killed process returned to user code");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip_through_a7() {
        for num in [Sysno::Fork, Sysno::Sigret, Sysno::KthreadJoin, Sysno::BsemUp] {
            assert_eq!(Sysno::try_from(num as u64), Ok(num));
        }
        assert_eq!(Sysno::try_from(24), Ok(Sysno::Sigret));
        assert_eq!(Sysno::try_from(4), Err(4));
        assert_eq!(Sysno::try_from(33), Err(33));
    }

    #[test]
    fn null_user_pointers_are_absent() {
        assert_eq!(user_ptr(0), None);
        assert_eq!(user_ptr(0x100), Some(0x100));
    }
}
