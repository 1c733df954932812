//! Signals: pending bits, block mask and per-signal dispositions.
//!
//! A process has one pending bit per signal number. Pending signals are
//! delivered when one of its threads returns to user code. Delivery either
//! acts inside the kernel (kill, stop, continue, ignore) or diverts the
//! thread into a user handler: the interrupted registers are pushed onto the
//! user stack, the return trampoline below them, and the thread resumes in
//! the handler with the return address pointing at the trampoline.
//!
//! `SIGKILL` and `SIGSTOP` can neither be blocked nor given another
//! disposition.

use log::{debug, trace, warn};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::proc::{Pid, ProcInner, ProcState};
use crate::text::UserAddr;
use crate::thread::{ThreadRef, ThreadState};
use crate::trapframe::{TrapFrame, TRAPFRAME_SIZE};

/// Number of signals.
pub const NSIG: usize = 32;

/// Handler values with a fixed meaning.
pub const SIG_DFL: u64 = 0;
/// Handler value that ignores the signal.
pub const SIG_IGN: u64 = 1;

/// Kills the process; cannot be blocked or rehandled.
pub const SIGKILL: i32 = 9;
/// Freezes the process; cannot be blocked or rehandled.
pub const SIGSTOP: i32 = 17;
/// Thaws a frozen process.
pub const SIGCONT: i32 = 19;

const fn bit(signum: i32) -> u32 {
    1 << signum
}

const UNBLOCKABLE: u32 = bit(SIGKILL) | bit(SIGSTOP);

/// What delivering a signal does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
    Kill,
    Stop,
    Continue,
    Handler(UserAddr),
}

impl Disposition {
    /// Decodes a handler value as stored in a [`SigAction`].
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            SIG_DFL => Self::Default,
            SIG_IGN => Self::Ignore,
            9 => Self::Kill,
            17 => Self::Stop,
            19 => Self::Continue,
            addr => Self::Handler(addr),
        }
    }

    /// Handler value stored in a [`SigAction`].
    pub fn raw(self) -> u64 {
        match self {
            Self::Default => SIG_DFL,
            Self::Ignore => SIG_IGN,
            Self::Kill => SIGKILL as u64,
            Self::Stop => SIGSTOP as u64,
            Self::Continue => SIGCONT as u64,
            Self::Handler(addr) => addr,
        }
    }
}

/// Handler and the mask applied while it runs, as laid out in user memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SigAction {
    pub handler: u64,
    pub mask: u32,
    pub reserved: u32,
}

/// Bytes of a [`SigAction`] in user memory.
pub const SIGACTION_SIZE: usize = core::mem::size_of::<SigAction>();

impl SigAction {
    /// Action for `disposition`, blocking `mask` while a handler runs.
    pub fn new(disposition: Disposition, mask: u32) -> Self {
        Self {
            handler: disposition.raw(),
            mask,
            reserved: 0,
        }
    }

    /// What delivering the signal does.
    pub fn disposition(&self) -> Disposition {
        Disposition::from_raw(self.handler)
    }
}

/// Signal-return stub placed on the user stack below a handler frame.
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
    pub version: u16,
    pub code: &'static [u8],
}

/// `li a7, 24` (`SYS_sigret`), `ecall`.
pub const SIGRET_TRAMPOLINE: Trampoline = Trampoline {
    version: 1,
    code: &[0x93, 0x08, 0x80, 0x01, 0x73, 0x00, 0x00, 0x00],
};

impl Trampoline {
    /// Whether `bytes` start with this stub.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes == self.code
    }
}

/// Where a thread stands with respect to user signal handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerState {
    Idle,
    /// A handler frame is installed but the handler has not started.
    Pending,
    Running,
}

/// Per-process signal state; guarded by the process lock.
#[derive(Debug, Clone)]
pub(crate) struct SignalState {
    pub pending: u32,
    pub mask: u32,
    pub actions: [SigAction; NSIG],
    pub mask_backup: u32,
    pub frozen: bool,
}

impl Default for SignalState {
    fn default() -> Self {
        Self {
            pending: 0,
            mask: 0,
            actions: [SigAction::default(); NSIG],
            mask_backup: 0,
            frozen: false,
        }
    }
}

impl SignalState {
    /// The configuration a forked child starts with.
    pub fn inherited(&self) -> Self {
        Self {
            mask: self.mask,
            actions: self.actions,
            ..Self::default()
        }
    }

    /// Whether the mask holds `signum` back.
    pub fn blocked(&self, signum: i32) -> bool {
        self.mask & bit(signum) & !UNBLOCKABLE != 0
    }

    fn disposition(&self, signum: i32) -> Disposition {
        match signum {
            SIGKILL => Disposition::Kill,
            SIGSTOP => Disposition::Stop,
            _ => self.actions[signum as usize].disposition(),
        }
    }

    /// Would delivering `signum` right now kill the process?
    pub fn is_fatal(&self, signum: i32) -> bool {
        if signum == SIGKILL {
            return true;
        }
        if self.blocked(signum) {
            return false;
        }
        match self.disposition(signum) {
            Disposition::Kill => true,
            Disposition::Default => signum != SIGSTOP && signum != SIGCONT,
            _ => false,
        }
    }

    /// Whether a pending signal will kill the process.
    pub fn fatal_pending(&self) -> bool {
        (0..NSIG as i32).any(|s| self.pending & bit(s) != 0 && self.is_fatal(s))
    }
}

fn check_signum(signum: i32) -> KernelResult<i32> {
    if (0..NSIG as i32).contains(&signum) {
        Ok(signum)
    } else {
        Err(KernelError::InvalidSignal(signum))
    }
}

fn check_mask(mask: u32) -> KernelResult<u32> {
    if (mask as i32) < 0 {
        return Err(KernelError::InvalidMask(mask));
    }
    if mask & bit(SIGKILL) != 0 {
        return Err(KernelError::ImmutableSignal(SIGKILL));
    }
    if mask & bit(SIGSTOP) != 0 {
        return Err(KernelError::ImmutableSignal(SIGSTOP));
    }
    Ok(mask)
}

/// Result of looking at one pending signal.
enum Delivery {
    Skipped,
    Done,
    Frozen,
    HandlerInstalled,
}

impl Kernel {
    /// Marks `signum` pending for process `pid`.
    ///
    /// When the signal will kill the process, one sleeping thread is made
    /// runnable so the process notices promptly.
    pub fn kill(&self, pid: Pid, signum: i32) -> KernelResult<()> {
        let signum = check_signum(signum)?;
        for p in self.procs.iter() {
            let mut g = p.lock.lock();
            if g.state == ProcState::Unused || g.pid != pid {
                continue;
            }
            g.signals.pending |= bit(signum);
            debug!("kill: pid {pid} signal {signum}");
            if g.signals.is_fatal(signum) {
                for t in p.threads.iter() {
                    let mut t = t.lock.lock();
                    if t.state == ThreadState::Sleeping {
                        t.state = ThreadState::Runnable;
                        break;
                    }
                }
            }
            return Ok(());
        }
        Err(KernelError::NoSuchProcess(pid))
    }

    /// Replaces the block mask of the caller's process and returns the old
    /// one.
    pub fn sigprocmask(&self, cur: ThreadRef, mask: i32) -> KernelResult<u32> {
        let mask = check_mask(mask as u32)?;
        let mut p = self.proc(cur.proc).lock.lock();
        let old = p.signals.mask;
        p.signals.mask = mask;
        Ok(old)
    }

    /// Replaces the action for `signum` and returns the old one.
    pub fn sigaction(&self, cur: ThreadRef, signum: i32, action: SigAction) -> KernelResult<SigAction> {
        self.replace_action(cur, signum, action, |_| Ok(()))
    }

    /// Hands the current action to `save` and installs `action` only if
    /// that succeeds.
    fn replace_action(
        &self,
        cur: ThreadRef,
        signum: i32,
        action: SigAction,
        save: impl FnOnce(&SigAction) -> KernelResult<()>,
    ) -> KernelResult<SigAction> {
        let signum = check_signum(signum)?;
        if signum == SIGKILL || signum == SIGSTOP {
            return Err(KernelError::ImmutableSignal(signum));
        }
        check_mask(action.mask)?;
        let mut p = self.proc(cur.proc).lock.lock();
        let old = p.signals.actions[signum as usize];
        save(&old)?;
        p.signals.actions[signum as usize] = action;
        Ok(old)
    }

    /// `sigaction` with the records in user memory at `act` and `oldact`.
    pub(crate) fn sys_sigaction(
        &self,
        cur: ThreadRef,
        signum: i32,
        act: UserAddr,
        oldact: Option<UserAddr>,
    ) -> KernelResult<()> {
        if act == 0 {
            return Err(KernelError::InvalidArgument("null sigaction"));
        }
        let space = self.proc(cur.proc).lock.lock().space()?;
        let mut buf = [0u8; SIGACTION_SIZE];
        self.machine.copy_in(space, &mut buf, act)?;
        let action = SigAction::read_from(&buf[..]).ok_or(KernelError::BadAddress(act))?;

        self.replace_action(cur, signum, action, |old| match oldact {
            Some(addr) => Ok(self.machine.copy_out(space, addr, old.as_bytes())?),
            None => Ok(()),
        })?;
        Ok(())
    }

    /// Delivers the caller's pending, unblocked signals in ascending order.
    ///
    /// Skipped while a handler is installed or running. Stops after
    /// installing a handler frame.
    pub(crate) fn handle_signals(&self, cur: ThreadRef) {
        if self.thread(cur).lock.lock().handler != HandlerState::Idle {
            return;
        }
        for signum in 0..NSIG as i32 {
            match self.deliver(cur, signum) {
                Delivery::Skipped | Delivery::Done => {}
                Delivery::Frozen => self.yield_now(cur),
                Delivery::HandlerInstalled => break,
            }
        }
    }

    fn deliver(&self, cur: ThreadRef, signum: i32) -> Delivery {
        let mut p = self.proc(cur.proc).lock.lock();
        if p.signals.pending & bit(signum) == 0 || p.signals.blocked(signum) {
            return Delivery::Skipped;
        }
        let disposition = p.signals.disposition(signum);
        trace!("pid {}: deliver signal {signum} as {disposition:?}", p.pid);
        if let Disposition::Handler(entry) = disposition {
            return self.push_handler_frame(cur, &mut p, signum, entry);
        }

        let signals = &mut p.signals;
        signals.mask_backup = signals.mask;
        signals.mask = signals.actions[signum as usize].mask;
        let (kill, outcome) = match disposition {
            Disposition::Kill => (true, Delivery::Done),
            Disposition::Default if signum != SIGCONT => (true, Delivery::Done),
            Disposition::Stop => {
                signals.frozen = true;
                (false, Delivery::Frozen)
            }
            Disposition::Continue | Disposition::Default => {
                signals.frozen = false;
                signals.pending &= !(bit(signum) | bit(SIGSTOP));
                (false, Delivery::Done)
            }
            Disposition::Ignore | Disposition::Handler(_) => {
                signals.pending &= !bit(signum);
                (false, Delivery::Done)
            }
        };
        if kill {
            signals.pending &= !bit(signum);
        }
        signals.mask = signals.mask_backup;
        if kill {
            p.killed = true;
        }
        outcome
    }

    /// Diverts thread `cur` into the user handler at `entry`.
    fn push_handler_frame(&self, cur: ThreadRef, p: &mut ProcInner, signum: i32, entry: UserAddr) -> Delivery {
        p.signals.pending &= !bit(signum);
        let saved = p.trapframe(cur.slot);
        let code = SIGRET_TRAMPOLINE.code;

        let frame = saved.sp.checked_sub(TRAPFRAME_SIZE as u64);
        let tramp = frame.and_then(|f| f.checked_sub(code.len() as u64)).map(|t| t & !0xf);
        let pushed = match (p.space, frame, tramp) {
            (Some(space), Some(frame), Some(tramp)) => self
                .machine
                .copy_out(space, frame, saved.as_bytes())
                .and_then(|_| self.machine.copy_out(space, tramp, code))
                .map(|_| (frame, tramp))
                .ok(),
            _ => None,
        };
        let Some((frame, tramp)) = pushed else {
            warn!("pid {}: no room for signal {signum} frame below sp {:#x}", p.pid, saved.sp);
            p.killed = true;
            return Delivery::Done;
        };

        p.signals.mask_backup = p.signals.mask;
        p.signals.mask = p.signals.actions[signum as usize].mask;

        let tf = TrapFrame {
            epc: entry,
            ra: tramp,
            sp: tramp,
            a0: signum as u64,
            ..saved
        };
        p.set_trapframe(cur.slot, &tf);

        let mut t = self.thread(cur).lock.lock();
        t.backup = frame;
        t.handler = HandlerState::Pending;
        Delivery::HandlerInstalled
    }

    /// Returns from a user signal handler: restores the registers saved on
    /// the user stack and the pre-handler mask.
    pub fn sigret(&self, cur: ThreadRef) {
        let mut p = self.proc(cur.proc).lock.lock();
        let mut t = self.thread(cur).lock.lock();
        let frame = t.backup;
        let space = p.space;
        let restored = match (space, t.backup_page.as_mut()) {
            (Some(space), Some(page)) => {
                let staging = &mut page[..TRAPFRAME_SIZE];
                self.machine
                    .copy_in(space, staging, frame)
                    .ok()
                    .and_then(|_| TrapFrame::from_bytes(staging))
            }
            _ => None,
        };
        match restored {
            Some(tf) => p.set_trapframe(cur.slot, &tf),
            None => {
                warn!("pid {}: cannot restore signal frame at {frame:#x}", p.pid);
                p.killed = true;
            }
        }
        p.signals.mask = p.signals.mask_backup;
        t.handler = HandlerState::Idle;
    }
}
