//! Signal helpers.
//!
//! `sigaction` exchanges actions through user memory. [`SigActions`] keeps
//! one scratch area for that exchange so installing handlers does not grow
//! the heap on every call.

use kern::signal::SIGACTION_SIZE;
use kern::{Disposition, SigAction, SysResult, UserAddr, UserContext};

/// Scratch records for installing signal actions.
#[derive(Debug, Clone, Copy)]
pub struct SigActions {
    act: UserAddr,
    old: UserAddr,
}

impl SigActions {
    /// Reserves the scratch records on the heap.
    pub fn new(u: &mut UserContext<'_>) -> SysResult<Self> {
        let act = u.sbrk(2 * SIGACTION_SIZE as i64)?;
        Ok(Self {
            act,
            old: act + SIGACTION_SIZE as u64,
        })
    }

    /// Installs `action` for `signum` and returns the one it replaced.
    pub fn set(&self, u: &mut UserContext<'_>, signum: i32, action: SigAction) -> SysResult<SigAction> {
        u.write(self.act, &action);
        u.sigaction(signum, self.act, Some(self.old))?;
        Ok(u.read(self.old))
    }

    /// Runs `handler` on `signum` with `mask` blocked while it runs.
    pub fn handle(&self, u: &mut UserContext<'_>, signum: i32, handler: UserAddr, mask: u32) -> SysResult<SigAction> {
        self.set(u, signum, SigAction::new(Disposition::Handler(handler), mask))
    }

    /// Ignores `signum` from now on.
    pub fn ignore(&self, u: &mut UserContext<'_>, signum: i32) -> SysResult<SigAction> {
        self.set(u, signum, SigAction::new(Disposition::Ignore, 0))
    }

    /// Restores the default action for `signum`.
    pub fn reset(&self, u: &mut UserContext<'_>, signum: i32) -> SysResult<SigAction> {
        self.set(u, signum, SigAction::default())
    }
}

/// Runs `f` with the signal mask set to `mask`, then puts the previous mask
/// back. Signals unblocked by the restore are delivered on its way out.
pub fn with_mask<R>(
    u: &mut UserContext<'_>,
    mask: u32,
    f: impl FnOnce(&mut UserContext<'_>) -> R,
) -> SysResult<R> {
    let old = u.sigprocmask(mask as i32)?;
    let ret = f(u);
    u.sigprocmask(old as i32)?;
    Ok(ret)
}
