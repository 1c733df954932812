//! Shared helpers for booting a kernel on the hosted machine.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kern::signal::SIGACTION_SIZE;
use kern::{Disposition, HostedMachine, Kernel, KernelConfig, SigAction, UserAddr, UserContext, UserText};

/// Upper bound on every blocking observation.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn config() -> KernelConfig {
    KernelConfig::builder().ncpu(2).build()
}

pub fn boot(text: Arc<UserText>, init: UserAddr) -> Arc<Kernel> {
    boot_with(config(), Arc::new(HostedMachine::new()), text, init)
}

pub fn boot_with(
    config: KernelConfig,
    machine: Arc<HostedMachine>,
    text: Arc<UserText>,
    init: UserAddr,
) -> Arc<Kernel> {
    Kernel::builder()
        .config(config)
        .machine(machine)
        .text(text)
        .boot(init)
        .expect("boot kernel")
}

/// What init does once its test body is done: reap orphans forever.
pub fn reap_forever(u: &mut UserContext<'_>) -> ! {
    loop {
        if u.wait(None).is_err() {
            let _ = u.sleep(1);
        }
    }
}

/// Installs `disposition` for `signum` through a record in user memory.
pub fn install(u: &mut UserContext<'_>, signum: i32, disposition: Disposition, mask: u32) -> bool {
    let Ok(act) = u.sbrk(SIGACTION_SIZE as i64) else {
        return false;
    };
    u.write(act, &SigAction::new(disposition, mask));
    u.sigaction(signum, act, None).is_ok()
}

/// Polls `cond` until it holds or [`TIMEOUT`] passes.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
