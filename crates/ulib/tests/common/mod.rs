#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kern::{Kernel, KernelConfig, UserAddr, UserText};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Boots a two-CPU kernel whose init runs `init`.
pub fn boot(text: Arc<UserText>, init: UserAddr) -> Arc<Kernel> {
    Kernel::builder()
        .config(KernelConfig::builder().ncpu(2).build())
        .text(text)
        .boot(init)
        .expect("boot kernel")
}
