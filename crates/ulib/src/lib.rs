//! # ulib - User Library for kern
//!
//! Helpers that user programs build on top of the system call surface of
//! [`kern::UserContext`]. Nothing here reaches into kernel state; every
//! operation is a sequence of system calls and user memory accesses.
//!
//! ## Module Overview
//!
//! - [`csem`] - Counting semaphores composed from two binary semaphores
//! - [`signal`] - Installing signal actions and scoped signal masks
//! - [`init`] - The init program: start a main program and reap orphans

pub mod csem;
pub mod init;
pub mod signal;

pub use csem::{CountingSemaphore, CsemError, CsemRecord};
pub use init::{init_main, reap_forever};
pub use signal::{with_mask, SigActions};
