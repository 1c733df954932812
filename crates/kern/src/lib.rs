//! # kern - Multi-threaded Process Kernel
//!
//! A small kernel core with a fixed-capacity process and thread table, a
//! round-robin scheduler per execution unit, channel-based sleep/wakeup,
//! asynchronous signal delivery and a pool of binary semaphores.
//!
//! ## Architecture
//!
//! **Processes and threads**: flat slot arrays whose slot index is the
//! kernel-side handle. A process owns an address space, open files, signal
//! state and a fixed array of thread slots.
//!
//! **Execution**: the kernel runs hosted. Every CPU is an OS thread running
//! the scheduler loop, every kernel thread an OS thread that runs only while
//! a context switch has handed it a CPU. User programs are host closures in
//! a shared text segment, entered through [`UserContext`].
//!
//! **Locking**: spin locks mask interrupts on the holding CPU. The process
//! tree lock comes before any process lock, and a process lock before any
//! of its thread locks.
//!
//! ## Module Overview
//!
//! - [`kernel`] - Kernel instance, builder, boot and halt
//! - [`proc`] / [`thread`] - Process and thread lifecycle
//! - `sched` - Scheduler loop and context switch protocol
//! - [`sleep`] - Sleep and wakeup on typed channels
//! - [`signal`] - Signal state, delivery and handler frames
//! - [`bsem`] - Binary semaphore pool
//! - `trap` / [`syscall`] - Trap path and system call surface
//! - [`hal`] / [`hosted`] - Machine services and the in-memory machine

pub mod bsem;
mod context;
pub mod cpu;
pub mod error;
pub mod hal;
pub mod hosted;
pub mod kernel;
pub mod param;
pub mod proc;
mod sched;
pub mod signal;
pub mod sleep;
pub mod sync;
pub mod syscall;
pub mod text;
pub mod thread;
mod trap;
pub mod trapframe;

pub use bsem::BsemState;
pub use error::{KernelError, KernelResult, MachineError};
pub use hal::{Machine, PGSIZE};
pub use hosted::HostedMachine;
pub use kernel::{Kernel, KernelBuilder, ProcInfo, ThreadInfo};
pub use param::{KernelConfig, KernelConfigBuilder};
pub use proc::{Pid, ProcState};
pub use signal::{Disposition, SigAction, SIGCONT, SIGKILL, SIGSTOP, SIG_DFL, SIG_IGN};
pub use syscall::{SysError, SysResult, Sysno, UserContext};
pub use text::{UserAddr, UserFn, UserText};
pub use thread::{ThreadRef, ThreadState, Tid};
