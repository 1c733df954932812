//! Error types shared by kernel services and the machine boundary.

use thiserror::Error;

use crate::proc::Pid;
use crate::thread::Tid;

/// Failures reported by a [`Machine`](crate::hal::Machine) implementation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("bad user address {addr:#x} (+{len})")]
    BadAddress { addr: u64, len: usize },
    #[error("unknown address space {0}")]
    NoSuchSpace(u32),
}

/// Errors returned by kernel operations.
///
/// Every variant maps to the `-1` sentinel at the system call boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("process table is full")]
    NoFreeProcess,
    #[error("thread table of the process is full")]
    NoFreeThread,
    #[error("binary semaphore pool is exhausted")]
    NoFreeSemaphore,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no process with pid {0}")]
    NoSuchProcess(Pid),
    #[error("no sibling thread with tid {0}")]
    NoSuchThread(Tid),
    #[error("signal number {0} out of range")]
    InvalidSignal(i32),
    #[error("signal mask {0:#x} is invalid")]
    InvalidMask(u32),
    #[error("signal {0} cannot be blocked or rehandled")]
    ImmutableSignal(i32),
    #[error("no children to wait for")]
    NoChildren,
    #[error("caller has been killed")]
    Killed,
    #[error("bad user address {0:#x}")]
    BadAddress(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("cannot start execution unit {0}")]
    CpuStart(usize),
}

impl From<MachineError> for KernelError {
    fn from(value: MachineError) -> Self {
        match value {
            MachineError::OutOfMemory => Self::OutOfMemory,
            MachineError::BadAddress { addr, .. } => Self::BadAddress(addr),
            MachineError::NoSuchSpace(_) => Self::InvalidArgument("address space"),
        }
    }
}

/// Result of a kernel operation.
pub type KernelResult<T> = Result<T, KernelError>;
