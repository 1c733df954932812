//! Per-thread saved user registers.
//!
//! The trap frames of all threads of a process share one page; thread slot
//! `i` owns bytes `i * TRAPFRAME_SIZE ..`. The same layout is pushed onto the
//! user stack when a signal handler is installed.

use core::mem::size_of;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TrapFrame {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

/// Bytes of one trap frame.
pub const TRAPFRAME_SIZE: usize = size_of::<TrapFrame>();

impl TrapFrame {
    /// Decodes a frame from exactly `TRAPFRAME_SIZE` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }

    /// Sets the system call argument registers `a0..` from `args`.
    pub fn set_args(&mut self, args: &[u64]) {
        let regs = [
            &mut self.a0,
            &mut self.a1,
            &mut self.a2,
            &mut self.a3,
            &mut self.a4,
            &mut self.a5,
        ];
        for (reg, value) in regs.into_iter().zip(args) {
            *reg = *value;
        }
    }

    /// Raw system call argument `n` (`a0..a5`).
    pub fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("argraw: no argument {n}"),
        }
    }
}
