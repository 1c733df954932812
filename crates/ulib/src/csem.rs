//! Counting semaphores.
//!
//! The count lives in user memory next to the handles of two binary
//! semaphores: `s1` guards the count, `s2` is closed while the count is
//! not positive. Threads of one process share the record; a forked child
//! gets its own copy of it but the same kernel semaphores.

use log::debug;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use kern::{SysError, UserAddr, UserContext};

/// In-memory layout of a counting semaphore.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CsemRecord {
    pub value: i32,
    pub s1: i32,
    pub s2: i32,
}

/// Bytes of a [`CsemRecord`].
pub const CSEM_SIZE: usize = core::mem::size_of::<CsemRecord>();

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsemError {
    #[error("initial value {0} is negative")]
    Negative(i32),
    #[error("semaphore record at address 0")]
    NullRecord,
    #[error(transparent)]
    Sys(#[from] SysError),
}

/// Handle to a counting semaphore record in user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingSemaphore {
    addr: UserAddr,
}

impl CountingSemaphore {
    /// Initializes the record at `addr` with `initial`.
    ///
    /// Both binary semaphores start unlocked; with a zero count the gate is
    /// closed right away so the first `down` blocks.
    pub fn alloc(u: &mut UserContext<'_>, addr: UserAddr, initial: i32) -> Result<Self, CsemError> {
        if addr == 0 {
            return Err(CsemError::NullRecord);
        }
        if initial < 0 {
            return Err(CsemError::Negative(initial));
        }
        let s1 = u.bsem_alloc()?;
        let s2 = match u.bsem_alloc() {
            Ok(s2) => s2,
            Err(err) => {
                u.bsem_free(s1);
                return Err(err.into());
            }
        };
        if initial == 0 {
            u.bsem_down(s2);
        }
        u.write(addr, &CsemRecord { value: initial, s1, s2 });
        debug!("csem at {addr:#x}: value {initial}, bsems {s1}/{s2}");
        Ok(Self { addr })
    }

    /// Grows the heap by one record and initializes it.
    pub fn new(u: &mut UserContext<'_>, initial: i32) -> Result<Self, CsemError> {
        if initial < 0 {
            return Err(CsemError::Negative(initial));
        }
        let addr = u.sbrk(CSEM_SIZE as i64)?;
        Self::alloc(u, addr, initial)
    }

    /// Refers to a record initialized elsewhere, e.g. by another thread.
    pub fn at(addr: UserAddr) -> Self {
        Self { addr }
    }

    /// Address of the record.
    pub fn addr(&self) -> UserAddr {
        self.addr
    }

    /// Takes one unit, blocking while the count is zero.
    pub fn down(&self, u: &mut UserContext<'_>) {
        let CsemRecord { s1, s2, .. } = u.read(self.addr);
        u.bsem_down(s2);
        u.bsem_down(s1);
        let mut rec: CsemRecord = u.read(self.addr);
        rec.value -= 1;
        u.write(self.addr, &rec);
        if rec.value > 0 {
            u.bsem_up(s2);
        }
        u.bsem_up(s1);
    }

    /// Returns one unit and lets a waiter in.
    pub fn up(&self, u: &mut UserContext<'_>) {
        let CsemRecord { s1, s2, .. } = u.read(self.addr);
        u.bsem_down(s1);
        let mut rec: CsemRecord = u.read(self.addr);
        rec.value += 1;
        u.write(self.addr, &rec);
        if rec.value == 1 {
            u.bsem_up(s2);
        }
        u.bsem_up(s1);
    }

    /// Current count, read under the mutex.
    pub fn value(&self, u: &mut UserContext<'_>) -> i32 {
        let CsemRecord { s1, .. } = u.read(self.addr);
        u.bsem_down(s1);
        let CsemRecord { value, .. } = u.read(self.addr);
        u.bsem_up(s1);
        value
    }

    /// Releases both binary semaphores. Threads still blocked on them stay
    /// blocked until the handles are reused.
    pub fn free(self, u: &mut UserContext<'_>) {
        let CsemRecord { s1, s2, .. } = u.read(self.addr);
        u.bsem_free(s1);
        u.bsem_free(s2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_three_words() {
        assert_eq!(CSEM_SIZE, 12);
        let rec = CsemRecord { value: 3, s1: 0, s2: 1 };
        assert_eq!(CsemRecord::read_from(rec.as_bytes()), Some(rec));
    }

    #[test]
    fn errors_display_their_cause() {
        assert_eq!(CsemError::Negative(-1).to_string(), "initial value -1 is negative");
        let sys = CsemError::from(SysError(kern::Sysno::BsemAlloc));
        assert_eq!(sys.to_string(), "BsemAlloc failed");
    }
}
