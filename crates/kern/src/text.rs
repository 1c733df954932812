//! User program text.
//!
//! User code is a set of host closures. Registering one assigns it a user
//! address in the text segment; saved instruction pointers and signal
//! handler addresses refer to entries by that address. Text is shared by
//! every process, as if all of them ran the same executable.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::syscall::UserContext;

/// Start of the text segment, above every data address.
pub const TEXT_BASE: u64 = 0x4000_0000;
const ENTRY_STRIDE: u64 = 0x10;

/// An address in a user address space or the text segment.
pub type UserAddr = u64;

/// A user function.
pub type UserFn = Arc<dyn Fn(&mut UserContext<'_>) + Send + Sync>;

#[derive(Default)]
pub struct UserText {
    entries: RwLock<Vec<UserFn>>,
}

impl UserText {
    /// An empty text segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `f` to the text segment and returns its entry address.
    pub fn register<F>(&self, f: F) -> UserAddr
    where
        F: Fn(&mut UserContext<'_>) + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        entries.push(Arc::new(f));
        TEXT_BASE + (entries.len() as u64 - 1) * ENTRY_STRIDE
    }

    /// Returns the function whose entry is exactly `addr`.
    pub fn lookup(&self, addr: UserAddr) -> Option<UserFn> {
        let offset = addr.checked_sub(TEXT_BASE)?;
        if offset % ENTRY_STRIDE != 0 {
            return None;
        }
        self.entries.read().get((offset / ENTRY_STRIDE) as usize).cloned()
    }
}
