//! Machine abstraction layer.
//!
//! The kernel core does not manage memory or files itself. Everything it
//! needs from the platform goes through [`Machine`]: physical pages, user
//! address spaces and the copy primitives into them, and reference-counted
//! file and directory handles.

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::error::MachineError;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Rounds `sz` up to a page boundary.
pub const fn pg_round_up(sz: u64) -> u64 {
    (sz + PGSIZE as u64 - 1) & !(PGSIZE as u64 - 1)
}

/// An owned physical page.
pub struct PageFrame(Box<[u8; PGSIZE]>);

impl PageFrame {
    /// A page filled with zeros.
    pub fn zeroed() -> Self {
        Self(Box::new([0; PGSIZE]))
    }
}

impl Deref for PageFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl DerefMut for PageFrame {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PageFrame")
    }
}

/// Handle of a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u32);

/// Handle of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef(pub u32);

/// Handle of a directory inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirRef(pub u32);

/// Services the kernel consumes from the platform.
pub trait Machine: Send + Sync {
    /// Allocates a zeroed physical page.
    fn alloc_page(&self) -> Option<PageFrame>;
    fn free_page(&self, page: PageFrame);

    /// Creates an empty user address space.
    fn create_space(&self) -> Option<SpaceId>;
    /// Grows or shrinks `space` from `old_sz` to `new_sz` bytes.
    fn resize_space(&self, space: SpaceId, old_sz: u64, new_sz: u64) -> Result<(), MachineError>;
    /// Copies the first `sz` bytes of `from` into the empty space `to`.
    fn copy_space(&self, from: SpaceId, to: SpaceId, sz: u64) -> Result<(), MachineError>;
    fn destroy_space(&self, space: SpaceId, sz: u64);

    /// Copies `src` to user address `dst`.
    fn copy_out(&self, space: SpaceId, dst: u64, src: &[u8]) -> Result<(), MachineError>;
    /// Copies `dst.len()` bytes from user address `src`.
    fn copy_in(&self, space: SpaceId, dst: &mut [u8], src: u64) -> Result<(), MachineError>;

    fn open_console(&self) -> Option<FileRef>;
    fn dup_file(&self, file: FileRef) -> FileRef;
    fn close_file(&self, file: FileRef);

    fn root_dir(&self) -> DirRef;
    fn dup_dir(&self, dir: DirRef) -> DirRef;
    fn put_dir(&self, dir: DirRef);
}
