//! In-memory [`Machine`] for running the kernel on a host.
//!
//! Pages are drawn from a fixed budget so allocation failure can be
//! provoked. Address spaces are flat byte vectors starting at address 0.
//! File and directory handles are plain reference counts.

use std::collections::HashMap;

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::MachineError;
use crate::hal::{pg_round_up, DirRef, FileRef, Machine, PageFrame, SpaceId, PGSIZE};

/// The root directory inode.
pub const ROOT_DIR: DirRef = DirRef(1);

/// A [`Machine`] backed by host memory.
pub struct HostedMachine {
    free_pages: AtomicUsize,
    next_id: AtomicU32,
    spaces: Mutex<HashMap<SpaceId, Vec<u8>>>,
    files: Mutex<HashMap<FileRef, usize>>,
    dirs: Mutex<HashMap<DirRef, usize>>,
}

impl Default for HostedMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HostedMachine {
    /// Machine with a budget of 4096 pages.
    pub fn new() -> Self {
        Self::with_pages(4096)
    }

    /// Machine with a budget of `pages` physical pages.
    pub fn with_pages(pages: usize) -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(ROOT_DIR, 1);
        Self {
            free_pages: AtomicUsize::new(pages),
            next_id: AtomicU32::new(2),
            spaces: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(dirs),
        }
    }

    /// Pages left in the budget.
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::SeqCst)
    }

    /// Number of live address spaces.
    pub fn spaces(&self) -> usize {
        self.spaces.lock().len()
    }

    /// Open references to `file`; zero once it is fully closed.
    pub fn file_refs(&self, file: FileRef) -> usize {
        self.files.lock().get(&file).copied().unwrap_or(0)
    }

    /// Open references over all files.
    pub fn file_handles(&self) -> usize {
        self.files.lock().values().sum()
    }

    /// References held on directory `dir`.
    pub fn dir_refs(&self, dir: DirRef) -> usize {
        self.dirs.lock().get(&dir).copied().unwrap_or(0)
    }

    fn take_pages(&self, n: usize) -> Result<(), MachineError> {
        self.free_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| free.checked_sub(n))
            .map(|_| ())
            .map_err(|_| MachineError::OutOfMemory)
    }

    fn give_pages(&self, n: usize) {
        self.free_pages.fetch_add(n, Ordering::SeqCst);
    }

    fn pages(sz: u64) -> usize {
        (pg_round_up(sz) / PGSIZE as u64) as usize
    }

    fn range(mem: &[u8], addr: u64, len: usize) -> Result<core::ops::Range<usize>, MachineError> {
        let bad = MachineError::BadAddress { addr, len };
        let start = usize::try_from(addr).map_err(|_| bad)?;
        let end = start.checked_add(len).ok_or(bad)?;
        if end > mem.len() {
            return Err(bad);
        }
        Ok(start..end)
    }
}

impl Machine for HostedMachine {
    fn alloc_page(&self) -> Option<PageFrame> {
        self.take_pages(1).ok()?;
        Some(PageFrame::zeroed())
    }

    fn free_page(&self, page: PageFrame) {
        drop(page);
        self.give_pages(1);
    }

    fn create_space(&self) -> Option<SpaceId> {
        // The root page table.
        self.take_pages(1).ok()?;
        let id = SpaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.spaces.lock().insert(id, Vec::new());
        Some(id)
    }

    fn resize_space(&self, space: SpaceId, old_sz: u64, new_sz: u64) -> Result<(), MachineError> {
        let mut spaces = self.spaces.lock();
        let mem = spaces.get_mut(&space).ok_or(MachineError::NoSuchSpace(space.0))?;
        let (old_pages, new_pages) = (Self::pages(old_sz), Self::pages(new_sz));
        if new_pages > old_pages {
            self.take_pages(new_pages - old_pages)?;
        } else {
            self.give_pages(old_pages - new_pages);
        }
        mem.resize(new_sz as usize, 0);
        Ok(())
    }

    fn copy_space(&self, from: SpaceId, to: SpaceId, sz: u64) -> Result<(), MachineError> {
        let mut spaces = self.spaces.lock();
        let src = spaces.get(&from).ok_or(MachineError::NoSuchSpace(from.0))?;
        let range = Self::range(src, 0, sz as usize)?;
        let copy = src[range].to_vec();
        if !spaces.contains_key(&to) {
            return Err(MachineError::NoSuchSpace(to.0));
        }
        self.take_pages(Self::pages(sz))?;
        spaces.insert(to, copy);
        Ok(())
    }

    fn destroy_space(&self, space: SpaceId, sz: u64) {
        if self.spaces.lock().remove(&space).is_some() {
            self.give_pages(Self::pages(sz) + 1);
        }
    }

    fn copy_out(&self, space: SpaceId, dst: u64, src: &[u8]) -> Result<(), MachineError> {
        let mut spaces = self.spaces.lock();
        let mem = spaces.get_mut(&space).ok_or(MachineError::NoSuchSpace(space.0))?;
        let range = Self::range(mem, dst, src.len())?;
        mem[range].copy_from_slice(src);
        Ok(())
    }

    fn copy_in(&self, space: SpaceId, dst: &mut [u8], src: u64) -> Result<(), MachineError> {
        let spaces = self.spaces.lock();
        let mem = spaces.get(&space).ok_or(MachineError::NoSuchSpace(space.0))?;
        let range = Self::range(mem, src, dst.len())?;
        dst.copy_from_slice(&mem[range]);
        Ok(())
    }

    fn open_console(&self) -> Option<FileRef> {
        let file = FileRef(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.files.lock().insert(file, 1);
        Some(file)
    }

    fn dup_file(&self, file: FileRef) -> FileRef {
        *self.files.lock().entry(file).or_insert(0) += 1;
        file
    }

    fn close_file(&self, file: FileRef) {
        let mut files = self.files.lock();
        if let Some(refs) = files.get_mut(&file) {
            *refs -= 1;
            if *refs == 0 {
                files.remove(&file);
            }
        }
    }

    fn root_dir(&self) -> DirRef {
        self.dup_dir(ROOT_DIR)
    }

    fn dup_dir(&self, dir: DirRef) -> DirRef {
        *self.dirs.lock().entry(dir).or_insert(0) += 1;
        dir
    }

    fn put_dir(&self, dir: DirRef) {
        if let Some(refs) = self.dirs.lock().get_mut(&dir) {
            *refs = refs.saturating_sub(1);
        }
    }
}
