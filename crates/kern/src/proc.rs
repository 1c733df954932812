//! Processes: address space, thread table, open files and signal state.

use log::{debug, trace};

use crate::error::{KernelError, KernelResult};
use crate::hal::{DirRef, FileRef, PageFrame, SpaceId};
use crate::kernel::{Kernel, ProcTree};
use crate::signal::SignalState;
use crate::sleep::Channel;
use crate::sync::{Spinlock, SpinlockGuard};
use crate::text::UserAddr;
use crate::thread::{Thread, ThreadRef, ThreadState};
use crate::trapframe::{TrapFrame, TRAPFRAME_SIZE};

use zerocopy::AsBytes;

/// Process id as seen by user code.
pub type Pid = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcState {
    Unused,
    Used,
    Zombie,
}

/// Process fields; only touched with the process lock held. The parent
/// link lives in the kernel's [`ProcTree`] instead.
pub(crate) struct ProcInner {
    pub state: ProcState,
    pub pid: Pid,
    pub xstate: i32,
    pub killed: bool,
    /// Set by the first thread that starts tearing the process down.
    pub exiting: bool,
    pub name: String,
    pub space: Option<SpaceId>,
    pub sz: u64,
    /// Trap frames of all thread slots.
    pub trapframes: Option<PageFrame>,
    pub ofile: Vec<Option<FileRef>>,
    pub cwd: Option<DirRef>,
    pub signals: SignalState,
}

impl ProcInner {
    fn new(nofile: usize) -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            xstate: 0,
            killed: false,
            exiting: false,
            name: String::new(),
            space: None,
            sz: 0,
            trapframes: None,
            ofile: vec![None; nofile],
            cwd: None,
            signals: SignalState::default(),
        }
    }

    /// The address space, which every live process has.
    pub fn space(&self) -> KernelResult<SpaceId> {
        self.space.ok_or(KernelError::InvalidArgument("process has no address space"))
    }

    /// Trap frame of thread slot `slot`.
    pub fn trapframe(&self, slot: usize) -> TrapFrame {
        let off = slot * TRAPFRAME_SIZE;
        self.trapframes
            .as_ref()
            .and_then(|page| TrapFrame::from_bytes(&page[off..off + TRAPFRAME_SIZE]))
            .unwrap_or_default()
    }

    /// Stores the trap frame of thread slot `slot`.
    pub fn set_trapframe(&mut self, slot: usize, tf: &TrapFrame) {
        let off = slot * TRAPFRAME_SIZE;
        if let Some(page) = self.trapframes.as_mut() {
            page[off..off + TRAPFRAME_SIZE].copy_from_slice(tf.as_bytes());
        }
    }
}

/// A process slot and its thread slots.
pub struct Process {
    pub(crate) lock: Spinlock<ProcInner>,
    pub(crate) threads: Box<[Thread]>,
}

impl Process {
    pub(crate) fn new(nthread: usize, nofile: usize) -> Self {
        Self {
            lock: Spinlock::new("proc", ProcInner::new(nofile)),
            threads: (0..nthread).map(|_| Thread::new()).collect(),
        }
    }
}

/// Parent's view of a fork image, taken under the parent's lock.
struct ForkImage {
    space: SpaceId,
    sz: u64,
    tf: TrapFrame,
    files: Vec<Option<FileRef>>,
    cwd: Option<DirRef>,
    name: String,
    signals: SignalState,
}

impl Kernel {
    /// Claims an Unused process slot with a fresh pid, trap frame page and
    /// empty address space.
    ///
    /// Returns with the process lock held, or `None` with every partial
    /// allocation undone.
    pub(crate) fn allocproc(&self) -> Option<(usize, SpinlockGuard<'_, ProcInner>)> {
        for (i, p) in self.procs.iter().enumerate() {
            let mut g = p.lock.lock();
            if g.state != ProcState::Unused {
                continue;
            }
            g.pid = self.pids.next();
            g.state = ProcState::Used;
            g.killed = false;
            g.exiting = false;
            g.xstate = 0;
            g.signals = SignalState::default();

            g.trapframes = self.machine.alloc_page();
            g.space = self.machine.create_space();
            if g.trapframes.is_none() || g.space.is_none() {
                self.freeproc(&mut g, i);
                return None;
            }
            trace!("allocproc: pid {} in slot {i}", g.pid);
            return Some((i, g));
        }
        None
    }

    /// Releases everything a process owns, its threads included, and marks
    /// the slot Unused. The caller holds the process lock.
    pub(crate) fn freeproc(&self, p: &mut ProcInner, slot: usize) {
        for t in self.procs[slot].threads.iter() {
            let mut t = t.lock.lock();
            if t.state != ThreadState::Unused {
                self.freethread(&mut t);
            }
        }
        if let Some(page) = p.trapframes.take() {
            self.machine.free_page(page);
        }
        if let Some(space) = p.space.take() {
            self.machine.destroy_space(space, p.sz);
        }
        p.sz = 0;
        p.pid = 0;
        p.name.clear();
        p.killed = false;
        p.exiting = false;
        p.xstate = 0;
        p.signals = SignalState::default();
        p.state = ProcState::Unused;
    }

    /// Creates the init process running `entry`.
    pub(crate) fn userinit(&self, entry: UserAddr) -> KernelResult<()> {
        let (i, mut p) = self.allocproc().ok_or(KernelError::NoFreeProcess)?;
        let setup = self.setup_init(i, &mut p, entry);
        if setup.is_err() {
            for file in p.ofile.iter_mut().filter_map(Option::take) {
                self.machine.close_file(file);
            }
            if let Some(dir) = p.cwd.take() {
                self.machine.put_dir(dir);
            }
            self.freeproc(&mut p, i);
        }
        setup
    }

    fn setup_init(&self, i: usize, p: &mut ProcInner, entry: UserAddr) -> KernelResult<()> {
        let space = p.space()?;
        let size = self.config.image_size;
        self.machine.resize_space(space, 0, size)?;
        p.sz = size;

        let console = self.machine.open_console().ok_or(KernelError::OutOfMemory)?;
        p.ofile[0] = Some(console);
        p.ofile[1] = Some(self.machine.dup_file(console));
        p.ofile[2] = Some(self.machine.dup_file(console));
        p.cwd = Some(self.machine.root_dir());
        p.name = String::from("initcode");

        let (slot, mut t) = self.allocthread(i, p).ok_or(KernelError::NoFreeThread)?;
        let tf = TrapFrame {
            epc: entry,
            sp: size,
            ..TrapFrame::default()
        };
        p.set_trapframe(slot, &tf);
        t.state = ThreadState::Runnable;
        self.initproc.call_once(|| i);
        debug!("userinit: pid {} entry {entry:#x}", p.pid);
        Ok(())
    }

    /// Creates a copy of the calling process. The child's thread resumes
    /// with the caller's registers and a zero result.
    pub fn fork(&self, cur: ThreadRef) -> KernelResult<Pid> {
        let image = {
            let p = self.proc(cur.proc).lock.lock();
            ForkImage {
                space: p.space()?,
                sz: p.sz,
                tf: p.trapframe(cur.slot),
                files: p.ofile.clone(),
                cwd: p.cwd,
                name: p.name.clone(),
                signals: p.signals.inherited(),
            }
        };

        let (ci, mut np) = self.allocproc().ok_or(KernelError::NoFreeProcess)?;
        let copied = np
            .space()
            .and_then(|child| Ok(self.machine.copy_space(image.space, child, image.sz)?));
        if let Err(err) = copied {
            self.freeproc(&mut np, ci);
            return Err(err.into());
        }
        np.sz = image.sz;

        let Some((slot, mut nt)) = self.allocthread(ci, &mut np) else {
            self.freeproc(&mut np, ci);
            return Err(KernelError::NoFreeThread);
        };
        let mut tf = image.tf;
        tf.a0 = 0;
        np.set_trapframe(slot, &tf);

        for (fd, file) in image.files.iter().enumerate() {
            np.ofile[fd] = file.map(|f| self.machine.dup_file(f));
        }
        np.cwd = image.cwd.map(|d| self.machine.dup_dir(d));
        np.name = image.name;
        np.signals = image.signals;

        let pid = np.pid;
        nt.state = ThreadState::Runnable;
        drop(nt);
        drop(np);

        self.tree.lock().parent[ci] = Some(cur.proc);
        debug!("fork: pid {pid} from slot {}", cur.proc);
        Ok(pid)
    }

    /// Passes the children of `proc` to init.
    fn reparent(&self, proc: usize, tree: &mut ProcTree) {
        let init = self.initproc();
        for parent in tree.parent.iter_mut() {
            if *parent == Some(proc) {
                *parent = Some(init);
                self.wakeup(Channel::Proc(init));
            }
        }
    }

    /// Exits the calling process. Does not return; the process stays a
    /// zombie until its parent calls `wait`.
    pub fn exit(&self, cur: ThreadRef, status: i32) -> ! {
        if cur.proc == self.initproc() {
            self.panic("init exiting");
        }
        let p = self.proc(cur.proc);

        let (files, cwd) = {
            let mut g = p.lock.lock();
            if g.exiting {
                drop(g);
                self.vanish(cur);
            }
            g.exiting = true;
            let files: Vec<FileRef> = g.ofile.iter_mut().filter_map(Option::take).collect();
            (files, g.cwd.take())
        };
        for file in files {
            self.machine.close_file(file);
        }
        if let Some(dir) = cwd {
            self.machine.put_dir(dir);
        }

        for (slot, t) in p.threads.iter().enumerate() {
            if slot == cur.slot {
                continue;
            }
            let mut t = t.lock.lock();
            if t.is_live() {
                t.killed = true;
                if t.state == ThreadState::Sleeping {
                    t.state = ThreadState::Runnable;
                }
            }
        }

        let mut tree = self.tree.lock();
        self.reparent(cur.proc, &mut tree);
        if let Some(parent) = tree.parent[cur.proc] {
            self.wakeup(Channel::Proc(parent));
        }
        self.wakeup(Channel::Thread(cur));

        let pid = {
            let mut g = p.lock.lock();
            g.xstate = status;
            g.state = ProcState::Zombie;
            g.pid
        };
        let mut t = self.thread(cur).lock.lock();
        t.xstate = status;
        t.state = ThreadState::Zombie;
        drop(tree);

        debug!("exit: pid {pid} status {status}");
        self.sched_final(t)
    }

    /// Waits for a child to exit and returns its pid. The exit status is
    /// copied to `status_addr` when given.
    pub fn wait(&self, cur: ThreadRef, status_addr: Option<u64>) -> KernelResult<Pid> {
        let me = cur.proc;
        let space = self.proc(me).lock.lock().space()?;

        let mut tree = self.tree.lock();
        loop {
            let mut havekids = false;
            for (i, np) in self.procs.iter().enumerate() {
                if tree.parent[i] != Some(me) {
                    continue;
                }
                let mut child = np.lock.lock();
                havekids = true;
                if child.state != ProcState::Zombie || self.has_running_thread(i) {
                    continue;
                }
                let pid = child.pid;
                if let Some(addr) = status_addr {
                    self.machine.copy_out(space, addr, &child.xstate.to_le_bytes())?;
                }
                debug!("wait: reaped pid {pid} status {}", child.xstate);
                self.freeproc(&mut child, i);
                tree.parent[i] = None;
                return Ok(pid);
            }

            if !havekids {
                return Err(KernelError::NoChildren);
            }
            if self.doomed(me) {
                return Err(KernelError::Killed);
            }
            tree = self.sleep(cur, Channel::Proc(me), tree);
        }
    }

    /// A zombie whose sibling thread is still on a CPU cannot be reclaimed
    /// yet; the scheduler wakes the parent once it leaves.
    fn has_running_thread(&self, proc: usize) -> bool {
        self.procs[proc]
            .threads
            .iter()
            .any(|t| t.lock.lock().state == ThreadState::Running)
    }

    /// Grows or shrinks the calling process's memory by `n` bytes and
    /// returns the previous size.
    pub fn growproc(&self, cur: ThreadRef, n: i64) -> KernelResult<u64> {
        let mut p = self.proc(cur.proc).lock.lock();
        let old = p.sz;
        let new = old
            .checked_add_signed(n)
            .ok_or(KernelError::InvalidArgument("break out of range"))?;
        self.machine.resize_space(p.space()?, old, new)?;
        p.sz = new;
        Ok(old)
    }

    /// Pid of the process `cur` belongs to.
    pub fn getpid(&self, cur: ThreadRef) -> Pid {
        self.proc(cur.proc).lock.lock().pid
    }

    /// Whether the process is killed or about to be by a pending signal.
    pub(crate) fn doomed(&self, proc: usize) -> bool {
        let p = self.proc(proc).lock.lock();
        p.killed || p.signals.fatal_pending()
    }

    /// Wakes the parent of a process whose thread just left a CPU, if the
    /// process has exited and may now be reapable.
    pub(crate) fn notify_reaper(&self, proc: usize) {
        let tree = self.tree.lock();
        let zombie = self.proc(proc).lock.lock().state == ProcState::Zombie;
        if let (true, Some(parent)) = (zombie, tree.parent[proc]) {
            self.wakeup(Channel::Proc(parent));
        }
    }
}
