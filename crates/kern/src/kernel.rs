//! Kernel instance: tables, CPUs, boot and halt.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use log::{error, info};
use parking_lot::Mutex;

use crate::bsem::BsemPool;
use crate::cpu::Cpu;
use crate::error::{KernelError, KernelResult};
use crate::hal::Machine;
use crate::hosted::HostedMachine;
use crate::param::KernelConfig;
use crate::proc::{Pid, ProcState, Process};
use crate::sync::Spinlock;
use crate::text::{UserAddr, UserText};
use crate::thread::{Thread, ThreadRef, ThreadState, Tid};

/// Parent links of every process slot.
///
/// Guarded by the kernel's tree lock, which is always acquired before any
/// process or thread lock.
pub(crate) struct ProcTree {
    pub parent: Box<[Option<usize>]>,
}

/// Monotonic id source with its own lock.
pub(crate) struct IdCounter {
    next: Spinlock<i32>,
}

impl IdCounter {
    fn new(name: &'static str) -> Self {
        Self {
            next: Spinlock::new(name, 1),
        }
    }

    /// Takes the next id.
    pub fn next(&self) -> i32 {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        id
    }
}

/// Snapshot of one thread for [`Kernel::procdump`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadInfo {
    pub tid: Tid,
    pub state: ThreadState,
}

/// Snapshot of one process for [`Kernel::procdump`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcState,
    pub killed: bool,
    pub frozen: bool,
    pub threads: Vec<ThreadInfo>,
}

/// A booted kernel: process table, CPUs and shared services.
pub struct Kernel {
    pub(crate) me: Weak<Kernel>,
    pub(crate) config: KernelConfig,
    pub(crate) machine: Arc<dyn Machine>,
    pub(crate) text: Arc<UserText>,
    pub(crate) cpus: Box<[Arc<Cpu>]>,
    pub(crate) procs: Box<[Process]>,
    pub(crate) tree: Spinlock<ProcTree>,
    pub(crate) pids: IdCounter,
    pub(crate) tids: IdCounter,
    pub(crate) bsems: BsemPool,
    pub(crate) ticks: Spinlock<u64>,
    pub(crate) initproc: spin::Once<usize>,
    pub(crate) epoch: Instant,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
}

impl Kernel {
    /// Starts assembling a kernel.
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    fn new(me: Weak<Kernel>, config: KernelConfig, machine: Arc<dyn Machine>, text: Arc<UserText>) -> Self {
        Self {
            me,
            cpus: (0..config.ncpu).map(|id| Arc::new(Cpu::new(id))).collect(),
            procs: (0..config.nproc)
                .map(|_| Process::new(config.nthread, config.nofile))
                .collect(),
            tree: Spinlock::new(
                "wait_lock",
                ProcTree {
                    parent: vec![None; config.nproc].into_boxed_slice(),
                },
            ),
            pids: IdCounter::new("nextpid"),
            tids: IdCounter::new("nexttid"),
            bsems: BsemPool::new(config.nbsem),
            ticks: Spinlock::new("time", 0),
            initproc: spin::Once::new(),
            epoch: Instant::now(),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            config,
            machine,
            text,
        }
    }

    fn start_cpus(self: &Arc<Self>) -> KernelResult<()> {
        for id in 0..self.cpus.len() {
            let kernel = Arc::clone(self);
            thread::Builder::new()
                .name(format!("{}-cpu{id}", self.config.name))
                .spawn(move || kernel.scheduler(id))
                .map_err(|_| KernelError::CpuStart(id))?;
        }
        info!("{}: {} cpus started", self.config.name, self.cpus.len());
        Ok(())
    }

    /// Configuration the kernel was booted with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Text segment shared by every process.
    pub fn text(&self) -> &Arc<UserText> {
        &self.text
    }

    /// Platform services.
    pub fn machine(&self) -> &Arc<dyn Machine> {
        &self.machine
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> u64 {
        *self.ticks.lock()
    }

    pub(crate) fn proc(&self, slot: usize) -> &Process {
        &self.procs[slot]
    }

    pub(crate) fn thread(&self, t: ThreadRef) -> &Thread {
        &self.procs[t.proc].threads[t.slot]
    }

    pub(crate) fn initproc(&self) -> usize {
        self.initproc.get().copied().unwrap_or(0)
    }

    /// Halts the kernel: records `reason`, stops every scheduler and
    /// panics the calling execution context.
    pub(crate) fn panic(&self, reason: &str) -> ! {
        error!("{}: panic: {reason}", self.config.name);
        self.record_halt(reason);
        panic!("{reason}");
    }

    pub(crate) fn record_halt(&self, reason: &str) {
        let mut slot = self.halt_reason.lock();
        if slot.is_none() {
            *slot = Some(reason.to_owned());
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Whether the kernel has halted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Why the kernel halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().clone()
    }

    /// Stops the scheduler loops at their next pass.
    pub fn shutdown(&self) {
        self.record_halt("shutdown");
    }

    /// Snapshot of every process in use.
    pub fn procdump(&self) -> Vec<ProcInfo> {
        let mut dump = Vec::new();
        for p in self.procs.iter() {
            let g = p.lock.lock();
            if g.state == ProcState::Unused {
                continue;
            }
            let threads = p
                .threads
                .iter()
                .map(|t| {
                    let t = t.lock.lock();
                    ThreadInfo {
                        tid: t.tid,
                        state: t.state,
                    }
                })
                .filter(|t| t.state != ThreadState::Unused)
                .collect();
            let info = ProcInfo {
                pid: g.pid,
                name: g.name.clone(),
                state: g.state,
                killed: g.killed,
                frozen: g.signals.frozen,
                threads,
            };
            info!("{} {:?} {} {:?}", info.pid, info.state, info.name, info.threads);
            dump.push(info);
        }
        dump
    }
}

/// Assembles and boots a kernel.
#[derive(Default)]
pub struct KernelBuilder {
    config: KernelConfig,
    machine: Option<Arc<dyn Machine>>,
    text: Option<Arc<UserText>>,
}

impl KernelBuilder {
    /// Sizing and timing; defaults to [`KernelConfig::default`].
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Platform services; defaults to a [`HostedMachine`].
    pub fn machine(mut self, machine: Arc<dyn Machine>) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Text segment holding the user programs.
    pub fn text(mut self, text: Arc<UserText>) -> Self {
        self.text = Some(text);
        self
    }

    /// Creates the init process at `init` and starts every CPU.
    pub fn boot(self, init: UserAddr) -> KernelResult<Arc<Kernel>> {
        self.config.validate()?;
        let machine = self
            .machine
            .unwrap_or_else(|| Arc::new(HostedMachine::new()) as Arc<dyn Machine>);
        let text = self.text.unwrap_or_default();
        let config = self.config;

        let kernel = Arc::new_cyclic(|me| Kernel::new(me.clone(), config, machine, text));
        kernel.userinit(init)?;
        kernel.start_cpus()?;
        Ok(kernel)
    }
}
