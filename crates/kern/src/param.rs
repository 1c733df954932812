//! Kernel sizing and timing parameters.

use core::time::Duration;

use crate::error::{KernelError, KernelResult};
use crate::hal::PGSIZE;
use crate::trapframe::TRAPFRAME_SIZE;

/// Configuration for a kernel instance.
///
/// Table capacities are fixed for the lifetime of the kernel; slots are
/// reused through their state tags.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    pub ncpu: usize,
    pub nproc: usize,
    pub nthread: usize,
    pub nofile: usize,
    pub nbsem: usize,
    pub image_size: u64,
    pub thread_stack_size: u64,
    pub tick: Duration,
    pub idle_backoff: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "kern",
            ncpu: 2,
            nproc: 16,
            nthread: 8,
            nofile: 16,
            nbsem: 128,
            image_size: 4 * PGSIZE as u64,
            thread_stack_size: 4000,
            tick: Duration::from_millis(1),
            idle_backoff: Duration::from_micros(100),
        }
    }
}

impl KernelConfig {
    /// Creates a new kernel configuration builder.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Checks the configuration before boot.
    ///
    /// All trap frames of a process share one page, so `nthread` is bounded
    /// by how many frames fit in it.
    pub fn validate(&self) -> KernelResult<()> {
        if self.ncpu == 0 {
            return Err(KernelError::Config("ncpu must be at least 1"));
        }
        if self.nproc < 2 {
            return Err(KernelError::Config("nproc must leave room beside init"));
        }
        if self.nthread == 0 || self.nthread * TRAPFRAME_SIZE > PGSIZE {
            return Err(KernelError::Config("nthread trap frames must fit in one page"));
        }
        if self.nofile < 3 {
            return Err(KernelError::Config("nofile must hold the console descriptors"));
        }
        if self.image_size == 0 || self.image_size % PGSIZE as u64 != 0 {
            return Err(KernelError::Config("image_size must be a non-zero page multiple"));
        }
        if self.thread_stack_size < 16 {
            return Err(KernelError::Config("thread_stack_size too small"));
        }
        if self.tick.is_zero() {
            return Err(KernelError::Config("tick must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    /// Sets the name used for OS thread names.
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the number of execution units.
    pub fn ncpu(mut self, n: usize) -> Self {
        self.config.ncpu = n;
        self
    }

    /// Sets the process table capacity.
    pub fn nproc(mut self, n: usize) -> Self {
        self.config.nproc = n;
        self
    }

    /// Sets the number of thread slots per process.
    pub fn nthread(mut self, n: usize) -> Self {
        self.config.nthread = n;
        self
    }

    /// Open-file slots per process.
    pub fn nofile(mut self, n: usize) -> Self {
        self.config.nofile = n;
        self
    }

    /// Sets the binary semaphore pool capacity.
    pub fn nbsem(mut self, n: usize) -> Self {
        self.config.nbsem = n;
        self
    }

    /// Sets the initial memory size of the init process.
    pub fn image_size(mut self, bytes: u64) -> Self {
        self.config.image_size = bytes;
        self
    }

    /// Stack size assumed for created threads.
    pub fn thread_stack_size(mut self, bytes: u64) -> Self {
        self.config.thread_stack_size = bytes;
        self
    }

    /// Sets the timer interval.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    /// Sets how long an idle scheduler pauses before rescanning.
    pub fn idle_backoff(mut self, pause: Duration) -> Self {
        self.config.idle_backoff = pause;
        self
    }

    /// Builds the kernel configuration.
    pub fn build(self) -> KernelConfig {
        self.config
    }
}
