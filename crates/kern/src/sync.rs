//! Spin lock with interrupt masking and holder tracking.
//!
//! The raw lock is a `spin::Mutex<()>`; the protected value lives beside it
//! so that a lock taken on one OS thread can be released on another. That
//! happens at every context switch: the scheduler acquires a thread's lock,
//! and the thread releases it after it is resumed (and the reverse on the
//! way back).

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cpu;

const NO_CPU: usize = usize::MAX;
const SPINS_BEFORE_YIELD: u32 = 64;

/// Mutual exclusion lock that disables interrupts on the holding CPU.
pub struct Spinlock<T> {
    name: &'static str,
    raw: spin::Mutex<()>,
    cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

// Access to `data` is serialized by `raw`.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// An unlocked lock named `name` guarding `value`.
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            raw: spin::Mutex::new(()),
            cpu: AtomicUsize::new(NO_CPU),
            data: UnsafeCell::new(value),
        }
    }

    /// Name given at creation, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// # Panics
    ///
    /// Panics if the current CPU already holds the lock.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        cpu::push_off();
        if self.holding() {
            panic!("acquire {}: already held", self.name);
        }
        let mut spins = 0;
        loop {
            if let Some(guard) = self.raw.try_lock() {
                mem::forget(guard);
                break;
            }
            spins += 1;
            if spins < SPINS_BEFORE_YIELD {
                core::hint::spin_loop();
            } else {
                spins = 0;
                std::thread::yield_now();
            }
        }
        self.cpu.store(cpu::cpuid().unwrap_or(NO_CPU), Ordering::Relaxed);
        SpinlockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Returns whether the current CPU holds this lock.
    ///
    /// Host threads that are not bound to a CPU never report holding.
    pub fn holding(&self) -> bool {
        match cpu::cpuid() {
            Some(id) => self.raw.is_locked() && self.cpu.load(Ordering::Relaxed) == id,
            None => false,
        }
    }

    fn release(&self) {
        if cpu::cpuid().is_some() && !self.holding() {
            panic!("release {}: not held", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        // SAFETY: the raw lock was acquired by `lock` and its guard forgotten.
        unsafe { self.raw.force_unlock() };
        cpu::pop_off();
    }

    /// Releases a lock whose guard lives on another stack.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock on the current CPU and no guard for it
    /// may be dropped afterwards.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("name", &self.name)
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

/// RAII guard for a [`Spinlock`]. Not `Send`: it must be released on the
/// CPU that acquired it.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinlockGuard<'a, T> {
    /// Returns the lock this guard belongs to, so it can be reacquired
    /// after the guard is given up.
    pub fn spinlock(guard: &Self) -> &'a Spinlock<T> {
        guard.lock
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cpu::{self, Cpu};

    #[test]
    fn holding_tracks_the_current_cpu() {
        let c = Arc::new(Cpu::new(3));
        cpu::set_current(Some(c.clone()));

        let lock = Spinlock::new("t", 5u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.holding());
            assert_eq!(c.noff(), 1);
        }
        assert!(!lock.holding());
        assert_eq!(c.noff(), 0);
        assert_eq!(*lock.lock(), 6);

        cpu::set_current(None);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn reacquire_on_same_cpu_is_fatal() {
        cpu::set_current(Some(Arc::new(Cpu::new(0))));
        let lock = Spinlock::new("twice", ());
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    fn force_unlock_releases_a_forgotten_guard() {
        cpu::set_current(Some(Arc::new(Cpu::new(1))));
        let lock = Spinlock::new("handoff", 0u8);
        mem::forget(lock.lock());
        assert!(lock.holding());
        unsafe { lock.force_unlock() };
        assert!(!lock.holding());
        drop(lock.lock());
        cpu::set_current(None);
    }

    #[test]
    fn host_threads_contend_without_a_cpu() {
        let lock = Arc::new(Spinlock::new("counter", 0u64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
