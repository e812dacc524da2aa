//! Spin Lock
//!
//! A test-and-set spin lock with CPU-owner diagnostics. Acquiring from a
//! kernel context pushes interrupts off for the duration; acquiring from
//! an embedder thread skips the interrupt bookkeeping, since there is
//! nothing to disable there.
//!
//! Instrumentation: every acquisition increments a counter and asserts
//! that no other holder is inside the critical section. The scheduler's
//! lock-transfer protocol ([`SpinGuard::defuse`] / [`SpinLock::assume_held`])
//! moves a held lock between contexts without ever releasing it, so the
//! occupancy flag stays set across the handoff.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::cpu::Cpu;

/// Owner tag for acquisitions made outside any kernel context.
const EXTERNAL_TAG: usize = usize::MAX;

/// Mutual exclusion by busy-waiting.
pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    /// Owner tag: 0 none, cpu id + 1, or [`EXTERNAL_TAG`]
    owner: AtomicUsize,
    /// Total successful acquisitions
    acquisitions: AtomicU64,
    /// Occupancy flag backing the no-overlap assertion
    inside: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// A new unlocked lock. `name` shows up in diagnostics.
    pub const fn new(name: &'static str, value: T) -> SpinLock<T> {
        SpinLock {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            inside: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire from the kernel context bound to `cpu`.
    ///
    /// Panics on re-entrant acquisition by the same CPU, which would
    /// otherwise spin forever.
    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, T> {
        cpu.push_off();
        if self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == cpu.tag() {
            panic!("acquire: {} already held by cpu{}", self.name, cpu.id);
        }
        self.acquire_raw(cpu.tag());
        SpinGuard {
            lock: self,
            cpu: Some(cpu),
        }
    }

    /// Acquire from an embedder thread, outside any kernel context.
    pub fn lock_external(&self) -> SpinGuard<'_, T> {
        self.acquire_raw(EXTERNAL_TAG);
        SpinGuard {
            lock: self,
            cpu: None,
        }
    }

    /// Is this lock held by the context bound to `cpu`?
    pub(crate) fn holding(&self, cpu: &Cpu) -> bool {
        self.locked.load(Ordering::SeqCst) && self.owner.load(Ordering::SeqCst) == cpu.tag()
    }

    /// Total successful acquisitions so far.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Re-arm a guard for a lock that is already held, transferring
    /// ownership to `cpu` without a release/acquire cycle.
    ///
    /// # Safety
    ///
    /// The lock must be held and its previous guard defused; exactly one
    /// context may re-arm per defuse. Interrupt nesting carried by the
    /// defused guard transfers with it.
    pub(crate) unsafe fn assume_held<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, T> {
        debug_assert!(self.locked.load(Ordering::SeqCst), "{}: not held", self.name);
        self.owner.store(cpu.tag(), Ordering::SeqCst);
        SpinGuard {
            lock: self,
            cpu: Some(cpu),
        }
    }

    fn acquire_raw(&self, tag: usize) {
        let mut spins = 0u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                // Host scheduler fairness: the holder may be descheduled.
                std::thread::yield_now();
            }
        }
        let overlapped = self.inside.swap(true, Ordering::SeqCst);
        assert!(!overlapped, "{}: overlapping critical sections", self.name);
        self.owner.store(tag, Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn release_raw(&self) {
        self.inside.store(false, Ordering::SeqCst);
        self.owner.store(0, Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard; releasing pops the interrupt push taken at acquisition.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    cpu: Option<&'a Cpu>,
}

impl<'a, T> SpinGuard<'a, T> {
    /// The lock this guard protects.
    pub(crate) fn source(&self) -> &'a SpinLock<T> {
        self.lock
    }

    /// Forget the guard without releasing the lock or popping interrupts.
    ///
    /// The lock stays held; some other context re-arms it with
    /// [`SpinLock::assume_held`]. This is the scheduler's lock-transfer
    /// step across a context switch.
    pub(crate) fn defuse(self) {
        std::mem::forget(self);
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_raw();
        if let Some(cpu) = self.cpu {
            cpu.pop_off();
        }
    }
}
