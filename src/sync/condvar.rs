//! Condition Variable and Semaphore
//!
//! Thin shapes over the sleep/wakeup rendezvous. A condition variable is
//! nothing but a channel with manners: waiters park on the variable's
//! address holding the lock that guards their predicate, and every
//! notification wakes all of them to re-check. The semaphore is a counter
//! guarded by its own spin lock with a condition variable for the zero
//! case.

use crate::sync::spinlock::{SpinGuard, SpinLock};
use crate::sys::process::ProcHandle;
use crate::sys::scheduler::Chan;
use crate::Kernel;

/// Condition variable over the kernel rendezvous.
///
/// Wakeups are advisory; a waiter always re-checks its predicate. Both
/// [`signal`] and [`broadcast`] wake every waiter, matching the
/// underlying channel semantics; they exist as separate names so intent
/// reads at the call site.
///
/// [`signal`]: Condvar::signal
/// [`broadcast`]: Condvar::broadcast
pub struct Condvar {
    name: &'static str,
}

impl Condvar {
    /// A new condition variable.
    pub const fn new(name: &'static str) -> Condvar {
        Condvar { name }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Park until notified, releasing `guard` for the duration and
    /// reacquiring it before returning.
    pub fn wait<'a, T>(&self, p: &'a ProcHandle, guard: SpinGuard<'a, T>) -> SpinGuard<'a, T> {
        p.kernel().sleep(p, Chan::of(self), guard)
    }

    /// Wake waiters. Callable from any thread.
    pub fn signal(&self, kernel: &Kernel) {
        kernel.wakeup(Chan::of(self));
    }

    /// Wake all waiters. Callable from any thread.
    pub fn broadcast(&self, kernel: &Kernel) {
        kernel.wakeup(Chan::of(self));
    }
}

/// Counting semaphore.
pub struct Semaphore {
    value: SpinLock<isize>,
    cv: Condvar,
}

impl Semaphore {
    /// A semaphore with `value` initial permits.
    pub const fn new(name: &'static str, value: isize) -> Semaphore {
        Semaphore {
            value: SpinLock::new(name, value),
            cv: Condvar::new(name),
        }
    }

    /// Take a permit, sleeping while none are available.
    pub fn wait(&self, p: &ProcHandle) {
        let kernel = p.kernel();
        let mut guard = kernel.acquire(&self.value);
        while *guard <= 0 {
            guard = self.cv.wait(p, guard);
        }
        *guard -= 1;
    }

    /// Return a permit and wake sleepers. Callable from any thread.
    pub fn post(&self, kernel: &Kernel) {
        let mut guard = kernel.acquire(&self.value);
        *guard += 1;
        self.cv.signal(kernel);
        drop(guard);
    }

    /// Current permit count.
    pub fn value(&self, kernel: &Kernel) -> isize {
        *kernel.acquire(&self.value)
    }
}
