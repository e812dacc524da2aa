//! Sleep Lock
//!
//! A mutex for critical sections long enough that spinning would waste a
//! CPU. The lock word lives under a spin lock; contenders sleep on the
//! lock's own channel and are woken in a batch at release, with the
//! usual re-check loop deciding who actually gets it.

use crate::sync::spinlock::SpinLock;
use crate::sys::process::{Pid, ProcHandle};
use crate::sys::scheduler::Chan;

struct SleepInner {
    locked: bool,
    /// Pid of the holder, 0 when free
    owner: Pid,
}

/// Blocking mutual exclusion built on sleep/wakeup.
pub struct SleepLock {
    name: &'static str,
    inner: SpinLock<SleepInner>,
}

impl SleepLock {
    /// A new unlocked sleep lock.
    pub const fn new(name: &'static str) -> SleepLock {
        SleepLock {
            name,
            inner: SpinLock::new(name, SleepInner {
                locked: false,
                owner: 0,
            }),
        }
    }

    /// Acquire, sleeping while some other process holds the lock.
    pub fn lock(&self, p: &ProcHandle) {
        let kernel = p.kernel();
        let mut guard = kernel.acquire(&self.inner);
        while guard.locked {
            guard = kernel.sleep(p, Chan::of(self), guard);
        }
        guard.locked = true;
        guard.owner = p.pid();
    }

    /// Release and wake every sleeper; exactly one will win the re-check.
    pub fn unlock(&self, p: &ProcHandle) {
        let kernel = p.kernel();
        let mut guard = kernel.acquire(&self.inner);
        assert!(
            guard.locked && guard.owner == p.pid(),
            "sleeplock {}: release without hold",
            self.name
        );
        guard.locked = false;
        guard.owner = 0;
        kernel.wakeup(Chan::of(self));
        drop(guard);
    }

    /// Does `p` hold this lock right now?
    pub fn holding(&self, p: &ProcHandle) -> bool {
        let guard = p.kernel().acquire(&self.inner);
        guard.locked && guard.owner == p.pid()
    }
}
