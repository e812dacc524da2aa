//! Synchronization Primitives
//!
//! Two tiers, matching how long the caller is prepared to wait:
//! - [`SpinLock`]: short critical sections, interrupts pushed off, never
//!   held across anything that blocks (except via the scheduler's own
//!   handoff protocol).
//! - [`SleepLock`], [`Condvar`], [`Semaphore`]: long waits, built on the
//!   scheduler's sleep/wakeup rendezvous so blocked contexts give up
//!   their CPU.

pub mod condvar;
pub mod sleeplock;
pub mod spinlock;

pub use condvar::{Condvar, Semaphore};
pub use sleeplock::SleepLock;
pub use spinlock::{SpinGuard, SpinLock};
