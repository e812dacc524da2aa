//! Core Kernel Services
//!
//! Provides fundamental kernel services:
//! - Process management (fork/exit/wait/kill, exec)
//! - Per-CPU scheduling and the sleep/wakeup rendezvous
//! - Threads sharing a process image

pub mod process;
pub mod scheduler;
pub mod thread;

pub use process::{Pid, ProcHandle, ProcState, Program};
pub use scheduler::Chan;
