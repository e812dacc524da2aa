//! muProc Kernel Core
//!
//! SMP process table, per-CPU schedulers and the sleep/wakeup rendezvous,
//! packaged as a hosted simulation kernel. Each kernel context (one per CPU
//! plus one per live process) runs on its own host thread; the handoff
//! between contexts is a raw post-and-park exchange hidden inside the
//! `context` module, so everything above it reads like an ordinary
//! multiprocessor kernel.
//!
//! Process lifecycle:
//!
//! ```text
//!   Unused -> Embryo -> Runnable <-> Running -> Zombie -> Unused
//!                          ^            |
//!                          |            v
//!                          +-------- Sleeping
//! ```
//!
//! Subsystems:
//! - `sys::process`   process table, fork/exit/wait/kill, exec
//! - `sys::scheduler` per-CPU scheduler loops, sched(), sleep/wakeup, ticks
//! - `sys::thread`    kernel-visible threads sharing an address space
//! - `sync`           spin lock, sleep lock, condition variable, semaphore
//! - `mm`             reference-counted address spaces and kernel stacks
//! - `fs`             reference-counted file/inode handles and the txn log
//!
//! All state hangs off an explicit [`Kernel`] value; there are no global
//! singletons. Construct one with [`Kernel::new`], seed it with
//! [`Kernel::userinit`], then call [`Kernel::start`].

pub mod context;
pub mod cpu;
pub mod fs;
pub mod mm;
pub mod sync;
pub mod sys;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cpu::Cpu;
use crate::sync::{SpinGuard, SpinLock};
use crate::sys::process::Ptable;

pub use crate::sys::process::{program, Pid, ProcHandle, ProcState, Program, TrapFrame};
pub use crate::sys::scheduler::Chan;

/// Kernel name reported in logs.
pub const NAME: &str = "muproc";

/// Kernel version reported in logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of process table slots.
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Maximum number of simulated CPUs.
pub const MAX_CPUS: usize = 8;

/// Bytes in a page; the initial image size of a fresh address space.
pub const PAGE_SIZE: usize = 4096;

/// Host stack size for a kernel context.
pub const KSTACK_SIZE: usize = 256 * 1024;

/// Result type used by all fallible kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Recoverable kernel errors.
///
/// Invariant violations are not errors; they panic. This enum covers only
/// conditions a correct caller can run into at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A bounded resource (table slot, stack, address space) is exhausted
    OutOfMemory,
    /// No such process / no children to wait for
    NotFound,
    /// Malformed request
    InvalidArgument,
    /// The operation cannot complete without blocking
    WouldBlock,
    /// The caller was killed while blocked
    Interrupted,
    /// The operation was already performed
    AlreadyExists,
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of a bounded resource"),
            KernelError::NotFound => write!(f, "No such process"),
            KernelError::InvalidArgument => write!(f, "Malformed request"),
            KernelError::WouldBlock => write!(f, "Operation would block"),
            KernelError::Interrupted => write!(f, "Killed while blocked"),
            KernelError::AlreadyExists => write!(f, "Already done"),
        }
    }
}

impl std::error::Error for KernelError {}

/// Construction parameters for a [`Kernel`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of simulated CPUs (1..=[`MAX_CPUS`])
    pub ncpus: usize,
    /// Address-space registry capacity
    pub max_spaces: usize,
    /// Kernel stack pool capacity
    pub stack_pool: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ncpus: 4,
            max_spaces: NPROC,
            stack_pool: NPROC,
        }
    }
}

/// The kernel: process table, CPUs and collaborator subsystems.
///
/// Everything is owned here and reached through `&Kernel`; process programs
/// get at it through the [`ProcHandle`] they are invoked with.
pub struct Kernel {
    pub(crate) ptable: SpinLock<Ptable>,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) vm: mm::Vm,
    pub(crate) stacks: mm::StackPool,
    pub(crate) fs: fs::Fs,
    pub(crate) ticks: SpinLock<u64>,
    pub(crate) shutdown: AtomicBool,
    started: AtomicBool,
    sched_handles: spin::Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Build a kernel from `config`. Fails if the CPU count is out of range.
    pub fn new(config: Config) -> KernelResult<Arc<Kernel>> {
        if config.ncpus == 0 || config.ncpus > MAX_CPUS {
            return Err(KernelError::InvalidArgument);
        }
        context::install_panic_filter();
        log::info!(
            "{} {}: {} cpus, {} proc slots, {} space slots",
            NAME,
            VERSION,
            config.ncpus,
            NPROC,
            config.max_spaces
        );
        let cpus = (0..config.ncpus).map(Cpu::new).collect();
        Ok(Arc::new(Kernel {
            ptable: SpinLock::new("ptable", Ptable::new()),
            cpus,
            vm: mm::Vm::new(config.max_spaces, config.ncpus),
            stacks: mm::StackPool::new(config.stack_pool),
            fs: fs::Fs::new(),
            ticks: SpinLock::new("time", 0),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            sched_handles: spin::Mutex::new(Vec::new()),
        }))
    }

    /// Number of simulated CPUs.
    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    /// Start one scheduler loop per CPU. Callable once.
    pub fn start(self: &Arc<Self>) -> KernelResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(KernelError::AlreadyExists);
        }
        let mut handles = self.sched_handles.lock();
        for id in 0..self.cpus.len() {
            let kernel = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-cpu{}", NAME, id))
                .stack_size(KSTACK_SIZE)
                .spawn(move || sys::scheduler::run_cpu(kernel, id))
                .map_err(|_| KernelError::OutOfMemory)?;
            handles.push(handle);
        }
        log::info!("{} cpus online", handles.len());
        Ok(())
    }

    /// Stop the scheduler loops, then tear down every remaining context.
    ///
    /// Idempotent; call it from outside the kernel, not from a process
    /// program. A still-running process stops at its next kernel entry
    /// (any operation that touches the table, sleeps or yields); a
    /// program that never re-enters the kernel cannot be stopped. After
    /// this returns no kernel thread is left running.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("shutting down");
        // With the sched gates closed, a context reaching sched() finds
        // no scheduler to hand the lock to; it takes the lock back,
        // releases it and unwinds instead of parking. Contexts already
        // inside a table critical section release normally and retire at
        // their next entry, so the lock below is acquired, not seized.
        for cpu in &self.cpus {
            cpu.sched_gate.close();
        }
        let handles: Vec<_> = self.sched_handles.lock().drain(..).collect();
        for h in handles {
            if h.join().is_err() {
                log::error!("cpu scheduler panicked during shutdown");
            }
        }
        let mut contexts = Vec::new();
        {
            let mut guard = self.ptable.lock_external();
            for slot in 0..NPROC {
                let p = &mut guard.procs[slot];
                if let Some(gate) = p.gate.take() {
                    gate.close();
                }
                if let Some(mut ks) = p.kstack.take() {
                    if let Some(h) = ks.take_handle() {
                        contexts.push((p.pid, h));
                    }
                }
                p.state = ProcState::Unused;
            }
        }
        for (pid, h) in contexts {
            if h.join().is_err() {
                log::error!("context {} panicked during shutdown", pid);
            }
        }
        log::info!("kernel halted");
    }

    /// Advance the simulated clock by one tick and wake timed sleepers.
    ///
    /// Called by the embedder in place of a timer interrupt; safe from any
    /// thread.
    pub fn tick(&self) {
        let mut t = self.acquire(&self.ticks);
        *t += 1;
        self.wakeup(Chan::of(&self.ticks));
        drop(t);
    }

    /// Current tick count.
    pub fn ticks(&self) -> u64 {
        *self.acquire(&self.ticks)
    }

    /// Total process-table lock acquisitions, for instrumentation.
    pub fn table_acquisitions(&self) -> u64 {
        self.ptable.acquisitions()
    }

    /// The CPU the calling context is bound to. Panics off-context.
    pub(crate) fn mycpu(&self) -> &Cpu {
        match cpu::current() {
            Some(id) => &self.cpus[id],
            None => panic!("mycpu: not on a cpu"),
        }
    }

    /// Acquire a spin lock with this kernel's interrupt bookkeeping when
    /// the caller is a kernel context, and plainly when it is an embedder
    /// thread. The lock may be owned by anyone, the kernel included.
    pub fn acquire<'a, T>(&'a self, lock: &'a SpinLock<T>) -> SpinGuard<'a, T> {
        match cpu::current() {
            Some(id) => lock.lock(&self.cpus[id]),
            None => lock.lock_external(),
        }
    }

    /// Lock the process table; see [`Kernel::acquire`].
    ///
    /// Every kernel operation passes through here, which makes it the
    /// natural cancellation point for teardown.
    pub(crate) fn table_lock(&self) -> SpinGuard<'_, Ptable> {
        self.check_teardown();
        self.acquire(&self.ptable)
    }

    /// Unwind the calling process context if shutdown has begun.
    ///
    /// Only kernel contexts retire; embedder threads pass through so the
    /// teardown itself (and post-shutdown diagnostics) can run. Called
    /// before acquiring, never while holding, the table lock.
    pub(crate) fn check_teardown(&self) {
        if self.shutdown.load(Ordering::SeqCst) && cpu::current().is_some() {
            context::retire();
        }
    }

    /// The address-space registry.
    pub fn vm(&self) -> &mm::Vm {
        &self.vm
    }

    /// The filesystem collaborator.
    pub fn fs(&self) -> &fs::Fs {
        &self.fs
    }

    /// The kernel stack pool.
    pub fn stacks(&self) -> &mm::StackPool {
        &self.stacks
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
