//! Per-CPU State
//!
//! Each simulated CPU carries the bookkeeping a real core would keep in
//! registers and per-CPU storage:
//! - the pid currently dispatched on it
//! - a simulated interrupt-enable flag
//! - the `ncli` push/pop nesting depth and the saved enable intent
//! - the gate its scheduler context parks on between dispatches
//!
//! A host thread is bound to a CPU for as long as it runs a kernel context
//! there; the binding is a thread-local id, the moral equivalent of reading
//! the local APIC.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::context::Gate;
use crate::sys::process::Pid;

thread_local! {
    static CPU_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The CPU the calling thread is currently bound to, if any.
pub(crate) fn current() -> Option<usize> {
    CPU_ID.with(|c| c.get())
}

/// Bind the calling thread to CPU `id`.
pub(crate) fn set_current(id: usize) {
    CPU_ID.with(|c| c.set(Some(id)));
}

/// One simulated CPU.
pub struct Cpu {
    /// CPU index
    pub id: usize,
    /// Scheduler context resume channel
    pub(crate) sched_gate: Arc<Gate>,
    /// Pid dispatched on this CPU, 0 when idle
    proc: AtomicU32,
    /// Simulated interrupt-enable flag
    intr: AtomicBool,
    /// Depth of push_off nesting
    ncli: AtomicU32,
    /// Were interrupts enabled before the outermost push_off?
    intena: AtomicBool,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Cpu {
        Cpu {
            id,
            sched_gate: Arc::new(Gate::new()),
            proc: AtomicU32::new(0),
            intr: AtomicBool::new(false),
            ncli: AtomicU32::new(0),
            intena: AtomicBool::new(false),
        }
    }

    /// Owner tag this CPU stamps into spin locks. 0 means unowned.
    pub(crate) fn tag(&self) -> usize {
        self.id + 1
    }

    /// Pid running here, if any.
    pub fn current_proc(&self) -> Option<Pid> {
        match self.proc.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn set_proc(&self, pid: Pid) {
        self.proc.store(pid, Ordering::SeqCst);
    }

    pub(crate) fn clear_proc(&self) {
        self.proc.store(0, Ordering::SeqCst);
    }

    /// Enable simulated interrupts (sti).
    pub(crate) fn intr_on(&self) {
        self.intr.store(true, Ordering::SeqCst);
    }

    pub(crate) fn intr_enabled(&self) -> bool {
        self.intr.load(Ordering::SeqCst)
    }

    pub(crate) fn ncli(&self) -> u32 {
        self.ncli.load(Ordering::SeqCst)
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.load(Ordering::SeqCst)
    }

    pub(crate) fn set_intena(&self, v: bool) {
        self.intena.store(v, Ordering::SeqCst);
    }

    /// Disable interrupts and bump the nesting depth, remembering the
    /// enable intent at the outermost level.
    pub(crate) fn push_off(&self) {
        let was = self.intr.swap(false, Ordering::SeqCst);
        if self.ncli.load(Ordering::SeqCst) == 0 {
            self.intena.store(was, Ordering::SeqCst);
        }
        self.ncli.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo one push_off, re-enabling interrupts at the outermost level if
    /// they were enabled going in.
    pub(crate) fn pop_off(&self) {
        if self.intr.load(Ordering::SeqCst) {
            panic!("pop_off: interruptible");
        }
        let n = self.ncli.load(Ordering::SeqCst);
        if n == 0 {
            panic!("pop_off");
        }
        self.ncli.store(n - 1, Ordering::SeqCst);
        if n == 1 && self.intena.load(Ordering::SeqCst) {
            self.intr.store(true, Ordering::SeqCst);
        }
    }
}
