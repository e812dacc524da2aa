//! Scheduler
//!
//! One scheduler loop per CPU. Each loop owns nothing; it scans the
//! process table for Runnable PCBs in slot order and dispatches them one
//! at a time:
//!
//! ```text
//!   scheduler cpuN                      process context
//!   --------------                      ---------------
//!   lock table
//!   pick Runnable, mark Running
//!   install space, defuse lock  ---->   resume inside sched()
//!   park on sched gate                  re-arm lock, release it
//!                                       ... runs ...
//!                                       lock table, set Runnable/
//!                                         Sleeping/Zombie
//!   resume, re-arm lock         <----   defuse lock, park (or retire)
//!   install kernel space
//!   continue scan
//! ```
//!
//! The table lock is held across every switch and never released in
//! transit; `sched()` enforces the discipline with fatal asserts: lock
//! held by this CPU, exactly one push_off outstanding, caller already
//! moved off Running, interrupts off. The pre-switch interrupt intent is
//! saved and restored onto whichever CPU the context resumes on.
//!
//! sleep/wakeup is the rendezvous: sleeping atomically trades the
//! caller's lock for the table lock, parks on a channel and retakes the
//! caller's lock on the way out. Wakeups are lossy in the other
//! direction only: a wakeup with no sleeper is a no-op, and every
//! sleeper re-checks its condition in a loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::context::{self, Dispatch};
use crate::cpu;
use crate::sync::SpinGuard;
use crate::sys::process::{ProcHandle, ProcState, Ptable};
use crate::{Kernel, KernelError, KernelResult, NPROC};

/// A sleep channel: an opaque address-derived key.
///
/// By convention a channel is the address of the object the sleeper is
/// waiting on, so unrelated rendezvous never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chan(usize);

impl Chan {
    /// The channel keyed by `t`'s address.
    pub fn of<T>(t: &T) -> Chan {
        Chan(t as *const T as usize)
    }
}

/// Scheduler loop for one CPU. Runs on its own host thread until
/// shutdown.
pub(crate) fn run_cpu(kernel: Arc<Kernel>, id: usize) {
    cpu::set_current(id);
    let cpu = &kernel.cpus[id];
    log::debug!("cpu{} scheduler online", id);
    loop {
        if kernel.shutdown.load(Ordering::SeqCst) {
            break;
        }
        // Interrupts on between scans; the table lock pushes them off.
        cpu.intr_on();
        let mut guard = kernel.ptable.lock(cpu);
        for slot in 0..NPROC {
            if guard.procs[slot].state != ProcState::Runnable {
                continue;
            }
            let pid = guard.procs[slot].pid;
            let gate = match guard.procs[slot].gate.clone() {
                Some(g) => g,
                None => continue,
            };
            let space = guard.procs[slot].space.clone();

            cpu.set_proc(pid);
            kernel.vm.install(id, space.as_ref());
            guard.procs[slot].state = ProcState::Running;

            // Hand the table lock to the process with the CPU. The gate
            // cannot be closed here: closing happens only under the
            // table lock, which we hold.
            let sched_gate = Arc::clone(&cpu.sched_gate);
            guard.defuse();
            if !gate.post(Dispatch { cpu: id }) {
                panic!("cpu{}: dispatch to a retired context", id);
            }
            match sched_gate.wait() {
                Some(_) => {}
                None => {
                    log::debug!("cpu{} scheduler retiring mid-dispatch", id);
                    return;
                }
            }
            guard = unsafe { kernel.ptable.assume_held(cpu) };

            // The process is done for now; back to the kernel space.
            kernel.vm.install(id, None);
            cpu.clear_proc();
        }
        drop(guard);
        std::thread::yield_now();
    }
    log::debug!("cpu{} scheduler offline", id);
}

impl Kernel {
    /// Switch from the context owning `slot` back to this CPU's
    /// scheduler, carrying the table lock across.
    ///
    /// The caller must have already moved the PCB off Running. Returns
    /// with the table lock re-armed on whatever CPU dispatched us next.
    pub(crate) fn sched<'a>(
        &'a self,
        slot: usize,
        guard: SpinGuard<'a, Ptable>,
    ) -> SpinGuard<'a, Ptable> {
        let cpu = self.mycpu();
        if !self.ptable.holding(cpu) {
            panic!("sched ptable.lock");
        }
        if cpu.ncli() != 1 {
            panic!("sched locks");
        }
        if guard.procs[slot].state == ProcState::Running {
            panic!("sched running");
        }
        if cpu.intr_enabled() {
            panic!("sched interruptible");
        }
        let intena = cpu.intena();
        let gate = match &guard.procs[slot].gate {
            Some(g) => Arc::clone(g),
            None => panic!("sched: no context"),
        };
        let sched_gate = Arc::clone(&cpu.sched_gate);
        let cpu_id = cpu.id;

        guard.defuse();
        if !sched_gate.post(Dispatch { cpu: cpu_id }) {
            // The scheduler is gone; no resume can ever come. Take the
            // defused lock back, release it and unwind.
            let guard = unsafe { self.ptable.assume_held(cpu) };
            drop(guard);
            context::retire();
        }
        let d = match gate.wait() {
            Some(d) => d,
            None => context::retire(),
        };

        // Possibly a different CPU now.
        cpu::set_current(d.cpu);
        let cpu = &self.cpus[d.cpu];
        let guard = unsafe { self.ptable.assume_held(cpu) };
        cpu.set_intena(intena);
        guard
    }

    /// Give up the CPU for one scheduling round.
    pub(crate) fn yield_impl(&self, p: &ProcHandle) {
        let mut guard = self.table_lock();
        guard.procs[p.slot()].state = ProcState::Runnable;
        let guard = self.sched(p.slot(), guard);
        drop(guard);
    }

    /// Core of the rendezvous: park on `chan` with the table lock held,
    /// clear the channel on the way out.
    pub(crate) fn sleep_locked<'a>(
        &'a self,
        p: &ProcHandle,
        chan: Chan,
        mut guard: SpinGuard<'a, Ptable>,
    ) -> SpinGuard<'a, Ptable> {
        guard.procs[p.slot()].chan = Some(chan);
        guard.procs[p.slot()].state = ProcState::Sleeping;
        let mut guard = self.sched(p.slot(), guard);
        guard.procs[p.slot()].chan = None;
        guard
    }

    /// Sleep on `chan`, atomically releasing the caller's lock.
    ///
    /// The guard proves the caller holds a lock over its condition, so
    /// the lost-wakeup window is closed by construction: the table lock
    /// is taken before the caller's lock is released, and wakeup needs
    /// the table lock to run. Returns with the caller's lock reacquired;
    /// wakeups are advisory and the caller re-checks its condition.
    pub fn sleep<'a, T>(
        &'a self,
        p: &ProcHandle,
        chan: Chan,
        guard: SpinGuard<'a, T>,
    ) -> SpinGuard<'a, T> {
        self.check_teardown();
        let cpu = self.mycpu();
        let source = guard.source();
        let table = self.ptable.lock(cpu);
        drop(guard);
        let table = self.sleep_locked(p, chan, table);
        drop(table);
        source.lock(self.mycpu())
    }

    /// Make every process sleeping on `chan` runnable.
    pub fn wakeup(&self, chan: Chan) {
        let mut guard = self.table_lock();
        guard.wakeup1(chan);
    }
}

impl Ptable {
    /// Wakeup with the table lock already held.
    pub(crate) fn wakeup1(&mut self, chan: Chan) {
        for p in self.procs.iter_mut() {
            if p.state == ProcState::Sleeping && p.chan == Some(chan) {
                p.state = ProcState::Runnable;
            }
        }
    }
}

impl ProcHandle {
    /// Voluntarily yield the CPU; the process stays runnable.
    pub fn yield_now(&self) {
        self.kernel().yield_impl(self);
    }

    /// Sleep on `chan` holding `guard`; see [`Kernel::sleep`].
    pub fn sleep<'a, T>(&'a self, chan: Chan, guard: SpinGuard<'a, T>) -> SpinGuard<'a, T> {
        self.kernel().sleep(self, chan, guard)
    }

    /// Block until `n` clock ticks elapse.
    ///
    /// Returns `Interrupted` without finishing the wait if the process
    /// is killed.
    pub fn sleep_ticks(&self, n: u64) -> KernelResult<()> {
        let kernel = self.kernel();
        let mut t = kernel.acquire(&kernel.ticks);
        let start = *t;
        while *t < start.saturating_add(n) {
            if self.killed() {
                return Err(KernelError::Interrupted);
            }
            t = kernel.sleep(self, Chan::of(&kernel.ticks), t);
        }
        Ok(())
    }
}
