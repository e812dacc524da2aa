//! Context Switch Boundary
//!
//! The one place that knows kernel contexts are host threads. A context
//! suspends by parking on its private [`Gate`] and resumes when another
//! context posts a [`Dispatch`] to it; posting to the target and then
//! parking yourself is the raw context swap. Everything above this module
//! sees only `sched()`-shaped control transfer.
//!
//! Two unwind payloads are private to this boundary:
//! - [`ExitRequest`]: a program called exit mid-image; unwinds back to the
//!   context entry stub after the exit bookkeeping is already done.
//! - [`ContextDropped`]: the gate was closed under a parked context during
//!   shutdown; unwinds the whole image so the host thread can retire.
//!
//! A process-wide panic-hook filter keeps both payloads out of stderr.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Once};

use crate::sys::process::{Pid, ProcHandle};
use crate::Kernel;

/// What a resumed context needs to know: which CPU it is now on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dispatch {
    pub cpu: usize,
}

/// Unwind payload for an exit taken in the middle of a program.
pub(crate) struct ExitRequest;

/// Unwind payload for a context torn down while parked.
pub(crate) struct ContextDropped;

struct GateInner {
    slot: Option<Dispatch>,
    closed: bool,
}

/// One-slot resume channel for a single context.
///
/// At most one dispatch is ever in flight toward a context, because a
/// context is resumed only by whoever just suspended in its favor.
pub(crate) struct Gate {
    inner: Mutex<GateInner>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Gate {
        Gate {
            inner: Mutex::new(GateInner {
                slot: None,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Hand a dispatch to the parked owner. Returns false, delivering
    /// nothing, if the gate is already closed; the poster must not park
    /// in that case because no resume can ever come back.
    pub(crate) fn post(&self, d: Dispatch) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return false;
        }
        debug_assert!(inner.slot.is_none(), "gate: dispatch already pending");
        inner.slot = Some(d);
        self.cv.notify_one();
        true
    }

    /// Park until a dispatch arrives. `None` means the gate was closed and
    /// the context must retire.
    pub(crate) fn wait(&self) -> Option<Dispatch> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(d) = inner.slot.take() {
                return Some(d);
            }
            if inner.closed {
                return None;
            }
            inner = self.cv.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Retire the owner: any current or future `wait` returns `None`.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        self.cv.notify_all();
    }
}

static PANIC_FILTER: Once = Once::new();

/// Install a panic hook that swallows this module's private unwind
/// payloads and forwards everything else to the previous hook.
pub(crate) fn install_panic_filter() {
    PANIC_FILTER.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            if payload.is::<ExitRequest>() || payload.is::<ContextDropped>() {
                return;
            }
            prev(info);
        }));
    });
}

fn is_private(payload: &(dyn Any + Send)) -> bool {
    payload.is::<ExitRequest>() || payload.is::<ContextDropped>()
}

/// Park until torn down, then unwind the image.
///
/// Called from a suspension point when a dispatch can no longer arrive.
pub(crate) fn retire() -> ! {
    panic::panic_any(ContextDropped)
}

/// Entry point of a process context's host thread.
///
/// Parks until the first dispatch, then runs the one-time first-schedule
/// path and the process image. Returning from here ends the context; the
/// PCB itself is reaped by wait/join on some other context.
pub(crate) fn context_main(kernel: Arc<Kernel>, pid: Pid, slot: usize, gate: Arc<Gate>) {
    let d = match gate.wait() {
        Some(d) => d,
        // Torn down before ever being scheduled.
        None => return,
    };
    crate::cpu::set_current(d.cpu);
    let handle = ProcHandle::new(kernel, pid, slot);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| first_run(&handle)));
    match outcome {
        Ok(()) => {}
        Err(payload) if is_private(payload.as_ref()) => {}
        // A genuine panic inside a program image; let the host thread die
        // panicked so the reaper can report it.
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// First-schedule path: release the table lock inherited from the
/// dispatching scheduler, run one-time blocking initialization, then call
/// the image. A plain return from the image is an implicit exit.
fn first_run(p: &ProcHandle) {
    let kernel = p.kernel();
    {
        let cpu = kernel.mycpu();
        let inherited = unsafe { kernel.ptable.assume_held(cpu) };
        drop(inherited);
    }
    // May block, so it cannot run on a scheduler context.
    kernel.fs.log.init_once();
    let (entry, arg) = {
        let guard = kernel.table_lock();
        match &guard.procs[p.slot()].tf {
            Some(tf) => (tf.entry.clone(), tf.arg),
            None => panic!("context {}: no trap frame", p.pid()),
        }
    };
    log::trace!("pid {} first run (arg {})", p.pid(), arg);
    entry(p, arg);
    kernel.exit_impl(p);
}

/// Spawn the host thread backing a fresh context. It parks on `gate`
/// until the scheduler dispatches it for the first time.
pub(crate) fn spawn_context(
    kernel: Arc<Kernel>,
    pid: Pid,
    slot: usize,
    gate: Arc<Gate>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("{}-pid{}", crate::NAME, pid))
        .stack_size(crate::KSTACK_SIZE)
        .spawn(move || context_main(kernel, pid, slot, gate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn post_then_wait_delivers() {
        let gate = Gate::new();
        assert!(gate.post(Dispatch { cpu: 3 }));
        let d = gate.wait().unwrap();
        assert_eq!(d.cpu, 3);
    }

    #[test]
    fn close_releases_parked_waiter() {
        let gate = Arc::new(Gate::new());
        let g2 = Arc::clone(&gate);
        let waiter = thread::spawn(move || g2.wait());
        thread::sleep(Duration::from_millis(20));
        gate.close();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn post_after_close_is_refused() {
        let gate = Gate::new();
        gate.close();
        assert!(!gate.post(Dispatch { cpu: 0 }));
        assert!(gate.wait().is_none());
    }

    #[test]
    fn wait_blocks_until_post() {
        let gate = Arc::new(Gate::new());
        let g2 = Arc::clone(&gate);
        let waiter = thread::spawn(move || g2.wait());
        thread::sleep(Duration::from_millis(20));
        gate.post(Dispatch { cpu: 1 });
        assert_eq!(waiter.join().unwrap().unwrap().cpu, 1);
    }
}
