//! Threads
//!
//! A thread is a process that shares its creator's address space: a
//! full PCB, scheduled like any other, tagged `is_thread` and holding a
//! clone of the owner's space handle instead of a private copy. Because
//! the handles are reference counted, the image survives until the last
//! holder is reaped, in any order.
//!
//! `thread_join` reaps only thread children; plain `wait` does not
//! discriminate and will reap a thread child too if it gets there first.

use crate::sys::process::{Pid, ProcHandle, ProcState, Program, TrapFrame};
use crate::sys::scheduler::Chan;
use crate::{KernelError, KernelResult, NPROC};

impl ProcHandle {
    /// Create a thread running `entry(arg)` in this process's address
    /// space. `stack` is the caller-provided execution stack; it stays
    /// owned by the thread's PCB until the thread is reaped.
    pub fn thread_create(
        &self,
        name: &str,
        entry: Program,
        arg: usize,
        stack: Box<[u8]>,
    ) -> KernelResult<Pid> {
        let kernel = self.kernel();
        let (slot, pid) = kernel.allocproc()?;

        let (space, ofile, cwd) = {
            let guard = kernel.table_lock();
            let me = &guard.procs[self.slot()];
            (me.space.clone(), me.ofile.clone(), me.cwd.clone())
        };
        let space = match space {
            Some(s) => s,
            None => {
                kernel.dealloc_embryo(slot);
                return Err(KernelError::InvalidArgument);
            }
        };

        let mut guard = kernel.table_lock();
        let t = &mut guard.procs[slot];
        t.name = name.to_string();
        // Shared, not duplicated: both PCBs hold the same space.
        t.space = Some(space);
        t.is_thread = true;
        t.tstack = Some(stack);
        t.tf = Some(TrapFrame { entry, arg });
        t.parent = Some(self.pid());
        t.ofile = ofile;
        t.cwd = cwd;
        t.state = ProcState::Runnable;
        drop(guard);
        log::debug!("thread_create: {} -> {}", self.pid(), pid);
        Ok(pid)
    }

    /// Wait for any thread child to exit; returns the reaped thread's
    /// pid. Non-thread children are ignored here.
    pub fn thread_join(&self) -> KernelResult<Pid> {
        let kernel = self.kernel();
        let mut guard = kernel.table_lock();
        loop {
            let mut have_threads = false;
            let mut zombie = None;
            for slot in 0..NPROC {
                let p = &guard.procs[slot];
                if p.parent != Some(self.pid()) || !p.is_thread {
                    continue;
                }
                have_threads = true;
                if p.state == ProcState::Zombie {
                    zombie = Some(slot);
                    break;
                }
            }
            if let Some(slot) = zombie {
                let pid = guard.procs[slot].pid;
                let handle = kernel.release_slot(&mut guard, slot);
                drop(guard);
                kernel.join_context(pid, handle);
                log::debug!("thread_join: {} reaped {}", self.pid(), pid);
                return Ok(pid);
            }
            if !have_threads {
                return Err(KernelError::NotFound);
            }
            if guard.procs[self.slot()].killed {
                return Err(KernelError::Interrupted);
            }
            let chan = Chan::of(&guard.procs[self.slot()]);
            guard = kernel.sleep_locked(self, chan, guard);
        }
    }

    /// Terminate the calling thread. Identical teardown to [`exit`]:
    /// the PCB goes zombie for the joiner, and the shared space handle
    /// is released at reap time.
    ///
    /// [`exit`]: ProcHandle::exit
    pub fn thread_exit(&self) -> ! {
        self.exit()
    }
}
