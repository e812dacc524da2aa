//! Process Management
//!
//! The process table: a fixed array of [`NPROC`] PCBs guarded by one
//! table-wide spin lock. Slots are identities; a slot cycles through
//!
//! ```text
//!   Unused -> Embryo -> Runnable -> Running -> Zombie -> Unused
//! ```
//!
//! and every transition happens under the table lock. Creation follows
//! the classic two-phase shape: reserve the slot and pid under the lock,
//! allocate the kernel stack outside it, roll the slot back to Unused if
//! allocation fails.
//!
//! Exit does not free a process; it leaves a zombie for the parent to
//! reap in wait. Orphans are reparented to the init process. Kill is
//! advisory: it sets a flag and knocks a sleeper runnable; the victim
//! notices at its next cancellation point.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::{self, Gate};
use crate::fs::{File, Inode};
use crate::mm::{AddrSpace, StackToken};
use crate::sync::SpinGuard;
use crate::sys::scheduler::Chan;
use crate::{Kernel, KernelError, KernelResult, NOFILE, NPROC};

/// Process identifier. 0 is never assigned.
pub type Pid = u32;

/// A process image: the code a context runs once dispatched.
///
/// Invoked with the process's own handle and the argument register of its
/// trap frame. Fork children re-enter the image with the register zeroed,
/// which is how a program tells the child branch from the parent's.
pub type Program = Arc<dyn Fn(&ProcHandle, usize) + Send + Sync>;

/// Wrap a closure as a [`Program`].
pub fn program<F>(f: F) -> Program
where
    F: Fn(&ProcHandle, usize) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// PCB lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot free
    Unused,
    /// Mid-creation; invisible to the scheduler
    Embryo,
    /// Ready for dispatch
    Runnable,
    /// Dispatched on some CPU
    Running,
    /// Parked on a channel
    Sleeping,
    /// Exited, awaiting reap
    Zombie,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Sleeping => "sleeping",
            ProcState::Zombie => "zombie",
        };
        f.pad(tag)
    }
}

/// Saved entry state of a process image.
#[derive(Clone)]
pub struct TrapFrame {
    /// Code to run on dispatch
    pub entry: Program,
    /// Argument register; zeroed in a fork child's copy
    pub arg: usize,
}

/// Kernel stack reservation plus the context thread it backs.
pub(crate) struct KStack {
    _token: StackToken,
    handle: Option<JoinHandle<()>>,
}

impl KStack {
    pub(crate) fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

/// Process control block. One fixed slot per process in the table.
pub(crate) struct Proc {
    /// Process id, 0 while the slot is unused
    pub pid: Pid,
    /// Lifecycle state
    pub state: ProcState,
    /// Short human-readable name
    pub name: String,
    /// Parent pid; `None` only for the init process
    pub parent: Option<Pid>,
    /// True for thread-flavored PCBs sharing the parent's image
    pub is_thread: bool,
    /// Advisory kill flag
    pub killed: bool,
    /// Channel this PCB is sleeping on
    pub(crate) chan: Option<Chan>,
    /// Address-space handle; threads hold clones of the owner's
    pub(crate) space: Option<AddrSpace>,
    /// Open files
    pub(crate) ofile: [Option<File>; NOFILE],
    /// Working directory
    pub(crate) cwd: Option<Inode>,
    /// Entry state for the next (first) dispatch
    pub(crate) tf: Option<TrapFrame>,
    /// Caller-supplied thread stack, threads only
    pub(crate) tstack: Option<Box<[u8]>>,
    /// Resume channel of the suspended context
    pub(crate) gate: Option<Arc<Gate>>,
    /// Kernel stack and context thread
    pub(crate) kstack: Option<KStack>,
}

impl Proc {
    fn unused() -> Proc {
        Proc {
            pid: 0,
            state: ProcState::Unused,
            name: String::new(),
            parent: None,
            is_thread: false,
            killed: false,
            chan: None,
            space: None,
            ofile: std::array::from_fn(|_| None),
            cwd: None,
            tf: None,
            tstack: None,
            gate: None,
            kstack: None,
        }
    }
}

/// The process table. Guarded in its entirety by one spin lock.
pub(crate) struct Ptable {
    pub(crate) procs: Box<[Proc]>,
    pub(crate) init_slot: Option<usize>,
    next_pid: Pid,
}

impl Ptable {
    pub(crate) fn new() -> Ptable {
        Ptable {
            procs: (0..NPROC).map(|_| Proc::unused()).collect(),
            init_slot: None,
            next_pid: 1,
        }
    }

    pub(crate) fn slot_of(&self, pid: Pid) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        self.procs.iter().position(|p| p.pid == pid)
    }

    fn find_unused(&self) -> Option<usize> {
        self.procs.iter().position(|p| p.state == ProcState::Unused)
    }

    fn bump_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

/// A process's view of itself and the kernel it lives in.
///
/// Every program is invoked with one; it is the capability through which
/// the process calls fork, wait, sleep and the rest.
pub struct ProcHandle {
    kernel: Arc<Kernel>,
    pid: Pid,
    slot: usize,
}

impl ProcHandle {
    pub(crate) fn new(kernel: Arc<Kernel>, pid: Pid, slot: usize) -> ProcHandle {
        ProcHandle { kernel, pid, slot }
    }

    /// This process's pid.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// The kernel this process runs under.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Current parent pid; changes when the process is orphaned.
    pub fn ppid(&self) -> Option<Pid> {
        let guard = self.kernel.table_lock();
        guard.procs[self.slot].parent
    }

    /// Has someone asked this process to die?
    pub fn killed(&self) -> bool {
        let guard = self.kernel.table_lock();
        guard.procs[self.slot].killed
    }

    /// Process name as of now.
    pub fn name(&self) -> String {
        let guard = self.kernel.table_lock();
        guard.procs[self.slot].name.clone()
    }

    /// Id of the installed address space.
    pub fn space_id(&self) -> Option<u64> {
        let guard = self.kernel.table_lock();
        guard.procs[self.slot].space.as_ref().map(|s| s.id())
    }

    /// Image size of the installed address space.
    pub fn space_size(&self) -> Option<usize> {
        let guard = self.kernel.table_lock();
        guard.procs[self.slot].space.as_ref().map(|s| s.size())
    }

    /// Grow (or shrink) the process image. Returns the old size.
    pub fn grow(&self, delta: isize) -> KernelResult<usize> {
        let space = {
            let guard = self.kernel.table_lock();
            match &guard.procs[self.slot].space {
                Some(s) => s.clone(),
                None => return Err(KernelError::InvalidArgument),
            }
        };
        space.grow(delta)
    }

    /// Create a child process running this process's image.
    ///
    /// The child's trap frame is a copy of the parent's with the argument
    /// register zeroed; open files and the working directory are
    /// duplicated. Returns the child's pid to the parent.
    pub fn fork(&self) -> KernelResult<Pid> {
        let kernel = &self.kernel;
        let (slot, pid) = kernel.allocproc()?;

        let (space, tf, name, ofile, cwd) = {
            let guard = kernel.table_lock();
            let me = &guard.procs[self.slot];
            (
                me.space.clone(),
                me.tf.clone(),
                me.name.clone(),
                me.ofile.clone(),
                me.cwd.clone(),
            )
        };
        let (space, tf) = match (space, tf) {
            (Some(s), Some(t)) => (s, t),
            _ => {
                kernel.dealloc_embryo(slot);
                return Err(KernelError::InvalidArgument);
            }
        };
        let child_space = match kernel.vm.duplicate(&space) {
            Ok(s) => s,
            Err(e) => {
                kernel.dealloc_embryo(slot);
                return Err(e);
            }
        };

        let mut guard = kernel.table_lock();
        let child = &mut guard.procs[slot];
        child.name = name;
        child.space = Some(child_space);
        child.tf = Some(TrapFrame {
            entry: tf.entry,
            arg: 0,
        });
        child.parent = Some(self.pid);
        child.ofile = ofile;
        child.cwd = cwd;
        child.state = ProcState::Runnable;
        drop(guard);
        log::debug!("fork: {} -> {}", self.pid, pid);
        Ok(pid)
    }

    /// Terminate this process. Never returns.
    ///
    /// Open files close, the working directory is released inside a txn
    /// bracket, children are handed to init and the PCB stays zombie
    /// until the parent reaps it.
    pub fn exit(&self) -> ! {
        self.kernel.exit_impl(self);
        std::panic::panic_any(context::ExitRequest)
    }

    /// Wait for any child to exit; returns the reaped child's pid.
    ///
    /// Fails with `NotFound` when there is no child to wait for, and with
    /// `Interrupted` when the caller is killed while waiting.
    pub fn wait(&self) -> KernelResult<Pid> {
        let kernel = &self.kernel;
        let mut guard = kernel.table_lock();
        loop {
            let mut havekids = false;
            let mut zombie = None;
            for slot in 0..NPROC {
                let p = &guard.procs[slot];
                if p.parent != Some(self.pid) {
                    continue;
                }
                havekids = true;
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
                log::debug!("wait: {} reaped {}", self.pid, pid);
                return Ok(pid);
            }
            if !havekids {
                return Err(KernelError::NotFound);
            }
            if guard.procs[self.slot].killed {
                return Err(KernelError::Interrupted);
            }
            let chan = Chan::of(&guard.procs[self.slot]);
            guard = kernel.sleep_locked(self, chan, guard);
        }
    }

    /// Replace this process's image and enter the new one.
    ///
    /// Returns only on failure, with the reason; on success the new image
    /// runs to completion and the process exits.
    pub fn exec(&self, name: &str, entry: Program, arg: usize) -> KernelError {
        let kernel = &self.kernel;
        let space = match kernel.vm.create() {
            Ok(s) => s,
            Err(e) => return e,
        };
        {
            let mut guard = kernel.table_lock();
            let me = &mut guard.procs[self.slot];
            me.name = name.to_string();
            // The old image's handle drops here; last holder frees it.
            me.space = Some(space.clone());
            me.tf = Some(TrapFrame {
                entry: entry.clone(),
                arg,
            });
        }
        let cpu = kernel.mycpu();
        kernel.vm.install(cpu.id, Some(&space));
        log::debug!("exec: {} now {:?}", self.pid, name);
        entry(self, arg);
        self.exit()
    }

    /// Open `path`, returning the new file descriptor.
    pub fn open(&self, path: &str) -> KernelResult<usize> {
        let file = self.kernel.fs.open(path);
        let mut guard = self.kernel.table_lock();
        let me = &mut guard.procs[self.slot];
        match me.ofile.iter().position(|f| f.is_none()) {
            Some(fd) => {
                me.ofile[fd] = Some(file);
                Ok(fd)
            }
            None => Err(KernelError::OutOfMemory),
        }
    }

    /// Duplicate descriptor `fd` into the lowest free slot.
    pub fn dup(&self, fd: usize) -> KernelResult<usize> {
        let mut guard = self.kernel.table_lock();
        let me = &mut guard.procs[self.slot];
        if fd >= NOFILE {
            return Err(KernelError::InvalidArgument);
        }
        let file = match &me.ofile[fd] {
            Some(f) => f.clone(),
            None => return Err(KernelError::NotFound),
        };
        match me.ofile.iter().position(|f| f.is_none()) {
            Some(new_fd) => {
                me.ofile[new_fd] = Some(file);
                Ok(new_fd)
            }
            None => Err(KernelError::OutOfMemory),
        }
    }

    /// Close descriptor `fd`.
    pub fn close(&self, fd: usize) -> KernelResult<()> {
        if fd >= NOFILE {
            return Err(KernelError::InvalidArgument);
        }
        let file = {
            let mut guard = self.kernel.table_lock();
            guard.procs[self.slot].ofile[fd].take()
        };
        match file {
            Some(_) => Ok(()),
            None => Err(KernelError::NotFound),
        }
    }
}

impl Kernel {
    /// Reserve a table slot and spawn its context, leaving the PCB in
    /// Embryo. The caller finishes initialization and flips it Runnable.
    pub(crate) fn allocproc(self: &Arc<Self>) -> KernelResult<(usize, Pid)> {
        let (slot, pid) = {
            let mut guard = self.table_lock();
            let slot = match guard.find_unused() {
                Some(s) => s,
                None => {
                    log::warn!("allocproc: table full");
                    return Err(KernelError::OutOfMemory);
                }
            };
            let pid = guard.bump_pid();
            let p = &mut guard.procs[slot];
            p.pid = pid;
            p.state = ProcState::Embryo;
            (slot, pid)
        };

        // Stack and context allocation happen outside the table lock.
        let token = match self.stacks.take() {
            Ok(t) => t,
            Err(e) => {
                self.dealloc_embryo(slot);
                return Err(e);
            }
        };
        let gate = Arc::new(Gate::new());
        let handle = match context::spawn_context(Arc::clone(self), pid, slot, Arc::clone(&gate)) {
            Ok(h) => h,
            Err(e) => {
                log::error!("allocproc: context spawn failed: {}", e);
                drop(token);
                self.dealloc_embryo(slot);
                return Err(KernelError::OutOfMemory);
            }
        };

        let mut guard = self.table_lock();
        let p = &mut guard.procs[slot];
        p.gate = Some(gate);
        p.kstack = Some(KStack {
            _token: token,
            handle: Some(handle),
        });
        Ok((slot, pid))
    }

    /// Roll a failed Embryo back to Unused.
    pub(crate) fn dealloc_embryo(&self, slot: usize) {
        let (pid, handle) = {
            let mut guard = self.table_lock();
            let pid = guard.procs[slot].pid;
            let handle = self.release_slot(&mut guard, slot);
            (pid, handle)
        };
        self.join_context(pid, handle);
    }

    /// Clear a PCB back to Unused, returning the context thread handle
    /// for the caller to join once the table lock is gone.
    pub(crate) fn release_slot(
        &self,
        guard: &mut SpinGuard<'_, Ptable>,
        slot: usize,
    ) -> Option<JoinHandle<()>> {
        let p = &mut guard.procs[slot];
        if let Some(gate) = p.gate.take() {
            gate.close();
        }
        let handle = p.kstack.take().and_then(|mut k| k.take_handle());
        p.space = None;
        p.tstack = None;
        p.tf = None;
        p.ofile = std::array::from_fn(|_| None);
        p.cwd = None;
        p.pid = 0;
        p.parent = None;
        p.name.clear();
        p.killed = false;
        p.is_thread = false;
        p.chan = None;
        p.state = ProcState::Unused;
        handle
    }

    pub(crate) fn join_context(&self, pid: Pid, handle: Option<JoinHandle<()>>) {
        if let Some(h) = handle {
            if h.join().is_err() {
                log::error!("context {} panicked", pid);
            }
        }
    }

    /// Create the init process: the first PCB, root working directory,
    /// fresh one-page image. Callable once, before or after `start`.
    pub fn userinit(
        self: &Arc<Self>,
        name: &str,
        entry: Program,
        arg: usize,
    ) -> KernelResult<Pid> {
        let (slot, pid) = self.allocproc()?;
        let space = match self.vm.create() {
            Ok(s) => s,
            Err(e) => {
                self.dealloc_embryo(slot);
                return Err(e);
            }
        };
        let cwd = self.fs.root();

        let mut guard = self.table_lock();
        if guard.init_slot.is_some() {
            drop(guard);
            self.dealloc_embryo(slot);
            return Err(KernelError::AlreadyExists);
        }
        let p = &mut guard.procs[slot];
        p.name = name.to_string();
        p.space = Some(space);
        p.cwd = Some(cwd);
        p.tf = Some(TrapFrame { entry, arg });
        p.parent = None;
        p.state = ProcState::Runnable;
        guard.init_slot = Some(slot);
        drop(guard);
        log::info!("init process {} ({:?})", pid, name);
        Ok(pid)
    }

    /// The back half of exit: close files, release the cwd inside a txn
    /// bracket, reparent children, go zombie and hand the CPU back to the
    /// scheduler. The caller's context never runs again after this.
    pub(crate) fn exit_impl(&self, p: &ProcHandle) {
        let (ofile, cwd) = {
            let mut guard = self.table_lock();
            if guard.init_slot == Some(p.slot()) {
                panic!("init exiting");
            }
            let me = &mut guard.procs[p.slot()];
            let ofile = std::mem::replace(&mut me.ofile, std::array::from_fn(|_| None));
            (ofile, me.cwd.take())
        };
        drop(ofile);
        self.fs.log.begin_op();
        if let Some(cwd) = cwd {
            self.fs.put(cwd);
        }
        self.fs.log.end_op();

        let mut guard = self.table_lock();
        // Parent may be sleeping in wait on its own PCB.
        if let Some(ppid) = guard.procs[p.slot()].parent {
            if let Some(ps) = guard.slot_of(ppid) {
                let chan = Chan::of(&guard.procs[ps]);
                guard.wakeup1(chan);
            }
        }
        // Pass abandoned children to init.
        if let Some(init_slot) = guard.init_slot {
            let init_pid = guard.procs[init_slot].pid;
            let mut orphaned_zombie = false;
            for slot in 0..NPROC {
                if guard.procs[slot].parent == Some(p.pid()) {
                    guard.procs[slot].parent = Some(init_pid);
                    if guard.procs[slot].state == ProcState::Zombie {
                        orphaned_zombie = true;
                    }
                }
            }
            if orphaned_zombie {
                let chan = Chan::of(&guard.procs[init_slot]);
                guard.wakeup1(chan);
            }
        }
        guard.procs[p.slot()].state = ProcState::Zombie;
        log::debug!("exit: {}", p.pid());

        // Final handoff. Same discipline as sched, but the context does
        // not park for a resume that can never come; it retires instead.
        let cpu = self.mycpu();
        if !self.ptable.holding(cpu) {
            panic!("sched ptable.lock");
        }
        if cpu.ncli() != 1 {
            panic!("sched locks");
        }
        if cpu.intr_enabled() {
            panic!("sched interruptible");
        }
        let sched_gate = Arc::clone(&cpu.sched_gate);
        let cpu_id = cpu.id;
        guard.defuse();
        if !sched_gate.post(crate::context::Dispatch { cpu: cpu_id }) {
            // Teardown beat us to the handoff. Nobody is left to take
            // the lock; release it ourselves on the way out.
            let guard = unsafe { self.ptable.assume_held(cpu) };
            drop(guard);
        }
    }

    /// Ask `pid` to die. Sleeping victims are made runnable so they reach
    /// a cancellation point promptly.
    pub fn kill(&self, pid: Pid) -> KernelResult<()> {
        let mut guard = self.table_lock();
        let slot = match guard.slot_of(pid) {
            Some(s) => s,
            None => return Err(KernelError::NotFound),
        };
        let p = &mut guard.procs[slot];
        p.killed = true;
        if p.state == ProcState::Sleeping {
            p.state = ProcState::Runnable;
        }
        log::debug!("kill: {}", pid);
        Ok(())
    }

    /// Lifecycle state of `pid`, if such a process exists.
    pub fn proc_state(&self, pid: Pid) -> Option<ProcState> {
        let guard = self.table_lock();
        guard.slot_of(pid).map(|s| guard.procs[s].state)
    }

    /// Number of occupied table slots.
    pub fn live_count(&self) -> usize {
        let guard = self.table_lock();
        guard
            .procs
            .iter()
            .filter(|p| p.state != ProcState::Unused)
            .count()
    }

    /// One line per occupied slot: pid, state, name.
    pub fn procdump(&self) -> String {
        let guard = self.table_lock();
        let mut out = String::new();
        for p in guard.procs.iter() {
            if p.state == ProcState::Unused {
                continue;
            }
            let _ = writeln!(
                out,
                "{:<5} {:<9} {}{}",
                p.pid,
                p.state,
                p.name,
                if p.is_thread { " (thread)" } else { "" }
            );
        }
        out
    }
}
