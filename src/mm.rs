//! Memory Management
//!
//! Simulation-grade memory collaborators behind the interfaces the process
//! core needs:
//! - [`Vm`]: the address-space registry. Spaces are opaque, reference
//!   counted handles; a process and the threads sharing its image each
//!   hold one handle, and the space is torn down when the last handle
//!   drops, whatever order the holders are reaped in.
//! - [`StackPool`]: a bounded pool of kernel stacks. Taking a stack can
//!   fail, which is the recoverable allocation failure in process
//!   creation.
//!
//! The registry has a fixed capacity so that duplication failure (the
//! fork-time copy) is a reachable, testable path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{KernelError, KernelResult, PAGE_SIZE};

struct VmState {
    live: usize,
    created: u64,
    capacity: usize,
}

/// Address-space registry.
pub struct Vm {
    state: Arc<spin::Mutex<VmState>>,
    installs: AtomicU64,
    /// Space id currently installed per CPU, 0 for the kernel space
    current: Vec<AtomicU64>,
}

impl Vm {
    pub(crate) fn new(capacity: usize, ncpus: usize) -> Vm {
        Vm {
            state: Arc::new(spin::Mutex::new(VmState {
                live: 0,
                created: 0,
                capacity,
            })),
            installs: AtomicU64::new(0),
            current: (0..ncpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Create a fresh one-page address space.
    pub fn create(&self) -> KernelResult<AddrSpace> {
        self.alloc(PAGE_SIZE)
    }

    /// Copy `space` for a fork child: same size, separate image.
    pub fn duplicate(&self, space: &AddrSpace) -> KernelResult<AddrSpace> {
        self.alloc(space.size())
    }

    fn alloc(&self, size: usize) -> KernelResult<AddrSpace> {
        let mut st = self.state.lock();
        if st.live >= st.capacity {
            log::warn!("vm: out of address spaces ({} live)", st.live);
            return Err(KernelError::OutOfMemory);
        }
        st.live += 1;
        st.created += 1;
        let id = st.created;
        drop(st);
        log::trace!("vm: space {} created ({} bytes)", id, size);
        Ok(AddrSpace {
            inner: Arc::new(SpaceInner {
                id,
                size: AtomicUsize::new(size),
                registry: Arc::clone(&self.state),
            }),
        })
    }

    /// Make `space` current on `cpu`; `None` switches back to the kernel
    /// space between dispatches.
    pub(crate) fn install(&self, cpu: usize, space: Option<&AddrSpace>) {
        let id = space.map_or(0, |s| s.id());
        self.current[cpu].store(id, Ordering::SeqCst);
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    /// Space id installed on `cpu`, 0 for the kernel space.
    pub fn installed(&self, cpu: usize) -> u64 {
        self.current[cpu].load(Ordering::SeqCst)
    }

    /// Number of live address spaces.
    pub fn live_spaces(&self) -> usize {
        self.state.lock().live
    }

    /// Total install operations, for instrumentation.
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }
}

struct SpaceInner {
    id: u64,
    size: AtomicUsize,
    registry: Arc<spin::Mutex<VmState>>,
}

impl Drop for SpaceInner {
    fn drop(&mut self) {
        self.registry.lock().live -= 1;
        log::trace!("vm: space {} released", self.id);
    }
}

/// Reference-counted handle to an address space.
///
/// Cloning shares the space (thread creation); the registry reclaims it
/// when the last handle drops.
#[derive(Clone)]
pub struct AddrSpace {
    inner: Arc<SpaceInner>,
}

impl AddrSpace {
    /// Registry-unique id, stable for the life of the space.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current image size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    /// Grow (or shrink, for negative `delta`) the image. Returns the old
    /// size. Visible to every handle sharing the space.
    pub fn grow(&self, delta: isize) -> KernelResult<usize> {
        let mut old = self.inner.size.load(Ordering::SeqCst);
        loop {
            let new = old as isize + delta;
            if new < 0 {
                return Err(KernelError::InvalidArgument);
            }
            match self.inner.size.compare_exchange(
                old,
                new as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(old),
                Err(cur) => old = cur,
            }
        }
    }
}

struct StackPoolInner {
    free: AtomicUsize,
}

/// Bounded kernel stack pool.
pub struct StackPool {
    inner: Arc<StackPoolInner>,
    capacity: usize,
}

impl StackPool {
    pub(crate) fn new(capacity: usize) -> StackPool {
        StackPool {
            inner: Arc::new(StackPoolInner {
                free: AtomicUsize::new(capacity),
            }),
            capacity,
        }
    }

    /// Reserve one kernel stack. The token returns it to the pool on drop.
    pub(crate) fn take(&self) -> KernelResult<StackToken> {
        let mut free = self.inner.free.load(Ordering::SeqCst);
        loop {
            if free == 0 {
                log::warn!("mm: kernel stack pool exhausted");
                return Err(KernelError::OutOfMemory);
            }
            match self.inner.free.compare_exchange(
                free,
                free - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(StackToken {
                        pool: Arc::clone(&self.inner),
                    })
                }
                Err(cur) => free = cur,
            }
        }
    }

    /// Stacks currently available.
    pub fn available(&self) -> usize {
        self.inner.free.load(Ordering::SeqCst)
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Reservation of one kernel stack.
pub(crate) struct StackToken {
    pool: Arc<StackPoolInner>,
}

impl Drop for StackToken {
    fn drop(&mut self) {
        self.pool.free.fetch_add(1, Ordering::SeqCst);
    }
}
