//! Filesystem Collaborators
//!
//! The process core does not implement a filesystem; it only needs handles
//! with duplicate/close semantics and the transaction-log bracket that
//! inode release must happen inside. This module provides exactly that:
//! - [`File`] and [`Inode`]: reference-counted handles. Duplication is a
//!   clone, close is a drop; the registry counts live handles so tests can
//!   observe leaks.
//! - [`TxnLog`]: the begin_op/end_op bracket plus the one-time
//!   initialization that must run from a process context because a real
//!   log recovery would block.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

struct FsState {
    live_files: usize,
    live_inodes: usize,
    next: u64,
}

/// Filesystem facade: the root inode, handle registry and txn log.
pub struct Fs {
    state: Arc<spin::Mutex<FsState>>,
    pub(crate) log: TxnLog,
    root: Inode,
}

impl Fs {
    pub(crate) fn new() -> Fs {
        let state = Arc::new(spin::Mutex::new(FsState {
            live_files: 0,
            live_inodes: 0,
            next: 0,
        }));
        let root = Inode::alloc(&state);
        Fs {
            state,
            log: TxnLog::new(),
            root,
        }
    }

    /// The root directory inode; a fresh process's working directory.
    pub fn root(&self) -> Inode {
        self.root.clone()
    }

    /// Open `path`, producing a new open-file handle.
    pub fn open(&self, path: &str) -> File {
        let mut st = self.state.lock();
        st.live_files += 1;
        st.next += 1;
        let id = st.next;
        drop(st);
        log::trace!("fs: open {:?} as file {}", path, id);
        File {
            inner: Arc::new(FileInner {
                id,
                path: path.to_string(),
                registry: Arc::clone(&self.state),
            }),
        }
    }

    /// Release an inode handle. Must run inside a [`TxnLog::begin_op`] /
    /// [`TxnLog::end_op`] bracket: the last release of an inode would
    /// write it back, and writes only happen inside a transaction.
    pub fn put(&self, inode: Inode) {
        debug_assert!(
            self.log.outstanding() > 0,
            "inode {} put outside txn bracket",
            inode.ino()
        );
        drop(inode);
    }

    /// Live open-file handles (the root's own handle excluded).
    pub fn live_files(&self) -> usize {
        self.state.lock().live_files
    }

    /// Live inode handles, the root included.
    pub fn live_inodes(&self) -> usize {
        self.state.lock().live_inodes
    }
}

struct FileInner {
    id: u64,
    path: String,
    registry: Arc<spin::Mutex<FsState>>,
}

impl Drop for FileInner {
    fn drop(&mut self) {
        self.registry.lock().live_files -= 1;
        log::trace!("fs: file {} ({:?}) closed", self.id, self.path);
    }
}

/// Reference-counted open-file handle. Clone duplicates, drop closes.
#[derive(Clone)]
pub struct File {
    inner: Arc<FileInner>,
}

impl File {
    /// Registry-unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &str {
        &self.inner.path
    }
}

struct InodeInner {
    ino: u64,
    registry: Arc<spin::Mutex<FsState>>,
}

impl Drop for InodeInner {
    fn drop(&mut self) {
        self.registry.lock().live_inodes -= 1;
    }
}

/// Reference-counted inode handle.
#[derive(Clone)]
pub struct Inode {
    inner: Arc<InodeInner>,
}

impl Inode {
    fn alloc(state: &Arc<spin::Mutex<FsState>>) -> Inode {
        let mut st = state.lock();
        st.live_inodes += 1;
        st.next += 1;
        let ino = st.next;
        drop(st);
        Inode {
            inner: Arc::new(InodeInner {
                ino,
                registry: Arc::clone(state),
            }),
        }
    }

    /// Inode number.
    pub fn ino(&self) -> u64 {
        self.inner.ino
    }
}

/// Transaction-log bracket.
///
/// Every inode release happens between [`TxnLog::begin_op`] and
/// [`TxnLog::end_op`]; the balance is observable so tests can check the
/// discipline held.
pub struct TxnLog {
    outstanding: AtomicI64,
    ops: AtomicU64,
    ready: spin::Once<()>,
}

impl TxnLog {
    fn new() -> TxnLog {
        TxnLog {
            outstanding: AtomicI64::new(0),
            ops: AtomicU64::new(0),
            ready: spin::Once::new(),
        }
    }

    /// One-time log initialization; runs on the first process context to
    /// be scheduled, never on a scheduler context.
    pub(crate) fn init_once(&self) {
        self.ready.call_once(|| {
            log::info!("fs: transaction log ready");
        });
    }

    /// Open a transaction.
    pub fn begin_op(&self) {
        debug_assert!(self.ready.is_completed(), "txn log used before init");
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the transaction opened by the matching [`TxnLog::begin_op`].
    pub fn end_op(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "end_op without begin_op");
    }

    /// Transactions currently open.
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Total transactions ever opened.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

impl Fs {
    /// The transaction log.
    pub fn txn_log(&self) -> &TxnLog {
        &self.log
    }
}
