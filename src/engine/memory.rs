//! In-memory reference engine
//!
//! BTreeMap-based environment with snapshot reads and a single writer.
//!
//! ## Concurrency Model
//! - **Reads**: clone an `Arc` of the committed tree; never block on writers
//! - **Writes**: serialized by the store's writer mutex, commit by swapping
//!   the tree
//! - **NO_LOCK**: nothing blocks; overlapping writer/writer or writer/reader
//!   transactions fail with [`SyncError::LockConflict`] instead
//!
//! ## Map Size
//! Each handle has an adopted map size; the store records the size set by
//! the most recent resize. A transaction on a handle whose adopted size is
//! below the recorded one fails with [`SyncError::MapResized`] until the
//! handle calls `set_map_size(0)`. Handles created with [`MemoryEnv::attach`]
//! share one store and play the part of cooperating processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{Result, SyncError};

use super::snapshot::{Snapshot, SNAPSHOT_FILENAME};
use super::{EnvFlags, Environment, TxnFlags};

/// Map size used when none has been set (1 MB)
pub const DEFAULT_MAP_SIZE: u64 = 1024 * 1024;

/// Committed state of the store
#[derive(Debug, Clone, Default)]
struct Tree {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,

    /// Sum of key and value lengths
    used: u64,
}

impl Tree {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tree = Tree::default();
        for (key, value) in snapshot.entries {
            tree.used += (key.len() + value.len()) as u64;
            tree.entries.insert(key, value);
        }
        tree
    }
}

/// State shared by every handle attached to one environment
struct Store {
    /// Committed tree (swapped on commit)
    data: RwLock<Arc<Tree>>,

    /// Map size recorded by the most recent resize on any handle
    recorded_map_size: AtomicU64,

    /// Serializes writers while internal locking is enabled
    writer: Mutex<()>,

    /// Live transactions, tracked for NO_LOCK conflict detection
    active_readers: AtomicUsize,
    active_writers: AtomicUsize,

    /// Snapshot file, if the environment was opened with a path
    path: Mutex<Option<PathBuf>>,
}

impl Store {
    fn new() -> Self {
        Self {
            data: RwLock::new(Arc::new(Tree::default())),
            recorded_map_size: AtomicU64::new(0),
            writer: Mutex::new(()),
            active_readers: AtomicUsize::new(0),
            active_writers: AtomicUsize::new(0),
            path: Mutex::new(None),
        }
    }
}

/// Usage figures for one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Map size this handle has adopted
    pub map_size: u64,

    /// Map size recorded in the shared store
    pub recorded_map_size: u64,

    /// Bytes used by committed keys and values
    pub used: u64,

    /// Number of committed entries
    pub entries: usize,
}

/// One handle onto an in-memory environment
pub struct MemoryEnv {
    store: Arc<Store>,
    flags: AtomicU32,
    open: AtomicBool,
    map_size: AtomicU64,
    mode: AtomicU32,

    /// Transactions currently running on this handle
    active: AtomicUsize,
}

impl MemoryEnv {
    /// Create a new, unopened environment
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::new()), 0, false)
    }

    fn with_store(store: Arc<Store>, map_size: u64, open: bool) -> Self {
        Self {
            store,
            flags: AtomicU32::new(0),
            open: AtomicBool::new(open),
            map_size: AtomicU64::new(map_size),
            mode: AtomicU32::new(0o644),
            active: AtomicUsize::new(0),
        }
    }

    /// Open a second handle on the same store, as another process would.
    ///
    /// The new handle adopts the currently recorded map size and starts with
    /// no flags set.
    pub fn attach(&self) -> Result<MemoryEnv> {
        if !self.is_open() {
            return Err(SyncError::NotOpen);
        }
        let recorded = self.store.recorded_map_size.load(Ordering::SeqCst);
        let env = Self::with_store(Arc::clone(&self.store), recorded, true);
        env.mode.store(self.mode.load(Ordering::Relaxed), Ordering::Relaxed);
        Ok(env)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Current usage figures
    pub fn info(&self) -> MemoryInfo {
        let tree = Arc::clone(&*self.store.data.read());
        MemoryInfo {
            map_size: self.map_size.load(Ordering::SeqCst),
            recorded_map_size: self.store.recorded_map_size.load(Ordering::SeqCst),
            used: tree.used,
            entries: tree.entries.len(),
        }
    }

    /// Write the committed tree to the snapshot file, if any
    pub fn sync(&self) -> Result<()> {
        let tree = Arc::clone(&*self.store.data.read());
        self.persist(&tree)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn current_flags(&self) -> EnvFlags {
        EnvFlags::from_bits(self.flags.load(Ordering::SeqCst))
    }

    fn snapshot_path(path: &Path, flags: EnvFlags) -> Result<Option<PathBuf>> {
        if path.as_os_str().is_empty() {
            return Ok(None);
        }
        if flags.contains(EnvFlags::NO_SUBDIR) {
            return Ok(Some(path.to_path_buf()));
        }
        std::fs::create_dir_all(path)?;
        Ok(Some(path.join(SNAPSHOT_FILENAME)))
    }

    fn persist(&self, tree: &Tree) -> Result<()> {
        let path = match self.store.path.lock().clone() {
            Some(path) => path,
            None => return Ok(()),
        };
        let snapshot = Snapshot {
            map_size: self.store.recorded_map_size.load(Ordering::SeqCst),
            entries: tree
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        snapshot.store(&path, self.mode.load(Ordering::Relaxed))
    }

    /// Checks shared by every transaction start
    fn begin(&self) -> Result<ActiveGuard<'_>> {
        if !self.is_open() {
            return Err(SyncError::NotOpen);
        }
        let guard = ActiveGuard::enter(&self.active);

        let recorded = self.store.recorded_map_size.load(Ordering::SeqCst);
        if recorded > self.map_size.load(Ordering::SeqCst) {
            return Err(SyncError::MapResized);
        }
        Ok(guard)
    }

    fn admit_reader(&self) -> Result<ActiveGuard<'_>> {
        let guard = ActiveGuard::enter(&self.store.active_readers);
        if self.current_flags().contains(EnvFlags::NO_LOCK)
            && self.store.active_writers.load(Ordering::SeqCst) > 0
        {
            return Err(SyncError::LockConflict(
                "read transaction overlaps a write transaction".to_string(),
            ));
        }
        Ok(guard)
    }

    fn admit_writer(&self) -> Result<(MutexGuard<'_, ()>, ActiveGuard<'_>)> {
        if !self.current_flags().contains(EnvFlags::NO_LOCK) {
            let lock = self.store.writer.lock();
            return Ok((lock, ActiveGuard::enter(&self.store.active_writers)));
        }

        let lock = self.store.writer.try_lock().ok_or_else(|| {
            SyncError::LockConflict("write transaction overlaps a write transaction".to_string())
        })?;
        let guard = ActiveGuard::enter(&self.store.active_writers);
        if self.store.active_readers.load(Ordering::SeqCst) > 0 {
            return Err(SyncError::LockConflict(
                "write transaction overlaps a read transaction".to_string(),
            ));
        }
        Ok((lock, guard))
    }

    fn execute(
        &self,
        readonly: bool,
        op: &mut dyn FnMut(&mut MemoryTxn<'_>) -> Result<()>,
    ) -> Result<()> {
        let _active = self.begin()?;
        let map_size = self.map_size.load(Ordering::SeqCst);

        if readonly {
            let _reader = self.admit_reader()?;
            let base = Arc::clone(&*self.store.data.read());
            let mut txn = MemoryTxn {
                env: self,
                base,
                pending: None,
                map_size,
            };
            return op(&mut txn);
        }

        let (_lock, _writer) = self.admit_writer()?;
        let base = Arc::clone(&*self.store.data.read());
        let pending = Some((*base).clone());
        let mut txn = MemoryTxn {
            env: self,
            base,
            pending,
            map_size,
        };
        op(&mut txn)?;

        // Persist before publishing: a failed write leaves the committed
        // tree untouched.
        if let Some(tree) = txn.pending.take() {
            if !self.current_flags().contains(EnvFlags::NO_SYNC) {
                self.persist(&tree)?;
            }
            *self.store.data.write() = Arc::new(tree);
        }
        Ok(())
    }
}

impl Default for MemoryEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for MemoryEnv {
    type Txn<'t> = MemoryTxn<'t>;

    fn create() -> Result<Self> {
        Ok(Self::new())
    }

    /// Open the environment. An empty path keeps it purely in memory.
    fn open(&self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        if self.is_open() {
            return Err(SyncError::AlreadyOpen);
        }

        let flags = self.current_flags() | flags;
        self.mode.store(mode, Ordering::Relaxed);

        let snapshot_path = Self::snapshot_path(path, flags)?;
        let mut recorded = self.store.recorded_map_size.load(Ordering::SeqCst);
        if let Some(file) = &snapshot_path {
            if let Some(snapshot) = Snapshot::load(file)? {
                recorded = recorded.max(snapshot.map_size);
                *self.store.data.write() = Arc::new(Tree::from_snapshot(snapshot));
            }
        }

        let mut map_size = self.map_size.load(Ordering::SeqCst).max(recorded);
        if map_size == 0 {
            map_size = DEFAULT_MAP_SIZE;
        }
        self.map_size.store(map_size, Ordering::SeqCst);
        self.store.recorded_map_size.store(map_size, Ordering::SeqCst);
        *self.store.path.lock() = snapshot_path;

        self.flags.store(flags.bits(), Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_flags(&self, flags: EnvFlags) -> Result<()> {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        Ok(())
    }

    fn unset_flags(&self, flags: EnvFlags) -> Result<()> {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        Ok(())
    }

    fn flags(&self) -> Result<EnvFlags> {
        if !self.is_open() {
            return Err(SyncError::NotOpen);
        }
        Ok(self.current_flags())
    }

    fn set_map_size(&self, size: u64) -> Result<()> {
        if self.active.load(Ordering::SeqCst) > 0 {
            return Err(SyncError::LockConflict(
                "map resized while transactions are active".to_string(),
            ));
        }

        if !self.is_open() {
            self.map_size.store(size, Ordering::SeqCst);
            return Ok(());
        }

        let recorded = self.store.recorded_map_size.load(Ordering::SeqCst);
        if size == 0 {
            self.map_size.store(recorded, Ordering::SeqCst);
            return Ok(());
        }

        let used = self.store.data.read().used;
        let size = size.max(used);
        self.map_size.store(size, Ordering::SeqCst);
        self.store.recorded_map_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    fn run_txn(
        &self,
        flags: TxnFlags,
        op: &mut dyn FnMut(&mut MemoryTxn<'_>) -> Result<()>,
    ) -> Result<()> {
        self.execute(flags.contains(TxnFlags::READ_ONLY), op)
    }

    fn view(&self, op: &mut dyn FnMut(&mut MemoryTxn<'_>) -> Result<()>) -> Result<()> {
        self.execute(true, op)
    }

    fn update(&self, op: &mut dyn FnMut(&mut MemoryTxn<'_>) -> Result<()>) -> Result<()> {
        self.execute(false, op)
    }

    fn update_locked(&self, op: &mut dyn FnMut(&mut MemoryTxn<'_>) -> Result<()>) -> Result<()> {
        self.execute(false, op)
    }
}

/// Counter held for the lifetime of a transaction
struct ActiveGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transaction on a [`MemoryEnv`]
///
/// Read-only transactions see the tree committed when they began. Write
/// transactions work on a private copy that replaces the committed tree
/// when the body returns `Ok`.
pub struct MemoryTxn<'t> {
    env: &'t MemoryEnv,
    base: Arc<Tree>,
    pending: Option<Tree>,
    map_size: u64,
}

impl MemoryTxn<'_> {
    fn tree(&self) -> &Tree {
        self.pending.as_ref().unwrap_or_else(|| self.base.as_ref())
    }

    pub fn is_read_only(&self) -> bool {
        self.pending.is_none()
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.tree().entries.get(key).map(Vec::as_slice)
    }

    /// Put a key-value pair
    ///
    /// # Errors
    ///
    /// [`SyncError::ReadOnly`] in a read-only transaction,
    /// [`SyncError::MapFull`] if the write does not fit in the map.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let map_size = self.map_size;
        let tree = self.pending.as_mut().ok_or(SyncError::ReadOnly)?;

        let replaced = tree
            .entries
            .get(key)
            .map(|old| (key.len() + old.len()) as u64)
            .unwrap_or(0);
        let used = tree.used - replaced + (key.len() + value.len()) as u64;
        if used > map_size {
            return Err(SyncError::MapFull);
        }

        tree.entries.insert(key.to_vec(), value.to_vec());
        tree.used = used;
        Ok(())
    }

    /// Delete a key; returns whether it existed
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let tree = self.pending.as_mut().ok_or(SyncError::ReadOnly)?;
        match tree.entries.remove(key) {
            Some(old) => {
                tree.used -= (key.len() + old.len()) as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.tree()
            .entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.tree().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree().entries.is_empty()
    }

    /// Bytes used by keys and values visible to this transaction
    pub fn used(&self) -> u64 {
        self.tree().used
    }

    /// Map size in effect when the transaction began
    pub fn map_size(&self) -> u64 {
        self.map_size
    }

    /// Flags of the environment this transaction runs in
    pub fn env_flags(&self) -> EnvFlags {
        self.env.current_flags()
    }
}
