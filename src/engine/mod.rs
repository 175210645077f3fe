//! Engine Module
//!
//! The storage engine surface this crate coordinates access to.
//!
//! ## Responsibilities
//! - Environment lifecycle: create, open, flag changes, map resize
//! - Transaction execution through caller-supplied bodies
//! - Distinguished signals: [`SyncError::MapResized`] and [`SyncError::MapFull`]
//!
//! The engine itself is a black box. [`MemoryEnv`] is an in-process
//! implementation used by the tests, the stress binary and the benches.
//!
//! [`SyncError::MapResized`]: crate::SyncError::MapResized
//! [`SyncError::MapFull`]: crate::SyncError::MapFull

mod flags;
mod memory;
mod snapshot;

use std::path::Path;

use crate::error::Result;

pub use flags::{EnvFlags, TxnFlags};
pub use memory::{MemoryEnv, MemoryInfo, MemoryTxn, DEFAULT_MAP_SIZE};
pub use snapshot::{Snapshot, SNAPSHOT_FILENAME};

/// A memory-mapped transactional environment.
///
/// All methods take `&self`; implementations provide their own interior
/// mutability. When [`EnvFlags::NO_LOCK`] is set the implementation performs
/// no synchronization of its own and the caller must serialize writers
/// against everything else.
pub trait Environment: Send + Sync + 'static {
    /// Transaction handle passed to transaction bodies
    type Txn<'t>
    where
        Self: 't;

    /// Allocate a new, unopened environment
    fn create() -> Result<Self>
    where
        Self: Sized;

    /// Open the environment at `path`.
    ///
    /// `mode` holds the unix permission bits for created files.
    fn open(&self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()>;

    fn set_flags(&self, flags: EnvFlags) -> Result<()>;

    fn unset_flags(&self, flags: EnvFlags) -> Result<()>;

    /// Current flags.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotOpen`](crate::SyncError::NotOpen) when the
    /// flags cannot be known yet.
    fn flags(&self) -> Result<EnvFlags>;

    /// Set the memory map size.
    ///
    /// A size of zero adopts the size currently recorded in the environment,
    /// which is how a handle catches up after another process grew the map.
    fn set_map_size(&self, size: u64) -> Result<()>;

    /// Run `op` in a transaction; read-only when `flags` has
    /// [`TxnFlags::READ_ONLY`]. The transaction commits if `op` succeeds.
    fn run_txn(
        &self,
        flags: TxnFlags,
        op: &mut dyn FnMut(&mut Self::Txn<'_>) -> Result<()>,
    ) -> Result<()>;

    /// Run `op` in a read-only transaction
    fn view(&self, op: &mut dyn FnMut(&mut Self::Txn<'_>) -> Result<()>) -> Result<()>;

    /// Run `op` in a read-write transaction
    fn update(&self, op: &mut dyn FnMut(&mut Self::Txn<'_>) -> Result<()>) -> Result<()>;

    /// Run `op` in a read-write transaction pinned to the calling thread
    fn update_locked(&self, op: &mut dyn FnMut(&mut Self::Txn<'_>) -> Result<()>)
        -> Result<()>;
}
