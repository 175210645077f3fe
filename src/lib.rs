//! # envsync
//!
//! Transaction admission and error recovery for memory-mapped transactional
//! environments:
//! - Map resizes serialized against running transactions
//! - Writer/reader exclusion when the engine's own locking is disabled
//! - Pluggable error handlers with transparent, bounded retries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Callers (view / update / run_txn)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │              SyncEnv / HandlerRunner                         │
//! │        (admission RwLock, lock-mode flag)                    │
//! └──────────┬──────────────────────────────┬───────────────────┘
//!            │ attempt                      │ (bag, result)
//!            ▼                              ▼
//!   ┌─────────────────┐            ┌─────────────────┐
//!   │   Environment   │            │  HandlerChain   │
//!   │    (engine)     │◄───────────│ MapResized, ... │
//!   └─────────────────┘  adopt map └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use envsync::{default_handlers, EnvFlags, MemoryEnv, SyncEnv};
//!
//! # fn main() -> envsync::Result<()> {
//! let env: SyncEnv<MemoryEnv> = SyncEnv::new(None, default_handlers())?;
//! env.open("./envsync_data", EnvFlags::empty(), 0o644)?;
//!
//! env.update(|txn| txn.put(b"hello", b"world"))?;
//!
//! let mut value = None;
//! env.view(|txn| {
//!     value = txn.get(b"hello").map(<[u8]>::to_vec);
//!     Ok(())
//! })?;
//! assert_eq!(value.as_deref(), Some(&b"world"[..]));
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod bag;
pub mod engine;
pub mod handler;
pub mod sync;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, SyncError};
pub use config::{Backoff, Config};
pub use bag::{Bag, BagKey};
pub use engine::{EnvFlags, Environment, MemoryEnv, MemoryTxn, TxnFlags};
pub use handler::{default_handlers, handler_fn, Handler, HandlerChain, MapResizedHandler};
pub use sync::{bag_env, HandlerRunner, SyncEnv, TxnRunner};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of envsync
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
