//! Sync Module
//!
//! Transaction admission and error recovery in front of an [`Environment`].
//!
//! ## Responsibilities
//! - Serialize map resizes against running transactions
//! - Substitute for engine locking when NO_LOCK is set
//! - Drive the handler-chain retry loop for every transaction
//!
//! [`Environment`]: crate::engine::Environment

mod env;
mod runner;

pub use env::{bag_env, SyncEnv};
pub use runner::{HandlerRunner, TxnRunner};
