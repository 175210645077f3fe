//! Map resize recovery
//!
//! Handles [`SyncError::MapResized`]: another process grew the memory map,
//! so this process adopts the new size and retries. The adoption runs under
//! the exclusive admission lock, after an optional backoff delay, so no
//! local transaction starts until the new size is in place.
//!
//! [`SyncError::MapFull`] is deliberately left alone; growing the map is
//! the application's decision.

use crate::bag::{Bag, BagKey};
use crate::config::{Backoff, Config};
use crate::engine::Environment;
use crate::error::{Result, SyncError};
use crate::sync::bag_env;

use super::Handler;

/// Adoptions performed so far within one call
enum ResizeCount {}

impl BagKey for ResizeCount {
    type Value = u32;
}

/// Number of resize adoptions recorded in `bag`
pub fn resize_count(bag: &Bag) -> u32 {
    bag.value::<ResizeCount>().copied().unwrap_or(0)
}

/// Adopts externally resized maps and retries, up to a limit per call
#[derive(Debug, Clone, PartialEq)]
pub struct MapResizedHandler {
    max_retries: u32,
    backoff: Backoff,
}

impl MapResizedHandler {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_resize_retries, config.resize_backoff)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }
}

impl Default for MapResizedHandler {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl<E: Environment> Handler<E> for MapResizedHandler {
    fn handle_txn_err(&self, bag: Bag, result: Result<()>) -> (Bag, Result<()>) {
        match result {
            Err(SyncError::MapResized) => {}
            other => return (bag, other),
        }

        let env = match bag_env::<E>(&bag) {
            Some(env) => env,
            None => return (bag, Err(SyncError::MapResized)),
        };

        let retries = resize_count(&bag);
        if retries >= self.max_retries {
            tracing::warn!(retries, "map resized again after retry limit; giving up");
            return (bag, Err(SyncError::MapResized));
        }

        let bag = bag.with::<ResizeCount>(retries + 1);
        let delay = self.backoff.delay(retries);
        tracing::debug!(retry = retries + 1, ?delay, "adopting map size set by another process");

        match env.adopt_map_size(delay) {
            Ok(()) => (bag, Err(SyncError::RetryTxn)),
            Err(e) => (bag, Err(e)),
        }
    }
}
