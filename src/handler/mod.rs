//! Handler Module
//!
//! Error-interception middleware for transactions.
//!
//! ## Protocol
//! After every transaction attempt the wrapper passes `(bag, result)` through
//! its [`HandlerChain`]. A handler may:
//! - pass the result through unchanged,
//! - replace it with a different terminal result, or
//! - return [`SyncError::RetryTxn`] to make the wrapper redo the attempt.
//!
//! ```text
//!   Attempting ──ok / terminal err──► Done
//!       │  ▲
//!   err │  │ RetryTxn
//!       ▼  │
//!   HandlingError ──terminal──► Done
//! ```
//!
//! Chains are immutable. [`HandlerChain::append`] builds a new chain that
//! shares the existing handlers, so per-call-site policies can be layered
//! over a shared baseline.

mod resize;

use std::fmt;
use std::sync::Arc;

use crate::bag::Bag;
use crate::engine::Environment;
use crate::error::{Result, SyncError};

pub use resize::{resize_count, MapResizedHandler};

/// Intercepts the result of a transaction attempt
pub trait Handler<E: Environment>: Send + Sync {
    /// Map an attempt's result to the result the caller should see.
    ///
    /// Returning `Err(SyncError::RetryTxn)` redoes the attempt with the
    /// returned bag.
    fn handle_txn_err(&self, bag: Bag, result: Result<()>) -> (Bag, Result<()>);
}

impl<E: Environment, H: Handler<E> + ?Sized> Handler<E> for Arc<H> {
    fn handle_txn_err(&self, bag: Bag, result: Result<()>) -> (Bag, Result<()>) {
        (**self).handle_txn_err(bag, result)
    }
}

/// Adapter turning a closure into a [`Handler`]
#[derive(Clone)]
pub struct HandlerFn<F>(F);

/// Wrap a closure as a handler
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(Bag, Result<()>) -> (Bag, Result<()>) + Send + Sync,
{
    HandlerFn(f)
}

impl<E, F> Handler<E> for HandlerFn<F>
where
    E: Environment,
    F: Fn(Bag, Result<()>) -> (Bag, Result<()>) + Send + Sync,
{
    fn handle_txn_err(&self, bag: Bag, result: Result<()>) -> (Bag, Result<()>) {
        (self.0)(bag, result)
    }
}

/// Ordered, immutable list of handlers
pub struct HandlerChain<E: Environment> {
    handlers: Arc<[Arc<dyn Handler<E>>]>,
}

impl<E: Environment> HandlerChain<E> {
    pub fn new(handlers: Vec<Arc<dyn Handler<E>>>) -> Self {
        Self {
            handlers: handlers.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// A new chain running `self` followed by `handler`; `self` is unchanged
    pub fn append(&self, handler: impl Handler<E> + 'static) -> Self {
        let mut handlers = Vec::with_capacity(self.handlers.len() + 1);
        handlers.extend(self.handlers.iter().cloned());
        handlers.push(Arc::new(handler) as Arc<dyn Handler<E>>);
        Self::new(handlers)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler<E>>> {
        self.handlers.iter()
    }
}

impl<E: Environment> Handler<E> for HandlerChain<E> {
    /// Run each handler in order until the result is a success or the retry
    /// sentinel; later handlers only ever see errors.
    fn handle_txn_err(&self, mut bag: Bag, mut result: Result<()>) -> (Bag, Result<()>) {
        for handler in self.handlers.iter() {
            match &result {
                Ok(()) | Err(SyncError::RetryTxn) => break,
                Err(_) => {}
            }
            (bag, result) = handler.handle_txn_err(bag, result);
        }
        (bag, result)
    }
}

impl<E: Environment> Clone for HandlerChain<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<E: Environment> Default for HandlerChain<E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<E: Environment> fmt::Debug for HandlerChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .finish()
    }
}

/// Baseline handlers: recover from map resizes by other processes
pub fn default_handlers<E: Environment>() -> Vec<Arc<dyn Handler<E>>> {
    vec![Arc::new(MapResizedHandler::default())]
}
