//! Transaction runners
//!
//! [`TxnRunner`] is the transaction surface shared by [`SyncEnv`] and the
//! views it hands out. A [`HandlerRunner`] runs transactions on a wrapper
//! with an extended handler chain and leaves the wrapper untouched.

use crate::engine::{Environment, TxnFlags};
use crate::error::Result;
use crate::handler::{Handler, HandlerChain};

use super::SyncEnv;

/// Something that runs transactions with error handling
pub trait TxnRunner<E: Environment> {
    /// Run `op` in a transaction, read-only if `flags` has READ_ONLY
    fn run_txn<F>(&self, flags: TxnFlags, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>;

    /// Run `op` in a read-only transaction
    fn view<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>;

    /// Run `op` in a read-write transaction
    fn update<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>;

    /// Run `op` in a read-write transaction pinned to the calling thread
    fn update_locked<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>;
}

impl<E: Environment> TxnRunner<E> for SyncEnv<E> {
    fn run_txn<F>(&self, flags: TxnFlags, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        SyncEnv::run_txn(self, flags, op)
    }

    fn view<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        SyncEnv::view(self, op)
    }

    fn update<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        SyncEnv::update(self, op)
    }

    fn update_locked<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        SyncEnv::update_locked(self, op)
    }
}

/// A [`SyncEnv`] paired with its own handler chain
pub struct HandlerRunner<'a, E: Environment> {
    env: &'a SyncEnv<E>,
    handlers: HandlerChain<E>,
}

impl<'a, E: Environment> HandlerRunner<'a, E> {
    pub(crate) fn new(env: &'a SyncEnv<E>, handlers: HandlerChain<E>) -> Self {
        Self { env, handlers }
    }

    /// A runner on the same wrapper with `handler` appended to this chain
    pub fn with_handler(&self, handler: impl Handler<E> + 'static) -> HandlerRunner<'a, E> {
        HandlerRunner::new(self.env, self.handlers.append(handler))
    }

    pub fn env(&self) -> &'a SyncEnv<E> {
        self.env
    }

    pub fn handlers(&self) -> &HandlerChain<E> {
        &self.handlers
    }
}

impl<E: Environment> TxnRunner<E> for HandlerRunner<'_, E> {
    fn run_txn<F>(&self, flags: TxnFlags, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.env.run_txn_with(&self.handlers, flags, op)
    }

    fn view<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.env.view_with(&self.handlers, op)
    }

    fn update<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.env.update_with(&self.handlers, op)
    }

    fn update_locked<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.env.update_locked_with(&self.handlers, op)
    }
}
