//! Synchronized environment wrapper
//!
//! Owns the engine handle and the admission lock, proxies the operations
//! that need synchronization and drives the handler-chain retry loop.

use std::convert::Infallible;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::bag::{Bag, BagKey};
use crate::config::Config;
use crate::engine::{EnvFlags, Environment, TxnFlags};
use crate::error::{Result, SyncError};
use crate::handler::{Handler, HandlerChain};

use super::HandlerRunner;

/// Private key binding the wrapper into per-call bags
enum EnvKey<E> {
    _Never(Infallible, PhantomData<fn() -> E>),
}

impl<E: Environment> BagKey for EnvKey<E> {
    type Value = SyncEnv<E>;
}

/// The wrapper running the current call, if `bag` came from one
pub fn bag_env<E: Environment>(bag: &Bag) -> Option<SyncEnv<E>> {
    bag.value::<EnvKey<E>>().cloned()
}

/// State shared by every clone of a [`SyncEnv`]
struct Shared<E> {
    env: E,

    /// Mirrors the engine's NO_LOCK flag
    no_lock: AtomicBool,

    /// Admission lock: transactions vs. resizes, and in NO_LOCK mode
    /// writes vs. everything else
    txn_lock: RwLock<()>,
}

/// An [`Environment`] with transaction admission control.
///
/// ## Admission Rules (per attempt)
///
/// | Engine locking        | Read attempt | Write attempt |
/// |-----------------------|--------------|---------------|
/// | enabled               | shared       | shared        |
/// | disabled (`NO_LOCK`)  | shared       | exclusive     |
///
/// [`SyncEnv::set_map_size`] always takes the lock exclusively, so no
/// transaction on this wrapper overlaps a resize.
///
/// ## Retries
///
/// Each attempt's result goes through the handler chain. A chain result of
/// [`SyncError::RetryTxn`] redoes the attempt; anything else is returned.
///
/// Transaction bodies must not call back into the same wrapper: the nested
/// call would wait on the admission lock the outer attempt holds.
///
/// Clones share the engine handle, admission lock and lock-mode flag.
pub struct SyncEnv<E: Environment> {
    shared: Arc<Shared<E>>,
    handlers: HandlerChain<E>,
    bag: Bag,
}

impl<E: Environment> SyncEnv<E> {
    /// Wrap `env`, or a freshly created engine handle if `None`.
    ///
    /// An already-open handle with NO_LOCK set is detected here. A handle
    /// that is not open yet is assumed to use engine locking.
    pub fn new(env: Option<E>, handlers: Vec<Arc<dyn Handler<E>>>) -> Result<Self> {
        let env = match env {
            Some(env) => env,
            None => E::create()?,
        };

        let no_lock = match env.flags() {
            Ok(flags) => flags.contains(EnvFlags::NO_LOCK),
            Err(SyncError::NotOpen) => false,
            Err(e) => return Err(e),
        };

        tracing::debug!(no_lock, handlers = handlers.len(), "wrapping environment");

        Ok(Self {
            shared: Arc::new(Shared {
                env,
                no_lock: AtomicBool::new(no_lock),
                txn_lock: RwLock::new(()),
            }),
            handlers: HandlerChain::new(handlers),
            bag: Bag::background(),
        })
    }

    // =========================================================================
    // Lifecycle Proxies
    // =========================================================================

    /// Open the engine; NO_LOCK in `flags` switches to exclusive writes
    pub fn open(&self, path: impl AsRef<Path>, flags: EnvFlags, mode: u32) -> Result<()> {
        let path = path.as_ref();
        self.shared.env.open(path, flags, mode)?;

        if flags.contains(EnvFlags::NO_LOCK) {
            self.shared.no_lock.store(true, Ordering::SeqCst);
        }
        tracing::debug!(path = %path.display(), ?flags, "environment opened");
        Ok(())
    }

    /// Set the configured map size, then open with the configured flags
    pub fn open_with_config(&self, path: impl AsRef<Path>, config: &Config) -> Result<()> {
        config.validate()?;
        self.set_map_size(config.map_size)?;
        self.open(path, config.open_flags, config.file_mode)
    }

    /// Proxy for the engine's `set_flags`.
    ///
    /// Setting NO_LOCK waits for running transactions so none straddles the
    /// mode switch.
    pub fn set_flags(&self, flags: EnvFlags) -> Result<()> {
        if !flags.contains(EnvFlags::NO_LOCK) {
            return self.shared.env.set_flags(flags);
        }

        let _guard = self.shared.txn_lock.write();
        self.shared.env.set_flags(flags)?;
        self.shared.no_lock.store(true, Ordering::SeqCst);
        tracing::debug!("engine locking disabled; writes are now exclusive");
        Ok(())
    }

    /// Proxy for the engine's `unset_flags`.
    ///
    /// Unsetting NO_LOCK waits for running transactions so none straddles
    /// the mode switch.
    pub fn unset_flags(&self, flags: EnvFlags) -> Result<()> {
        if !flags.contains(EnvFlags::NO_LOCK) {
            return self.shared.env.unset_flags(flags);
        }

        let _guard = self.shared.txn_lock.write();
        self.shared.env.unset_flags(flags)?;
        self.shared.no_lock.store(false, Ordering::SeqCst);
        tracing::debug!("engine locking enabled; writes are now shared");
        Ok(())
    }

    /// Resize the memory map once all running transactions have finished.
    ///
    /// Transactions that begin after this returns see the new size.
    pub fn set_map_size(&self, size: u64) -> Result<()> {
        self.set_map_size_delayed(size, Duration::ZERO)
    }

    /// Resize while holding the admission lock exclusively, sleeping for
    /// `delay` first. Local transactions stay blocked for the whole window.
    pub(crate) fn set_map_size_delayed(&self, size: u64, delay: Duration) -> Result<()> {
        let _guard = self.shared.txn_lock.write();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.shared.env.set_map_size(size)?;
        tracing::debug!(size, ?delay, "map size set");
        Ok(())
    }

    /// Adopt the map size another process recorded in the environment
    pub(crate) fn adopt_map_size(&self, delay: Duration) -> Result<()> {
        self.set_map_size_delayed(0, delay)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run `op` in a transaction, read-only if `flags` has READ_ONLY
    pub fn run_txn<F>(&self, flags: TxnFlags, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.run_txn_with(&self.handlers, flags, op)
    }

    /// Run `op` in a read-only transaction
    pub fn view<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.view_with(&self.handlers, op)
    }

    /// Run `op` in a read-write transaction.
    ///
    /// With NO_LOCK set this blocks, and is blocked by, every other
    /// transaction on the wrapper.
    pub fn update<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.update_with(&self.handlers, op)
    }

    /// Run `op` in a read-write transaction pinned to the calling thread
    pub fn update_locked<F>(&self, op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.update_locked_with(&self.handlers, op)
    }

    /// A runner using this wrapper's handlers followed by `handler`.
    ///
    /// The wrapper's own chain is not modified.
    pub fn with_handler(&self, handler: impl Handler<E> + 'static) -> HandlerRunner<'_, E> {
        HandlerRunner::new(self, self.handlers.append(handler))
    }

    pub(crate) fn run_txn_with<F>(
        &self,
        chain: &HandlerChain<E>,
        flags: TxnFlags,
        mut op: F,
    ) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        let readonly = flags.contains(TxnFlags::READ_ONLY);
        self.run_handler(readonly, chain, || self.shared.env.run_txn(flags, &mut op))
    }

    pub(crate) fn view_with<F>(&self, chain: &HandlerChain<E>, mut op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.run_handler(true, chain, || self.shared.env.view(&mut op))
    }

    pub(crate) fn update_with<F>(&self, chain: &HandlerChain<E>, mut op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.run_handler(false, chain, || self.shared.env.update(&mut op))
    }

    pub(crate) fn update_locked_with<F>(&self, chain: &HandlerChain<E>, mut op: F) -> Result<()>
    where
        F: FnMut(&mut E::Txn<'_>) -> Result<()>,
    {
        self.run_handler(false, chain, || self.shared.env.update_locked(&mut op))
    }

    /// Attempt, hand the result to `chain`, repeat while it asks for a retry
    fn run_handler<F>(&self, readonly: bool, chain: &HandlerChain<E>, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let mut bag = self.bag.with::<EnvKey<E>>(self.clone());
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = self.admit(readonly, &mut attempt);

            let (next, result) = chain.handle_txn_err(bag, result);
            bag = next;

            match result {
                Err(SyncError::RetryTxn) => {
                    tracing::debug!(attempts, readonly, "retrying transaction");
                }
                other => return other,
            }
        }
    }

    /// Run one attempt under the admission lock.
    ///
    /// The lock mode is chosen from the NO_LOCK flag, which may flip while
    /// this call waits for the lock. The flag is checked again once the lock
    /// is held and the attempt only runs if the mode still matches.
    fn admit<F>(&self, readonly: bool, attempt: &mut F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        loop {
            if !readonly && self.shared.no_lock.load(Ordering::SeqCst) {
                let _guard = self.shared.txn_lock.write();
                if self.shared.no_lock.load(Ordering::SeqCst) {
                    return attempt();
                }
            } else {
                let _guard = self.shared.txn_lock.read();
                if readonly || !self.shared.no_lock.load(Ordering::SeqCst) {
                    return attempt();
                }
            }
            tracing::trace!(readonly, "lock mode changed while waiting; re-admitting");
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// True when engine locking is disabled and writes are exclusive
    pub fn is_no_lock(&self) -> bool {
        self.shared.no_lock.load(Ordering::SeqCst)
    }

    /// The handlers every call on this wrapper runs
    pub fn handlers(&self) -> &HandlerChain<E> {
        &self.handlers
    }

    /// The underlying engine handle.
    ///
    /// # Safety
    ///
    /// Calls made directly on the engine bypass the admission lock and the
    /// lock-mode flag. Resizing, changing NO_LOCK, or running transactions
    /// through the returned handle while the wrapper is in use can break
    /// every guarantee above; with NO_LOCK set the engine has no protection
    /// of its own. Only use it for operations the wrapper does not proxy.
    pub unsafe fn raw(&self) -> &E {
        &self.shared.env
    }
}

impl<E: Environment> Clone for SyncEnv<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handlers: self.handlers.clone(),
            bag: self.bag.clone(),
        }
    }
}
