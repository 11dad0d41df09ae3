//! Distributed lock manager
//!
//! Every acquisition opens its own store session and keeps it inside the
//! returned [`LockHandle`]. The handle is the only way to reach that session,
//! so whatever runs under the lock runs on the connection that holds it.
//! Dropping a handle without [`LockHandle::release`] tears the session down,
//! which releases the lock on the server side.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{GuardError, GuardResult};
use crate::fingerprint::LockName;
use crate::store::{LockStore, StoreSession};

/// Lifecycle of one lock acquisition.
///
/// A [`LockHandle`] only ever exists as `Held` or `Released`; `TimedOut` ends an
/// attempt that never got the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    Released,
    TimedOut,
}

/// Hands out named locks from a [`LockStore`]
pub struct LockManager<S: LockStore> {
    store: Arc<S>,
}

impl<S: LockStore> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LockStore> LockManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Take the named lock, blocking for at most `max_wait`.
    ///
    /// Returns [`GuardError::LockContended`] when the wait runs out. Store
    /// failures are returned as-is and never retried here.
    pub async fn acquire(
        &self,
        name: LockName,
        max_wait: Duration,
    ) -> GuardResult<LockHandle<S::Session>> {
        debug!("{:?} -> {:?} {} (max wait {:?})", LockState::Unlocked, LockState::Acquiring, name, max_wait);
        let mut session = self.store.open_session().await?;

        let started = Instant::now();
        match session.try_lock(&name, max_wait).await {
            Ok(true) => {
                let waited = started.elapsed();
                info!("Lock {} acquired after {:?}", name, waited);
                Ok(LockHandle {
                    name,
                    session: Some(session),
                    state: LockState::Held,
                    acquired_at: Instant::now(),
                })
            }
            Ok(false) => {
                let waited = started.elapsed();
                info!("Lock {} {:?}: still held elsewhere after {:?}", name, LockState::TimedOut, waited);
                if let Err(e) = session.close().await {
                    warn!("Failed to close session after lock timeout on {}: {}", name, e);
                }
                Err(GuardError::LockContended {
                    name: name.to_string(),
                    waited,
                })
            }
            Err(e) => {
                error!("Store failure while acquiring {}: {}", name, e);
                Err(e)
            }
        }
    }
}

/// Ownership of a held lock plus the session it was taken on
pub struct LockHandle<Sess: StoreSession> {
    name: LockName,
    session: Option<Sess>,
    state: LockState,
    acquired_at: Instant,
}

impl<Sess: StoreSession> LockHandle<Sess> {
    pub fn name(&self) -> &LockName {
        &self.name
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LockState::Held
    }

    /// The session holding the lock; `None` once released
    pub fn session_mut(&mut self) -> Option<&mut Sess> {
        if self.is_held() {
            self.session.as_mut()
        } else {
            None
        }
    }

    /// Release the lock and close its session. Calling it again is a no-op.
    pub async fn release(&mut self) -> GuardResult<()> {
        if self.state != LockState::Held {
            return Ok(());
        }
        self.state = LockState::Released;

        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let unlocked = session.unlock(&self.name).await;
        let closed = session.close().await;

        info!("Lock {} released after {:?}", self.name, self.acquired_at.elapsed());
        unlocked.and(closed)
    }
}

impl<Sess: StoreSession> Drop for LockHandle<Sess> {
    fn drop(&mut self) {
        if self.state == LockState::Held {
            self.state = LockState::Released;
            warn!(
                "Lock {} dropped while held ({:?}), releasing through session teardown",
                self.name,
                self.acquired_at.elapsed()
            );
            drop(self.session.take());
        }
    }
}
