//! Duplicate-submission guard: lock, then check for a recent identical order
//!
//! ```text
//! submission -> fingerprint -> acquire lock -> find recent order
//!     found     -> release lock -> Rejected(existing order)
//!     not found -> Proceed(permit holding the lock)
//!                  permit.record_order(..) -> permit.complete()
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::GuardConfig;
use crate::error::{GuardError, GuardResult};
use crate::fingerprint::{Fingerprint, LockName, Submission};
use crate::idempotency::IdempotencyChecker;
use crate::lock::{LockHandle, LockManager};
use crate::store::{LockStore, NewOrder, OrderRef, OrderStatus, StoreSession};

/// A validated submission, ready to be guarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRequest {
    fingerprint: Fingerprint,
    customer_identity: String,
}

impl GuardRequest {
    pub fn from_submission(submission: &Submission) -> GuardResult<Self> {
        Ok(Self {
            fingerprint: submission.fingerprint()?,
            customer_identity: submission.customer.normalized(),
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn customer_identity(&self) -> &str {
        &self.customer_identity
    }

    pub fn lock_name(&self) -> LockName {
        self.fingerprint.lock_name()
    }
}

/// Decision for one submission
pub enum GuardOutcome<S: LockStore> {
    /// No duplicate found; the permit holds the lock until the order is written
    Proceed(GuardPermit<S>),
    /// An identical order was committed inside the idempotency window
    Rejected(OrderRef),
    /// Another request held the lock for the whole wait; the caller may retry
    Contended { waited: Duration },
    /// The store failed; no order may be created (fail closed)
    StoreUnavailable(GuardError),
}

impl<S: LockStore> GuardOutcome<S> {
    /// Stable label for logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Proceed(_) => "proceed",
            Self::Rejected(_) => "rejected",
            Self::Contended { .. } => "contended",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed(_))
    }
}

impl<S: LockStore> std::fmt::Debug for GuardOutcome<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed(permit) => f
                .debug_tuple("Proceed")
                .field(&permit.request.fingerprint)
                .finish(),
            Self::Rejected(order) => f.debug_tuple("Rejected").field(order).finish(),
            Self::Contended { waited } => {
                f.debug_struct("Contended").field("waited", waited).finish()
            }
            Self::StoreUnavailable(e) => f.debug_tuple("StoreUnavailable").field(e).finish(),
        }
    }
}

/// Permission to create the order for a submission.
///
/// While the guard is enabled the permit owns the lock and its session. The
/// order is written through that session, then [`GuardPermit::complete`]
/// releases the lock. Dropping the permit instead (error, panic, cancelled
/// task) releases it through session teardown.
pub struct GuardPermit<S: LockStore> {
    store: Arc<S>,
    request: GuardRequest,
    handle: Option<LockHandle<S::Session>>,
}

impl<S: LockStore> GuardPermit<S> {
    fn guarded(store: Arc<S>, request: GuardRequest, handle: LockHandle<S::Session>) -> Self {
        Self {
            store,
            request,
            handle: Some(handle),
        }
    }

    fn bypass(store: Arc<S>, request: GuardRequest) -> Self {
        Self {
            store,
            request,
            handle: None,
        }
    }

    pub fn request(&self) -> &GuardRequest {
        &self.request
    }

    /// True when the guard was disabled and nothing is locked
    pub fn is_bypass(&self) -> bool {
        self.handle.is_none()
    }

    pub fn lock_name(&self) -> Option<&LockName> {
        self.handle.as_ref().map(|h| h.name())
    }

    /// Write the order for this submission.
    ///
    /// Guarded permits write through the lock's session so the next holder's
    /// idempotency read is guaranteed to see it.
    pub async fn record_order(&mut self, status: OrderStatus) -> GuardResult<OrderRef> {
        let order = NewOrder {
            fingerprint: self.request.fingerprint.clone(),
            customer_identity: self.request.customer_identity.clone(),
            status,
        };

        match self.handle.as_mut() {
            Some(handle) => {
                let name = handle.name().clone();
                let session = handle.session_mut().ok_or_else(|| {
                    GuardError::store_unavailable(format!(
                        "lock {} already released, refusing to record order",
                        name
                    ))
                })?;
                session.record_order(order).await
            }
            None => {
                let mut session = self.store.open_session().await?;
                let recorded = session.record_order(order).await;
                if let Err(e) = session.close().await {
                    warn!("Failed to close bypass session: {}", e);
                }
                recorded
            }
        }
    }

    /// Release the lock; the order (if any) has been written
    pub async fn complete(mut self) -> GuardResult<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.release().await,
            None => Ok(()),
        }
    }
}

/// Guards order creation against concurrent duplicate submissions
pub struct CheckoutGuard<S: LockStore> {
    config: GuardConfig,
    locks: LockManager<S>,
    checker: IdempotencyChecker,
}

impl<S: LockStore> CheckoutGuard<S> {
    pub fn new(store: Arc<S>, config: GuardConfig) -> Self {
        let checker = IdempotencyChecker::new(config.window());
        info!(
            "Checkout guard on {}: enabled={}, window={}s, lock wait={}s",
            store.backend_name(),
            config.enabled,
            config.window_secs,
            config.lock_wait_secs
        );
        Self {
            config,
            locks: LockManager::new(store),
            checker,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        self.locks.store()
    }

    /// Decide whether this submission may create an order
    pub async fn check(&self, request: &GuardRequest) -> GuardOutcome<S> {
        if !self.config.enabled {
            debug!("Guard disabled, letting {} through", request.fingerprint);
            return GuardOutcome::Proceed(GuardPermit::bypass(
                self.store().clone(),
                request.clone(),
            ));
        }

        match self.try_check(request).await {
            Ok(outcome) => outcome,
            Err(GuardError::LockContended { waited, .. }) => GuardOutcome::Contended { waited },
            Err(e) => {
                error!("Guard failed closed for {}: {}", request.fingerprint, e);
                GuardOutcome::StoreUnavailable(e)
            }
        }
    }

    /// Validate, fingerprint and check a raw submission
    pub async fn check_submission(&self, submission: &Submission) -> GuardResult<GuardOutcome<S>> {
        let request = GuardRequest::from_submission(submission)?;
        Ok(self.check(&request).await)
    }

    async fn try_check(&self, request: &GuardRequest) -> GuardResult<GuardOutcome<S>> {
        let mut handle = self
            .locks
            .acquire(request.lock_name(), self.config.lock_wait())
            .await?;

        let found = match self.checker.find_recent(&mut handle, &request.fingerprint).await {
            Ok(found) => found,
            Err(e) => {
                if let Err(release_err) = handle.release().await {
                    warn!("Failed to release {} after failed check: {}", handle.name(), release_err);
                }
                return Err(e);
            }
        };

        match found {
            Some(existing) => {
                if let Err(e) = handle.release().await {
                    warn!("Failed to release {} after duplicate: {}", handle.name(), e);
                }
                info!(
                    "Duplicate submission {} rejected, existing order {}",
                    request.fingerprint, existing.id
                );
                Ok(GuardOutcome::Rejected(existing))
            }
            None => Ok(GuardOutcome::Proceed(GuardPermit::guarded(
                self.store().clone(),
                request.clone(),
                handle,
            ))),
        }
    }
}
