//! Idempotency check against recently committed orders

use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GuardError, GuardResult};
use crate::fingerprint::Fingerprint;
use crate::lock::LockHandle;
use crate::store::{OrderRef, StoreSession};

/// Looks for an order already created for a fingerprint inside a sliding window
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyChecker {
    window: Duration,
}

impl IdempotencyChecker {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Most recent blocking order for `fingerprint`, read through the session
    /// that holds `handle`.
    ///
    /// An order created `t` ago matches iff `t < window`.
    pub async fn find_recent<Sess: StoreSession>(
        &self,
        handle: &mut LockHandle<Sess>,
        fingerprint: &Fingerprint,
    ) -> GuardResult<Option<OrderRef>> {
        let lock_name = handle.name().clone();
        let session = handle.session_mut().ok_or_else(|| {
            GuardError::store_unavailable(format!(
                "idempotency check on {} without holding the lock",
                lock_name
            ))
        })?;

        let found = session.find_recent(fingerprint, self.window).await?;
        match &found {
            Some(order) => info!(
                "Order {} ({}) created at {} matches fingerprint {}",
                order.id, order.status, order.created_at, fingerprint
            ),
            None => debug!(
                "No order for fingerprint {} in the last {:?}",
                fingerprint, self.window
            ),
        }
        Ok(found)
    }
}
