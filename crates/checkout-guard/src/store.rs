//! Storage seam between the guard logic and the relational store
//!
//! A [`LockStore`] hands out request-scoped [`StoreSession`]s. Everything a
//! guarded request does (lock, idempotency read, order write, unlock) goes
//! through one session, so the read observes whatever the previous holder of
//! the lock committed. Dropping a session is session teardown: backends must
//! make sure a dropped session no longer holds any lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{GuardError, GuardResult};
use crate::fingerprint::{Fingerprint, LockName};

/// Order status as stored in the orders table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Refunded,
    Cancelled,
    Failed,
}

impl OrderStatus {
    /// Statuses that never count as an earlier submission of the same cart
    pub const EXCLUDED: [OrderStatus; 2] = [OrderStatus::Cancelled, OrderStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::OnHold => "on_hold",
            Self::Completed => "completed",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Whether an order in this status blocks a repeat submission
    pub fn counts_as_duplicate(&self) -> bool {
        !Self::EXCLUDED.contains(self)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = GuardError;

    fn from_str(s: &str) -> GuardResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "on_hold" => Ok(Self::OnHold),
            "completed" => Ok(Self::Completed),
            "refunded" => Ok(Self::Refunded),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(GuardError::store_unavailable(format!(
                "orders table holds unknown status '{}'",
                other
            ))),
        }
    }
}

/// Reference to an order already committed for a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub id: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Order row written by the persistence side while the lock is held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub fingerprint: Fingerprint,
    pub customer_identity: String,
    pub status: OrderStatus,
}

/// Oldest `created_at` that still falls inside `window`.
/// Errors instead of overflowing when the window reaches past the representable range.
pub fn window_cutoff(window: Duration) -> GuardResult<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|span| Utc::now().checked_sub_signed(span))
        .ok_or_else(|| GuardError::Config(format!("idempotency window {:?} out of range", window)))
}

/// Instant at which a lock wait of `max_wait` gives up
pub fn wait_deadline(max_wait: Duration) -> GuardResult<Instant> {
    Instant::now()
        .checked_add(max_wait)
        .ok_or_else(|| GuardError::Config(format!("lock wait {:?} out of range", max_wait)))
}

/// Factory for request-scoped sessions
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    type Session: StoreSession;

    /// Open a session bound to one server-side connection
    async fn open_session(&self) -> GuardResult<Self::Session>;

    fn backend_name(&self) -> &'static str;
}

/// One request's view of the store
#[async_trait]
pub trait StoreSession: Send + 'static {
    /// Try to take the named lock, waiting at most `max_wait`.
    /// Returns `Ok(false)` when the wait elapsed with the lock still held elsewhere.
    async fn try_lock(&mut self, name: &LockName, max_wait: Duration) -> GuardResult<bool>;

    /// Give the named lock back. Releasing a lock this session does not hold is a no-op.
    async fn unlock(&mut self, name: &LockName) -> GuardResult<()>;

    /// Most recent non-cancelled, non-failed order for `fingerprint` created less than `window` ago
    async fn find_recent(
        &mut self,
        fingerprint: &Fingerprint,
        window: Duration,
    ) -> GuardResult<Option<OrderRef>>;

    /// Write an order through this session
    async fn record_order(&mut self, order: NewOrder) -> GuardResult<OrderRef>;

    /// Count every order stored for a fingerprint, whatever its age or status
    async fn count_orders(&mut self, fingerprint: &Fingerprint) -> GuardResult<u64>;

    /// Orderly teardown
    async fn close(self) -> GuardResult<()>;
}
