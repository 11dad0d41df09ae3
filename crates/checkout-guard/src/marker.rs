//! Marker-row fallback for stores without a native named lock
//!
//! A lock is a row in `guard_lock_markers` keyed by lock name, carrying a
//! holder id and a lease. Acquisition inserts the row and relies on the primary
//! key for exclusion; expired rows are cleared before each attempt.
//!
//! This is weaker than [`crate::mysql`]: the marker lives on the shared pool
//! and idempotency reads go to the read connection, which may be a lagging
//! replica. A request can then miss an order the previous holder just
//! committed. Use it only where the store offers nothing better.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{entity::*, query::*, DatabaseConnection, SqlErr};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{count_orders, find_recent_order, insert_order};
use crate::entity::guard_lock_markers;
use crate::error::{GuardError, GuardResult};
use crate::fingerprint::{Fingerprint, LockName};
use crate::store::{wait_deadline, LockStore, NewOrder, OrderRef, StoreSession};

/// Delay between acquisition attempts while a marker is held elsewhere
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Store that serializes with expiring marker rows
pub struct MarkerLockStore {
    primary: Arc<DatabaseConnection>,
    reads: Arc<DatabaseConnection>,
    lease: Duration,
    poll_interval: Duration,
}

impl MarkerLockStore {
    /// Markers, writes and reads all on `primary`
    pub fn new(primary: Arc<DatabaseConnection>, lease: Duration) -> Self {
        Self {
            reads: primary.clone(),
            primary,
            lease,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Send idempotency reads to a separate (replica) connection
    pub fn with_read_connection(mut self, reads: Arc<DatabaseConnection>) -> Self {
        self.reads = reads;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl LockStore for MarkerLockStore {
    type Session = MarkerSession;

    async fn open_session(&self) -> GuardResult<MarkerSession> {
        Ok(MarkerSession {
            primary: self.primary.clone(),
            reads: self.reads.clone(),
            holder: Uuid::new_v4().to_string(),
            lease: self.lease,
            poll_interval: self.poll_interval,
            held: BTreeSet::new(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "marker-rows"
    }
}

/// Request-scoped view; identified to the markers table by `holder`
pub struct MarkerSession {
    primary: Arc<DatabaseConnection>,
    reads: Arc<DatabaseConnection>,
    holder: String,
    lease: Duration,
    poll_interval: Duration,
    held: BTreeSet<LockName>,
}

impl MarkerSession {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// One acquisition attempt: clear an expired marker, skip if a live one
    /// remains, otherwise try to insert ours
    async fn try_insert_marker(&self, name: &LockName) -> GuardResult<bool> {
        let now = Utc::now();
        let lease_until = chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| GuardError::Config(format!("marker lease {:?} out of range", self.lease)))?;

        let expired = guard_lock_markers::Entity::delete_many()
            .filter(guard_lock_markers::Column::LockName.eq(name.as_str()))
            .filter(guard_lock_markers::Column::LeaseUntil.lt(now))
            .exec(self.primary.as_ref())
            .await?;
        if expired.rows_affected > 0 {
            warn!("Cleared expired marker for {} (holder never released it)", name);
        }

        if let Some(live) = guard_lock_markers::Entity::find_by_id(name.as_str().to_string())
            .one(self.primary.as_ref())
            .await?
        {
            debug!("Marker {} held by {} until {}", name, live.holder, live.lease_until);
            return Ok(false);
        }

        let marker = guard_lock_markers::ActiveModel {
            lock_name: Set(name.as_str().to_string()),
            holder: Set(self.holder.clone()),
            acquired_at: Set(now),
            lease_until: Set(lease_until),
        };

        match guard_lock_markers::Entity::insert(marker)
            .exec_without_returning(self.primary.as_ref())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn delete_marker(
    conn: &DatabaseConnection,
    name: &LockName,
    holder: &str,
) -> GuardResult<u64> {
    let result = guard_lock_markers::Entity::delete_many()
        .filter(guard_lock_markers::Column::LockName.eq(name.as_str()))
        .filter(guard_lock_markers::Column::Holder.eq(holder))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

#[async_trait]
impl StoreSession for MarkerSession {
    async fn try_lock(&mut self, name: &LockName, max_wait: Duration) -> GuardResult<bool> {
        let deadline = wait_deadline(max_wait)?;

        loop {
            if self.try_insert_marker(name).await? {
                self.held.insert(name.clone());
                debug!("Marker {} taken by holder {}", name, self.holder);
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn unlock(&mut self, name: &LockName) -> GuardResult<()> {
        if !self.held.remove(name) {
            return Ok(());
        }
        if delete_marker(&self.primary, name, &self.holder).await? == 0 {
            // Lease ran out and somebody else cleared or took the marker
            warn!("Marker {} was no longer owned by holder {}", name, self.holder);
        }
        Ok(())
    }

    async fn find_recent(
        &mut self,
        fingerprint: &Fingerprint,
        window: Duration,
    ) -> GuardResult<Option<OrderRef>> {
        find_recent_order(self.reads.as_ref(), fingerprint, window).await
    }

    async fn record_order(&mut self, order: NewOrder) -> GuardResult<OrderRef> {
        insert_order(self.primary.as_ref(), order).await
    }

    async fn count_orders(&mut self, fingerprint: &Fingerprint) -> GuardResult<u64> {
        count_orders(self.primary.as_ref(), fingerprint).await
    }

    async fn close(mut self) -> GuardResult<()> {
        let held: Vec<LockName> = self.held.iter().cloned().collect();
        for name in held {
            self.unlock(&name).await?;
        }
        Ok(())
    }
}

impl Drop for MarkerSession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let names = std::mem::take(&mut self.held);
        let primary = self.primary.clone();
        let holder = self.holder.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!("Session {} dropped holding {} marker(s), clearing", holder, names.len());
                handle.spawn(async move {
                    for name in names {
                        if let Err(e) = delete_marker(&primary, &name, &holder).await {
                            warn!("Failed to clear marker {} for {}: {}", name, holder, e);
                        }
                    }
                });
            }
            Err(_) => warn!(
                "Session {} dropped outside a runtime; {} marker(s) stay until their lease expires",
                holder,
                names.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::orders;
    use crate::store::OrderStatus;
    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, MockExecResult};

    fn exec(rows_affected: u64) -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected,
        }
    }

    fn no_marker() -> Vec<guard_lock_markers::Model> {
        Vec::new()
    }

    fn live_marker(name: &LockName) -> guard_lock_markers::Model {
        let now = Utc::now();
        guard_lock_markers::Model {
            lock_name: name.as_str().to_string(),
            holder: "other-holder".to_string(),
            acquired_at: now,
            lease_until: now + chrono::Duration::seconds(300),
        }
    }

    fn order_model(id: u64) -> orders::Model {
        orders::Model {
            id,
            fingerprint: "ab".repeat(32),
            customer_identity: "account:9".to_string(),
            status: "processing".to_string(),
            created_at: Utc::now(),
        }
    }

    fn store_with(db: MockDatabase) -> MarkerLockStore {
        MarkerLockStore::new(Arc::new(db.into_connection()), Duration::from_secs(300))
    }

    fn name() -> LockName {
        LockName::new("checkout_guard:marker")
    }

    #[tokio::test]
    async fn test_marker_taken_and_released() {
        // delete expired, look up live marker, insert marker, delete on unlock
        let store = store_with(
            MockDatabase::new(DatabaseBackend::MySql)
                .append_exec_results([exec(0), exec(1), exec(1)])
                .append_query_results([no_marker()]),
        );
        let mut session = store.open_session().await.unwrap();

        assert!(session.try_lock(&name(), Duration::from_secs(1)).await.unwrap());
        session.unlock(&name()).await.unwrap();
        // Already released: no statement, no error
        session.unlock(&name()).await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_marker_polls_until_wait_runs_out() {
        // Attempts at 0ms, 100ms and 150ms all find the other holder's marker
        let store = store_with(
            MockDatabase::new(DatabaseBackend::MySql)
                .append_exec_results([exec(0), exec(0), exec(0)])
                .append_query_results([
                    vec![live_marker(&name())],
                    vec![live_marker(&name())],
                    vec![live_marker(&name())],
                ]),
        )
        .with_poll_interval(Duration::from_millis(100));
        let mut session = store.open_session().await.unwrap();

        let started = Instant::now();
        assert!(!session.try_lock(&name(), Duration::from_millis(150)).await.unwrap());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(150));
        assert!(waited < Duration::from_millis(200));
        assert_eq!(session.held.len(), 0);
    }

    #[tokio::test]
    async fn test_expired_marker_is_cleared_and_taken() {
        // The expiry sweep removes the stale row, then the insert succeeds
        let store = store_with(
            MockDatabase::new(DatabaseBackend::MySql)
                .append_exec_results([exec(1), exec(1)])
                .append_query_results([no_marker()]),
        );
        let mut session = store.open_session().await.unwrap();

        assert!(session.try_lock(&name(), Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_session_clears_its_marker() {
        let primary = Arc::new(
            MockDatabase::new(DatabaseBackend::MySql)
                .append_exec_results([exec(0), exec(1), exec(1)])
                .append_query_results([no_marker()])
                .into_connection(),
        );
        let store = MarkerLockStore::new(primary.clone(), Duration::from_secs(300));
        let mut session = store.open_session().await.unwrap();
        assert!(session.try_lock(&name(), Duration::ZERO).await.unwrap());
        drop(session);
        drop(store);

        // The cleanup task owns the last other handle to the connection
        for _ in 0..100 {
            if Arc::strong_count(&primary) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let Ok(conn) = Arc::try_unwrap(primary) else {
            panic!("cleanup task never finished");
        };
        // delete expired, lookup, insert, delete from the drop path
        assert_eq!(conn.into_transaction_log().len(), 4);
    }

    #[tokio::test]
    async fn test_reads_go_to_read_connection() {
        // Primary has no query results: any read sent there would fail
        let primary = MockDatabase::new(DatabaseBackend::MySql).into_connection();
        let replica = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![order_model(5)]])
            .into_connection();
        let store = MarkerLockStore::new(Arc::new(primary), Duration::from_secs(300))
            .with_read_connection(Arc::new(replica));
        let mut session = store.open_session().await.unwrap();

        let found = session
            .find_recent(&Fingerprint::from_stored("ab".repeat(32)), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, 5);
        assert_eq!(found.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_lagging_replica_misses_primary_write() {
        // The order lands on the primary; the replica has not seen it yet
        let primary = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_results([MockExecResult {
                last_insert_id: 8,
                rows_affected: 1,
            }])
            .append_query_results([vec![order_model(8)]])
            .into_connection();
        let replica = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([Vec::<orders::Model>::new()])
            .into_connection();
        let store = MarkerLockStore::new(Arc::new(primary), Duration::from_secs(300))
            .with_read_connection(Arc::new(replica));
        let mut session = store.open_session().await.unwrap();
        let fingerprint = Fingerprint::from_stored("ab".repeat(32));

        let written = session
            .record_order(NewOrder {
                fingerprint: fingerprint.clone(),
                customer_identity: "account:9".to_string(),
                status: OrderStatus::Processing,
            })
            .await
            .unwrap();
        assert_eq!(written.id, 8);
        assert!(session
            .find_recent(&fingerprint, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let store = store_with(
            MockDatabase::new(DatabaseBackend::MySql)
                .append_exec_errors([DbErr::Custom("server has gone away".into())]),
        );
        let mut session = store.open_session().await.unwrap();

        let err = session.try_lock(&name(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_holders() {
        let store = store_with(MockDatabase::new(DatabaseBackend::MySql));
        let a = store.open_session().await.unwrap();
        let b = store.open_session().await.unwrap();
        assert_ne!(a.holder(), b.holder());
    }
}
