//! Native MySQL/TiDB store: `GET_LOCK` named locks on a dedicated session
//!
//! A named lock taken with `GET_LOCK` belongs to the server session that took
//! it. It is freed by `RELEASE_LOCK` or when the session ends, whichever comes
//! first. Each [`MySqlSession`] owns a pool capped at one connection, so the
//! lock, the idempotency read and the order insert all run on the session
//! that holds the lock.

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::database::{connect_session, count_orders, find_recent_order, insert_order, mask_url};
use crate::error::{GuardError, GuardResult};
use crate::fingerprint::{Fingerprint, LockName};
use crate::store::{LockStore, NewOrder, OrderRef, StoreSession};

/// Store backed by MySQL named locks
pub struct MySqlLockStore {
    database_url: String,
}

impl MySqlLockStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl LockStore for MySqlLockStore {
    type Session = MySqlSession;

    async fn open_session(&self) -> GuardResult<MySqlSession> {
        let conn = connect_session(&self.database_url).await?;
        debug!("Opened guard session on {}", mask_url(&self.database_url));
        Ok(MySqlSession::from_connection(conn))
    }

    fn backend_name(&self) -> &'static str {
        "mysql-get-lock"
    }
}

/// One server session
pub struct MySqlSession {
    conn: DatabaseConnection,
    held: BTreeSet<LockName>,
    /// `CONNECTION_ID()` of the server session that took the held locks
    connection_id: Option<i64>,
}

impl MySqlSession {
    /// Wrap a connection that is already pinned to a single session
    pub fn from_connection(conn: DatabaseConnection) -> Self {
        Self {
            conn,
            held: BTreeSet::new(),
            connection_id: None,
        }
    }

    /// Names of the locks this session currently holds
    pub fn held_locks(&self) -> impl Iterator<Item = &LockName> {
        self.held.iter()
    }

    async fn select_row(&self, sql: &str, values: Vec<sea_orm::Value>) -> GuardResult<QueryResult> {
        self.conn
            .query_one(Statement::from_sql_and_values(DbBackend::MySql, sql, values))
            .await?
            .ok_or_else(|| GuardError::store_unavailable(format!("no row returned by {}", sql)))
    }

    /// Every held lock must still belong to the server session that took it;
    /// a reconnected pool means the server already released it
    async fn verify_held(&mut self) -> GuardResult<()> {
        let Some(expected) = self.connection_id else {
            return Ok(());
        };

        let names: Vec<LockName> = self.held.iter().cloned().collect();
        for name in names {
            let row = self
                .select_row(
                    "SELECT CAST(IS_USED_LOCK(?) AS SIGNED) AS owner, \
                     CAST(CONNECTION_ID() AS SIGNED) AS conn_id",
                    vec![name.as_str().into()],
                )
                .await?;
            let owner: Option<i64> = row.try_get("", "owner")?;
            let current: i64 = row.try_get("", "conn_id")?;

            if current != expected || owner != Some(current) {
                self.held.remove(&name);
                error!(
                    "Lock {} lost: taken on session {}, now on session {}, owned by {:?}",
                    name, expected, current, owner
                );
                return Err(GuardError::store_unavailable(format!(
                    "lock {} no longer held by this session",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// `GET_LOCK` takes whole seconds; round up so the wait is never shorter than asked
fn wait_seconds(max_wait: Duration) -> i64 {
    let secs = max_wait.as_secs() + u64::from(max_wait.subsec_nanos() > 0);
    secs.min(i64::MAX as u64) as i64
}

#[async_trait]
impl StoreSession for MySqlSession {
    async fn try_lock(&mut self, name: &LockName, max_wait: Duration) -> GuardResult<bool> {
        let row = self
            .select_row(
                "SELECT GET_LOCK(?, ?) AS flag, CAST(CONNECTION_ID() AS SIGNED) AS conn_id",
                vec![name.as_str().into(), wait_seconds(max_wait).into()],
            )
            .await?;
        let flag: Option<i64> = row.try_get("", "flag")?;
        let conn_id: i64 = row.try_get("", "conn_id")?;

        match flag {
            Some(1) => {
                if let Some(previous) = self.connection_id.filter(|id| *id != conn_id) {
                    // Earlier locks went away with the old session
                    self.held.clear();
                    warn!("Guard session moved from {} to {}", previous, conn_id);
                }
                self.connection_id = Some(conn_id);
                self.held.insert(name.clone());
                debug!("GET_LOCK({}) granted to session {}", name, conn_id);
                Ok(true)
            }
            Some(0) => Ok(false),
            // NULL: the server failed to take the lock (out of memory, thread killed)
            other => Err(GuardError::store_unavailable(format!(
                "GET_LOCK({}) returned {:?}",
                name, other
            ))),
        }
    }

    async fn unlock(&mut self, name: &LockName) -> GuardResult<()> {
        if !self.held.remove(name) {
            return Ok(());
        }

        let row = self
            .select_row("SELECT RELEASE_LOCK(?) AS flag", vec![name.as_str().into()])
            .await?;
        let flag: Option<i64> = row.try_get("", "flag")?;

        match flag {
            Some(1) => {}
            Some(_) => warn!("RELEASE_LOCK({}) found the lock owned by another session", name),
            None => warn!("RELEASE_LOCK({}) found no such lock", name),
        }
        Ok(())
    }

    async fn find_recent(
        &mut self,
        fingerprint: &Fingerprint,
        window: Duration,
    ) -> GuardResult<Option<OrderRef>> {
        self.verify_held().await?;
        find_recent_order(&self.conn, fingerprint, window).await
    }

    async fn record_order(&mut self, order: NewOrder) -> GuardResult<OrderRef> {
        self.verify_held().await?;
        insert_order(&self.conn, order).await
    }

    async fn count_orders(&mut self, fingerprint: &Fingerprint) -> GuardResult<u64> {
        count_orders(&self.conn, fingerprint).await
    }

    async fn close(mut self) -> GuardResult<()> {
        let held: Vec<LockName> = self.held.iter().cloned().collect();
        for name in held {
            self.unlock(&name).await?;
        }
        self.conn.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::orders;
    use crate::store::OrderStatus;
    use chrono::{TimeZone, Utc};
    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, MockExecResult, Value};
    use std::collections::BTreeMap;

    fn flag_row(flag: i64) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([("flag", Value::BigInt(Some(flag)))])
    }

    fn lock_row(flag: i64, conn_id: i64) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("flag", Value::BigInt(Some(flag))),
            ("conn_id", Value::BigInt(Some(conn_id))),
        ])
    }

    fn owner_row(owner: i64, conn_id: i64) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("owner", Value::BigInt(Some(owner))),
            ("conn_id", Value::BigInt(Some(conn_id))),
        ])
    }

    fn lock_name() -> LockName {
        LockName::new("checkout_guard:test")
    }

    fn order_model(id: u64, status: &str) -> orders::Model {
        orders::Model {
            id,
            fingerprint: "ab".repeat(32),
            customer_identity: "email:buyer@example.com".to_string(),
            status: status.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_wait_seconds_rounds_up() {
        assert_eq!(wait_seconds(Duration::from_secs(30)), 30);
        assert_eq!(wait_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(wait_seconds(Duration::from_millis(1)), 1);
        assert_eq!(wait_seconds(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_get_lock_granted_then_released() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![lock_row(1, 42)], vec![flag_row(1)]])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);

        assert!(session.try_lock(&lock_name(), Duration::from_secs(30)).await.unwrap());
        assert_eq!(session.held_locks().count(), 1);

        session.unlock(&lock_name()).await.unwrap();
        assert_eq!(session.held_locks().count(), 0);

        // Second release issues no statement; the mock has no rows left and would fail
        session.unlock(&lock_name()).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_lock_timeout() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![lock_row(0, 42)]])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);

        assert!(!session.try_lock(&lock_name(), Duration::from_secs(1)).await.unwrap());
        assert_eq!(session.held_locks().count(), 0);
    }

    #[tokio::test]
    async fn test_query_failure_is_store_failure() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_errors([DbErr::Custom("connection reset".into())])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);

        let err = session
            .try_lock(&lock_name(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn test_find_recent_maps_latest_order() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![order_model(7, "processing")]])
            .append_query_results([Vec::<orders::Model>::new()])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);
        let fingerprint = Fingerprint::from_stored("ab".repeat(32));

        let found = session
            .find_recent(&fingerprint, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, 7);
        assert_eq!(found.status, OrderStatus::Processing);

        let none = session
            .find_recent(&fingerprint, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_record_order() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_results([MockExecResult {
                last_insert_id: 11,
                rows_affected: 1,
            }])
            .append_query_results([vec![order_model(11, "pending")]])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);

        let order = session
            .record_order(NewOrder {
                fingerprint: Fingerprint::from_stored("ab".repeat(32)),
                customer_identity: "email:buyer@example.com".to_string(),
                status: OrderStatus::Pending,
            })
            .await
            .unwrap();
        assert_eq!(order.id, 11);
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_reads_and_writes_confirm_lock_ownership() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![lock_row(1, 42)], vec![owner_row(42, 42)]])
            .append_query_results([Vec::<orders::Model>::new()])
            .append_query_results([vec![owner_row(42, 42)]])
            .append_exec_results([MockExecResult {
                last_insert_id: 12,
                rows_affected: 1,
            }])
            .append_query_results([vec![order_model(12, "processing")]])
            .append_query_results([vec![flag_row(1)]])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);
        let fingerprint = Fingerprint::from_stored("ab".repeat(32));

        assert!(session.try_lock(&lock_name(), Duration::from_secs(5)).await.unwrap());
        assert!(session
            .find_recent(&fingerprint, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        let order = session
            .record_order(NewOrder {
                fingerprint,
                customer_identity: "email:buyer@example.com".to_string(),
                status: OrderStatus::Processing,
            })
            .await
            .unwrap();
        assert_eq!(order.id, 12);
        session.unlock(&lock_name()).await.unwrap();
        assert_eq!(session.held_locks().count(), 0);
    }

    #[tokio::test]
    async fn test_reconnected_session_fails_closed() {
        // GET_LOCK on session 42, then the pool quietly reconnected as session 77
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![lock_row(1, 42)], vec![owner_row(77, 77)]])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);

        assert!(session.try_lock(&lock_name(), Duration::from_secs(5)).await.unwrap());
        let err = session
            .find_recent(&Fingerprint::from_stored("ab".repeat(32)), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
        assert_eq!(session.held_locks().count(), 0);
    }

    #[tokio::test]
    async fn test_lock_owned_elsewhere_blocks_order_write() {
        let conn = MockDatabase::new(DatabaseBackend::MySql)
            .append_query_results([vec![lock_row(1, 42)], vec![owner_row(99, 42)]])
            .into_connection();
        let mut session = MySqlSession::from_connection(conn);

        assert!(session.try_lock(&lock_name(), Duration::from_secs(5)).await.unwrap());
        let err = session
            .record_order(NewOrder {
                fingerprint: Fingerprint::from_stored("ab".repeat(32)),
                customer_identity: "email:buyer@example.com".to_string(),
                status: OrderStatus::Pending,
            })
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn test_live_named_lock_is_exclusive() {
        // This test requires CHECKOUT_TEST_DATABASE_URL to be set
        let Ok(url) = std::env::var("CHECKOUT_TEST_DATABASE_URL") else {
            return;
        };
        let store = MySqlLockStore::new(url);
        let name = LockName::new(format!("checkout_guard:live-{}", uuid::Uuid::new_v4().simple()));

        let mut first = store.open_session().await.unwrap();
        let mut second = store.open_session().await.unwrap();
        assert!(first.try_lock(&name, Duration::from_secs(1)).await.unwrap());
        assert!(!second.try_lock(&name, Duration::from_secs(1)).await.unwrap());

        // Session teardown frees the lock without RELEASE_LOCK
        drop(first);
        assert!(second.try_lock(&name, Duration::from_secs(5)).await.unwrap());
        second.close().await.unwrap();
    }
}
