//! Database connections for the guard
//!
//! Two kinds of connection are used:
//! - a shared pool ([`Database`]) for schema set-up and the marker fallback
//! - dedicated single-connection sessions ([`connect_session`]) for native locking,
//!   where every statement must reach the same server session

use chrono::Utc;
use sea_orm::sea_query::Index;
use sea_orm::{
    entity::*, query::*, ConnectOptions, ConnectionTrait, Database as SeaOrmDatabase,
    DatabaseConnection, PaginatorTrait, Schema,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::entity::{guard_lock_markers, orders};
use crate::error::{GuardError, GuardResult};
use crate::fingerprint::Fingerprint;
use crate::store::{window_cutoff, NewOrder, OrderRef, OrderStatus};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Shared pool used for schema bootstrap and by the marker store
pub struct Database {
    connection: Arc<DatabaseConnection>,
}

impl Database {
    /// Handle to the pool, shared with stores built on top of it
    pub fn connection_arc(&self) -> Arc<DatabaseConnection> {
        self.connection.clone()
    }

    /// Connect a pool of at most `max_connections`, retrying while the server comes up.
    ///
    /// Marker-mode submissions each hold a pooled connection only for single
    /// statements, so the race size plus one is plenty.
    pub async fn new(database_url: &str, max_connections: u32) -> GuardResult<Self> {
        let max_connections = max_connections.max(1);
        info!(
            "Connecting to {} (pool of up to {}) ...",
            mask_url(database_url),
            max_connections
        );

        let mut opt = ConnectOptions::new(database_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(5))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(60))
            .sqlx_logging(true)
            .sqlx_slow_statements_logging_settings(
                tracing::log::LevelFilter::Warn,
                Duration::from_millis(200),
            );

        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match SeaOrmDatabase::connect(opt.clone()).await {
                Ok(connection) => {
                    info!("Connected to {}", mask_url(database_url));
                    return Ok(Self {
                        connection: Arc::new(connection),
                    });
                }
                Err(e) => {
                    warn!(
                        "Connecting to {} failed (attempt {}/{}): {}",
                        mask_url(database_url),
                        attempt,
                        CONNECT_ATTEMPTS,
                        e
                    );
                    last_error = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }

        error!("Giving up on {} after {} attempts", mask_url(database_url), CONNECT_ATTEMPTS);
        Err(GuardError::store_unavailable(format!(
            "database connection failed: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Health check
    pub async fn health_check(&self) -> GuardResult<()> {
        self.connection
            .ping()
            .await
            .map_err(|e| GuardError::store_unavailable(format!("health check failed: {}", e)))
    }

    /// Create the orders and marker tables if they are missing
    pub async fn ensure_schema(&self) -> GuardResult<()> {
        let backend = self.connection.get_database_backend();
        let schema = Schema::new(backend);

        let mut orders_table = schema.create_table_from_entity(orders::Entity);
        orders_table.if_not_exists().index(
            Index::create()
                .name("idx_orders_fingerprint_created_at")
                .col(orders::Column::Fingerprint)
                .col(orders::Column::CreatedAt),
        );
        self.connection.execute(backend.build(&orders_table)).await?;

        let mut markers_table = schema.create_table_from_entity(guard_lock_markers::Entity);
        markers_table.if_not_exists();
        self.connection.execute(backend.build(&markers_table)).await?;

        info!("Schema ready (orders, guard_lock_markers)");
        Ok(())
    }
}

/// Longest a guard session may live; far beyond any lock wait plus order write
const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Open a connection pinned to a single server session.
///
/// The pool is capped at one connection, never pings it before use and never
/// retires it for age or idleness, so named locks and reads issued through it
/// share one session. sqlx still reopens a connection that broke, which is
/// why the native store re-checks lock ownership before reading or writing.
/// Dropping the returned connection closes the socket, which makes the server
/// release any named lock the session still holds.
pub async fn connect_session(database_url: &str) -> GuardResult<DatabaseConnection> {
    let mut opt = ConnectOptions::new(database_url.to_string());
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .test_before_acquire(false)
        .max_lifetime(SESSION_LIFETIME)
        .idle_timeout(SESSION_LIFETIME)
        .sqlx_logging(false);

    SeaOrmDatabase::connect(opt).await.map_err(|e| {
        error!("Cannot open guard session on {}: {}", mask_url(database_url), e);
        GuardError::store_unavailable(format!("cannot open session: {}", e))
    })
}

/// Most recent order for a fingerprint that still blocks a repeat submission.
///
/// Cancelled and failed orders are ignored; ties on `created_at` go to the highest id.
pub async fn find_recent_order<C>(
    conn: &C,
    fingerprint: &Fingerprint,
    window: Duration,
) -> GuardResult<Option<OrderRef>>
where
    C: ConnectionTrait,
{
    let cutoff = window_cutoff(window)?;

    let latest = orders::Entity::find()
        .filter(orders::Column::Fingerprint.eq(fingerprint.as_str()))
        .filter(orders::Column::Status.is_not_in(OrderStatus::EXCLUDED.iter().map(|s| s.as_str())))
        .filter(orders::Column::CreatedAt.gt(cutoff))
        .order_by_desc(orders::Column::CreatedAt)
        .order_by_desc(orders::Column::Id)
        .one(conn)
        .await?;

    latest.map(to_order_ref).transpose()
}

/// Insert an order stamped with the current time
pub async fn insert_order<C>(conn: &C, order: NewOrder) -> GuardResult<OrderRef>
where
    C: ConnectionTrait,
{
    let model = orders::ActiveModel {
        id: NotSet,
        fingerprint: Set(order.fingerprint.as_str().to_string()),
        customer_identity: Set(order.customer_identity),
        status: Set(order.status.as_str().to_string()),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    info!("Order {} recorded for fingerprint {}", model.id, order.fingerprint);
    to_order_ref(model)
}

/// Count all orders stored for a fingerprint
pub async fn count_orders<C>(conn: &C, fingerprint: &Fingerprint) -> GuardResult<u64>
where
    C: ConnectionTrait,
{
    Ok(orders::Entity::find()
        .filter(orders::Column::Fingerprint.eq(fingerprint.as_str()))
        .count(conn)
        .await?)
}

fn to_order_ref(model: orders::Model) -> GuardResult<OrderRef> {
    Ok(OrderRef {
        id: model.id,
        status: model.status.parse()?,
        created_at: model.created_at,
    })
}

/// Mask sensitive parts of a database URL for logging
pub fn mask_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(password) = parsed.password() {
            url.replacen(&format!(":{}@", password), ":****@", 1)
        } else {
            url.to_string()
        }
    } else if let Some(at_pos) = url.find('@') {
        format!("****{}", &url[at_pos..])
    } else {
        url.to_string()
    }
}
