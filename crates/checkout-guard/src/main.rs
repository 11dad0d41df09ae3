//! Race harness: fire identical checkout submissions at once and report what got through

use anyhow::Result;
use checkout_guard::database::mask_url;
use checkout_guard::logging::init_logging;
use checkout_guard::{
    run_race, CartLine, CheckoutGuard, CustomerIdentity, Database, GuardConfig, GuardRequest,
    LockMode, LockStore, MarkerLockStore, MemoryStore, MySqlLockStore, Submission,
};
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(name = "checkout-race")]
#[clap(about = "Fire identical checkout submissions concurrently against the duplicate-submission guard")]
struct Args {
    /// Primary database URL; the in-memory store is used when unset
    #[clap(long, env = "CHECKOUT_DATABASE_URL")]
    database_url: Option<String>,

    /// Read replica URL, used for idempotency reads in marker mode
    #[clap(long, env = "CHECKOUT_REPLICA_URL")]
    replica_url: Option<String>,

    /// Number of concurrent submissions
    #[clap(long)]
    requests: Option<usize>,

    /// Run with the guard switched off
    #[clap(long)]
    disable_guard: bool,

    /// Idempotency window in seconds
    #[clap(long)]
    window_secs: Option<u64>,

    /// Longest a submission waits for the lock, in seconds
    #[clap(long)]
    lock_wait_secs: Option<u64>,

    /// Locking primitive: native or marker
    #[clap(long)]
    lock_mode: Option<LockMode>,

    /// How long a proceeding submission holds the lock after writing its order
    #[clap(long, default_value = "250")]
    hold_ms: u64,

    /// Customer email placed on every submission
    #[clap(long, default_value = "race@example.com")]
    email: String,

    /// Print the report as JSON
    #[clap(long)]
    json: bool,

    /// Create the orders and marker tables before racing
    #[clap(long)]
    init_schema: bool,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut GuardConfig) {
        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        if let Some(url) = &self.replica_url {
            config.replica_url = Some(url.clone());
        }
        if let Some(requests) = self.requests {
            config.simulated_requests = requests;
        }
        if self.disable_guard {
            config.enabled = false;
        }
        if let Some(secs) = self.window_secs {
            config.window_secs = secs;
        }
        if let Some(secs) = self.lock_wait_secs {
            config.lock_wait_secs = secs;
        }
        if let Some(mode) = self.lock_mode {
            config.lock_mode = mode;
        }
    }

    fn submission(&self) -> Submission {
        Submission::new(
            vec![
                CartLine::new(1001, 1, 4_999),
                CartLine::new(2002, 2, 1_250).with_variation(7),
            ],
            CustomerIdentity::email(self.email.clone()),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    let mut config = GuardConfig::from_env()?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!("Starting checkout race");
    match &config.database_url {
        Some(url) => tracing::info!("Database URL: {}", mask_url(url)),
        None => tracing::warn!("No database URL configured - racing against the in-memory store"),
    }
    if let Some(url) = &config.replica_url {
        tracing::info!("Replica URL: {}", mask_url(url));
    }

    let request = GuardRequest::from_submission(&args.submission())?;
    let hold = Duration::from_millis(args.hold_ms);

    let Some(database_url) = config.database_url.clone() else {
        return run(Arc::new(MemoryStore::new()), config, request, hold, args.json).await;
    };

    if args.init_schema {
        let db = Database::new(&database_url, 1).await?;
        db.ensure_schema().await?;
    }

    match config.lock_mode {
        LockMode::Native => {
            let store = Arc::new(MySqlLockStore::new(database_url));
            run(store, config, request, hold, args.json).await
        }
        LockMode::Marker => {
            tracing::warn!("Marker locking is a degraded fallback; prefer native locks");
            let pool_size = u32::try_from(config.simulated_requests)
                .unwrap_or(u32::MAX)
                .saturating_add(1);
            let primary = Database::new(&database_url, pool_size).await?;
            let mut store = MarkerLockStore::new(primary.connection_arc(), config.marker_lease());
            if let Some(replica_url) = &config.replica_url {
                let replica = Database::new(replica_url, pool_size).await?;
                store = store.with_read_connection(replica.connection_arc());
            }
            run(Arc::new(store), config, request, hold, args.json).await
        }
    }
}

async fn run<S: LockStore>(
    store: Arc<S>,
    config: GuardConfig,
    request: GuardRequest,
    hold: Duration,
    json: bool,
) -> Result<()> {
    let guard = Arc::new(CheckoutGuard::new(store, config));
    let report = run_race(guard, request, hold).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
        if report.orders_committed > 1 {
            println!("Duplicate orders were created: {:?}", report.created_order_ids);
        }
    }
    Ok(())
}
