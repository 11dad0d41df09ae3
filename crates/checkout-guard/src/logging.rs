//! Tracing subscriber set-up for binaries and demos

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a console subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at `level` and
/// sqlx/sea-orm at `warn`.
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("checkout_guard={},checkout_race={},sqlx=warn,sea_orm=warn", level, level)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
