//! Configuration for the checkout guard

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GuardError, GuardResult};

pub const ENV_ENABLED: &str = "CHECKOUT_GUARD_ENABLED";
pub const ENV_WINDOW_SECS: &str = "CHECKOUT_GUARD_WINDOW_SECS";
pub const ENV_LOCK_WAIT_SECS: &str = "CHECKOUT_GUARD_LOCK_WAIT_SECS";
pub const ENV_SIMULATED_REQUESTS: &str = "CHECKOUT_GUARD_SIMULATED_REQUESTS";
pub const ENV_LOCK_MODE: &str = "CHECKOUT_GUARD_LOCK_MODE";
pub const ENV_MARKER_LEASE_SECS: &str = "CHECKOUT_GUARD_MARKER_LEASE_SECS";
pub const ENV_DATABASE_URL: &str = "CHECKOUT_DATABASE_URL";
pub const ENV_REPLICA_URL: &str = "CHECKOUT_REPLICA_URL";

/// Upper bounds accepted by [`GuardConfig::validate`]
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 3600;
pub const MAX_LOCK_WAIT_SECS: u64 = 3600;
pub const MAX_MARKER_LEASE_SECS: u64 = 24 * 3600;

/// Which locking primitive guards the critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Connection-scoped named lock provided by the store
    #[default]
    Native,
    /// Expiring marker rows, for stores without a native lock primitive
    Marker,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Marker => write!(f, "marker"),
        }
    }
}

impl FromStr for LockMode {
    type Err = GuardError;

    fn from_str(s: &str) -> GuardResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "marker" => Ok(Self::Marker),
            other => Err(GuardError::Config(format!(
                "unknown lock mode '{}', expected native or marker",
                other
            ))),
        }
    }
}

/// Process-wide guard configuration, immutable once loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// When false the guard is bypassed entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds after creation during which an identical submission is a duplicate
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Longest a submission waits for the lock before giving up as contended
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Parallel submissions fired by the race harness
    #[serde(default = "default_simulated_requests")]
    pub simulated_requests: usize,

    #[serde(default)]
    pub lock_mode: LockMode,

    /// Marker lease, only used with `LockMode::Marker`
    #[serde(default = "default_marker_lease_secs")]
    pub marker_lease_secs: u64,

    /// Primary database URL (MySQL/TiDB)
    #[serde(default)]
    pub database_url: Option<String>,

    /// Read replica URL; marker mode sends idempotency reads here
    #[serde(default)]
    pub replica_url: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_secs: default_window_secs(),
            lock_wait_secs: default_lock_wait_secs(),
            simulated_requests: default_simulated_requests(),
            lock_mode: LockMode::default(),
            marker_lease_secs: default_marker_lease_secs(),
            database_url: None,
            replica_url: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_window_secs() -> u64 {
    60
}

fn default_lock_wait_secs() -> u64 {
    30
}

fn default_simulated_requests() -> usize {
    5
}

fn default_marker_lease_secs() -> u64 {
    300
}

impl GuardConfig {
    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> GuardResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> GuardResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_ENABLED) {
            config.enabled = parse_bool(ENV_ENABLED, &value)?;
        }
        if let Some(value) = lookup(ENV_WINDOW_SECS) {
            config.window_secs = parse_number(ENV_WINDOW_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_WAIT_SECS) {
            config.lock_wait_secs = parse_number(ENV_LOCK_WAIT_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_SIMULATED_REQUESTS) {
            config.simulated_requests = parse_number(ENV_SIMULATED_REQUESTS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_MODE) {
            config.lock_mode = value.parse()?;
        }
        if let Some(value) = lookup(ENV_MARKER_LEASE_SECS) {
            config.marker_lease_secs = parse_number(ENV_MARKER_LEASE_SECS, &value)?;
        }
        config.database_url = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty());
        config.replica_url = lookup(ENV_REPLICA_URL).filter(|v| !v.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the guard cannot honour
    pub fn validate(&self) -> GuardResult<()> {
        if self.window_secs == 0 {
            return Err(GuardError::Config("idempotency window must be at least 1 second".into()));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(GuardError::Config(format!(
                "idempotency window {}s exceeds {}s",
                self.window_secs, MAX_WINDOW_SECS
            )));
        }
        if self.lock_wait_secs == 0 {
            return Err(GuardError::Config("lock wait must be at least 1 second".into()));
        }
        if self.lock_wait_secs > MAX_LOCK_WAIT_SECS {
            return Err(GuardError::Config(format!(
                "lock wait {}s exceeds {}s",
                self.lock_wait_secs, MAX_LOCK_WAIT_SECS
            )));
        }
        if self.marker_lease_secs > MAX_MARKER_LEASE_SECS {
            return Err(GuardError::Config(format!(
                "marker lease {}s exceeds {}s",
                self.marker_lease_secs, MAX_MARKER_LEASE_SECS
            )));
        }
        if self.simulated_requests == 0 {
            return Err(GuardError::Config("simulated requests must be at least 1".into()));
        }
        if self.lock_mode == LockMode::Marker && self.marker_lease_secs < self.lock_wait_secs {
            return Err(GuardError::Config(format!(
                "marker lease ({}s) shorter than lock wait ({}s)",
                self.marker_lease_secs, self.lock_wait_secs
            )));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn marker_lease(&self) -> Duration {
        Duration::from_secs(self.marker_lease_secs)
    }
}

fn parse_bool(key: &str, value: &str) -> GuardResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GuardError::Config(format!("{}: '{}' is not a boolean", key, other))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> GuardResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GuardError::Config(format!("{}: '{}' is not a valid number", key, value)))
}
