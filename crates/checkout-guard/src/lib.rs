//! Duplicate-submission guard for load-balanced checkout
//!
//! This crate provides:
//! - Submission fingerprints derived from cart lines and customer identity
//! - A distributed lock manager over store-native, connection-scoped named locks
//! - An idempotency check against orders committed inside a sliding window
//! - The guard tying both together into a single outcome per submission
//! - Native MySQL/TiDB, marker-row fallback and in-memory stores
//! - A race harness firing identical submissions concurrently
//!
//! Can be used as a library or through the `checkout-race` binary

pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod idempotency;
pub mod lock;
pub mod logging;
pub mod marker;
pub mod memory;
pub mod mysql;
pub mod race;
pub mod store;

// Re-export commonly used types
pub use config::{GuardConfig, LockMode};
pub use database::Database;
pub use error::{GuardError, GuardResult};
pub use fingerprint::{CartLine, CustomerIdentity, Fingerprint, LockName, Submission};
pub use guard::{CheckoutGuard, GuardOutcome, GuardPermit, GuardRequest};
pub use idempotency::IdempotencyChecker;
pub use lock::{LockHandle, LockManager, LockState};
pub use marker::MarkerLockStore;
pub use memory::{MemoryStore, ReadRouting};
pub use mysql::MySqlLockStore;
pub use race::{run_race, RaceReport};
pub use store::{LockStore, NewOrder, OrderRef, OrderStatus, StoreSession};
