//! Submission fingerprints and the lock names derived from them

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{GuardError, GuardResult};

/// Prefix for every lock name this crate takes out
pub const LOCK_NAME_PREFIX: &str = "checkout_guard:";

/// Hex characters of the fingerprint digest kept in a lock name.
/// MySQL caps user lock names at 64 characters.
const LOCK_NAME_HASH_LEN: usize = 48;

/// One line of a cart
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: u64,
    /// Variation of the product, 0 when the product has none
    pub variation_id: u64,
    pub quantity: u32,
    /// Unit price in minor currency units (cents)
    pub unit_price_minor: i64,
}

impl CartLine {
    pub fn new(product_id: u64, quantity: u32, unit_price_minor: i64) -> Self {
        Self {
            product_id,
            variation_id: 0,
            quantity,
            unit_price_minor,
        }
    }

    pub fn with_variation(mut self, variation_id: u64) -> Self {
        self.variation_id = variation_id;
        self
    }
}

/// Who is buying
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CustomerIdentity {
    Email(String),
    Account(u64),
}

impl CustomerIdentity {
    pub fn email(email: impl Into<String>) -> Self {
        Self::Email(email.into())
    }

    /// Normalized form stored in the order's customer column.
    /// Emails are compared case-insensitively.
    pub fn normalized(&self) -> String {
        match self {
            Self::Email(email) => format!("email:{}", email.trim().to_lowercase()),
            Self::Account(id) => format!("account:{}", id),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Self::Email(email) if email.trim().is_empty())
    }
}

/// A checkout submission as handed over by the front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub lines: Vec<CartLine>,
    pub customer: CustomerIdentity,
}

impl Submission {
    pub fn new(lines: Vec<CartLine>, customer: CustomerIdentity) -> Self {
        Self { lines, customer }
    }

    /// Compute the deterministic fingerprint of this submission
    pub fn fingerprint(&self) -> GuardResult<Fingerprint> {
        Fingerprint::compute(&self.lines, &self.customer)
    }
}

/// Canonical form hashed into a fingerprint
#[derive(Serialize)]
struct FingerprintInput<'a> {
    lines: Vec<&'a CartLine>,
    customer: String,
}

/// Deterministic digest of cart contents plus customer identity (64 lowercase hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the cart lines and identity.
    /// Lines are sorted first so insertion order in the cart does not matter.
    pub fn compute(lines: &[CartLine], customer: &CustomerIdentity) -> GuardResult<Self> {
        if lines.is_empty() {
            return Err(GuardError::InvalidSubmission("cart has no lines".to_string()));
        }
        if customer.is_blank() {
            return Err(GuardError::InvalidSubmission(
                "customer identity is blank".to_string(),
            ));
        }
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(GuardError::InvalidSubmission(format!(
                "product {} has zero quantity",
                line.product_id
            )));
        }

        let mut sorted: Vec<&CartLine> = lines.iter().collect();
        sorted.sort();

        let input = FingerprintInput {
            lines: sorted,
            customer: customer.normalized(),
        };
        let json_bytes = serde_json::to_vec(&input)
            .map_err(|e| GuardError::InvalidSubmission(format!("cannot encode cart: {}", e)))?;

        let mut hasher = Sha256::new();
        hasher.update(&json_bytes);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Wrap a fingerprint previously stored in the orders table
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the lock serializing submissions with this fingerprint
    pub fn lock_name(&self) -> LockName {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = hex::encode(hasher.finalize());
        LockName(format!(
            "{}{}",
            LOCK_NAME_PREFIX,
            &digest[..LOCK_NAME_HASH_LEN]
        ))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a server-side lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockName(String);

impl LockName {
    /// Use an arbitrary name, for callers that lock something other than a cart
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
