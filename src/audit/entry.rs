use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// `prev_hash` of the first entry in a chain, and of an explicit reset.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Action written when the log is (re)initialized. Entries whose action
/// starts with this marker may break chain continuity.
pub const RESET_MARKER: &str = "audit_system_initialized";

/// Entry payload. A `BTreeMap` keeps keys sorted so the hashed encoding is
/// stable.
pub type Details = BTreeMap<String, Value>;

/// One line of the hash-chain log. Never mutated once appended.
/// Unknown keys are rejected: the hash only covers the fields below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogEntry {
    pub action: String,
    pub category: String,
    pub details: Details,
    /// RFC 3339 UTC timestamp, kept as written so it re-hashes byte for byte.
    pub wallclock_time: String,
    pub prev_hash: String,
    pub current_hash: String,
}

/// Every hashed field, declared in key order.
#[derive(Serialize)]
struct HashInput<'a> {
    action: &'a str,
    category: &'a str,
    details: &'a Details,
    prev_hash: &'a str,
    wallclock_time: &'a str,
}

/// SHA-256 over the compact JSON encoding of all fields except `current_hash`.
///
/// Returns a lowercase 64-character hex string.
pub fn compute_hash(
    action: &str,
    category: &str,
    details: &Details,
    wallclock_time: &str,
    prev_hash: &str,
) -> Result<String> {
    let encoded = serde_json::to_vec(&HashInput {
        action,
        category,
        details,
        prev_hash,
        wallclock_time,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

impl LogEntry {
    /// Builds an entry stamped with the current time and hashed against `prev_hash`.
    pub fn new(
        action: impl Into<String>,
        category: impl Into<String>,
        details: Details,
        prev_hash: impl Into<String>,
    ) -> Result<Self> {
        let action = action.into();
        let category = category.into();
        let prev_hash = prev_hash.into();
        let wallclock_time = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let current_hash = compute_hash(&action, &category, &details, &wallclock_time, &prev_hash)?;

        Ok(Self {
            action,
            category,
            details,
            wallclock_time,
            prev_hash,
            current_hash,
        })
    }

    pub fn recompute_hash(&self) -> Result<String> {
        compute_hash(
            &self.action,
            &self.category,
            &self.details,
            &self.wallclock_time,
            &self.prev_hash,
        )
    }

    pub fn hash_is_valid(&self) -> bool {
        self.recompute_hash()
            .map(|hash| hash == self.current_hash)
            .unwrap_or(false)
    }

    /// Whether the action belongs to the reset-marker family.
    pub fn is_reset(&self) -> bool {
        self.action.starts_with(RESET_MARKER)
    }

    /// A reset that declares a fresh chain through the all-zero sentinel.
    pub fn is_explicit_reset(&self) -> bool {
        self.is_reset() && self.prev_hash == GENESIS_HASH
    }
}

/// Tail of the chain persisted beside the log so a restart can resume
/// without trusting the last line alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPointer {
    pub last_hash: String,
    pub wallclock_time: String,
}

impl ChainPointer {
    pub fn new(last_hash: impl Into<String>) -> Self {
        Self {
            last_hash: last_hash.into(),
            wallclock_time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// Builds a `Details` map from `(key, value)` pairs.
///
/// ```
/// use fleet_runner::audit::details;
/// use serde_json::json;
///
/// let d = details([("port", json!(9101)), ("pid", json!(4242))]);
/// assert_eq!(d.keys().collect::<Vec<_>>(), vec!["pid", "port"]);
/// ```
pub fn details<K, I>(pairs: I) -> Details
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
