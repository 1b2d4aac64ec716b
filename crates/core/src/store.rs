//! Key-value persistence trait — the only seam to the backing store.
//!
//! A backend holds opaque string values under string keys, each with its own
//! expiry. Every write replaces the value and resets the expiry. Writes that
//! must not clobber a concurrent writer go through
//! [`KvBackend::compare_and_swap`], keyed on the version returned by the last
//! read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::error::StoreError;

/// A value together with the version it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: String,

    /// Changes on every successful write to the key.
    pub version: u64,
}

/// The core KvBackend trait.
///
/// Implementations: in-memory (sharded map), SQLite.
///
/// Expired keys must be invisible to every operation: `get` returns `None`,
/// `compare_and_swap` fails, `set_if_absent` succeeds. Operations on
/// different keys must not serialize behind one another.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Read a live key.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditional `SET key value EXPIRE ttl`. Returns the new version.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, StoreError>;

    /// Store only when no live value exists. Returns `false` if one does.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError>;

    /// Replace the value only if the live version still equals `expected`.
    /// Returns `false` on version mismatch or when the key is gone.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop every expired key. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize, StoreError>;

    /// Number of live keys.
    async fn count(&self) -> Result<usize, StoreError>;
}

