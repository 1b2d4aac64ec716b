//! In-memory backend — process-local, used by default and in tests.
//!
//! Keys live in a sharded `DashMap`, so writers to different threads take
//! different shard locks. Expiry uses `tokio::time::Instant`, which makes
//! TTL windows testable under a paused clock.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use threadgate_core::error::StoreError;
use threadgate_core::store::{KvBackend, Versioned};
use tokio::time::Instant;

struct Slot {
    value: String,
    version: u64,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// An in-memory key-value backend with per-key expiry.
pub struct InMemoryBackend {
    slots: DashMap<String, Slot>,
    next_version: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_version: AtomicU64::new(0),
        }
    }

    fn slot(&self, value: String, ttl: Duration) -> Slot {
        Slot {
            value,
            // Versions are never reused, even when an expired key is claimed again.
            version: self.next_version.fetch_add(1, Ordering::Relaxed) + 1,
            expires_at: Instant::now() + ttl,
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let now = Instant::now();
        let found = self.slots.get(key).map(|slot| {
            slot.is_live(now).then(|| Versioned {
                value: slot.value.clone(),
                version: slot.version,
            })
        });

        match found {
            Some(Some(live)) => Ok(Some(live)),
            Some(None) => {
                // Lazy expiry; the shard guard above is already released.
                self.slots.remove_if(key, |_, slot| !slot.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, StoreError> {
        let slot = self.slot(value, ttl);
        let version = slot.version;
        self.slots.insert(key.to_string(), slot);
        Ok(version)
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(self.slot(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.slot(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(false);
        };
        if !slot.is_live(now) || slot.version != expected {
            return Ok(false);
        }
        *slot = self.slot(value, ttl);
        Ok(true)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            let live = slot.is_live(now);
            if !live {
                removed += 1;
            }
            live
        });
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        Ok(self.slots.iter().filter(|slot| slot.is_live(now)).count())
    }
}
