//! Thread store — durable, TTL-bounded persistence of conversation threads.
//!
//! The only component that talks to a [`KvBackend`]. A thread is stored as
//! one JSON value under its continuation id, with a backend-level expiry
//! equal to the thread's TTL window. Every write re-arms the expiry, so the
//! window slides from the last activity.
//!
//! Appends are optimistic read-modify-write cycles: read the record and its
//! version, add the turn, `compare_and_swap` against that version, retry on
//! conflict. Two concurrent appends to one thread therefore linearize; a
//! writer that loses the race re-reads and appends on top of the winner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use threadgate_core::error::{Result, StoreError, ThreadError};
use threadgate_core::store::{KvBackend, Versioned};
use threadgate_core::thread::{ContinuationId, Thread, TtlClass, Turn};
use tracing::{debug, info, warn};

/// Retention windows per TTL class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub standard: Duration,
    pub extended: Duration,
}

impl TtlPolicy {
    pub fn window(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Standard => self.standard,
            TtlClass::Extended => self.extended,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            standard: Duration::from_secs(3 * 3600),
            extended: Duration::from_secs(48 * 3600),
        }
    }
}

/// Parameters for a new thread.
#[derive(Debug, Clone, Default)]
pub struct NewThread {
    pub tool_name: String,
    pub ttl_class: TtlClass,
    pub parent_id: Option<ContinuationId>,
    pub initial_context: serde_json::Map<String, serde_json::Value>,
    /// Written together with the record, so a thread never exists without it.
    pub first_turn: Option<Turn>,
}

impl NewThread {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            ..Self::default()
        }
    }

    pub fn with_ttl_class(mut self, ttl_class: TtlClass) -> Self {
        self.ttl_class = ttl_class;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<ContinuationId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_initial_context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.initial_context = context;
        self
    }

    pub fn with_first_turn(mut self, turn: Turn) -> Self {
        self.first_turn = Some(turn);
        self
    }
}

/// How many fresh ids `create` tries before giving up.
const MAX_ID_ATTEMPTS: usize = 4;

/// Persistence for conversation threads over any [`KvBackend`].
pub struct ThreadStore {
    backend: Arc<dyn KvBackend>,
    ttl: TtlPolicy,
    operation_timeout: Duration,
    max_append_retries: u32,
    max_turns: usize,
}

impl ThreadStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            ttl: TtlPolicy::default(),
            operation_timeout: Duration::from_secs(5),
            max_append_retries: 32,
            max_turns: 50,
        }
    }

    pub fn with_ttl_policy(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    /// Upper bound for each individual backend call.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_append_retries(mut self, retries: u32) -> Self {
        self.max_append_retries = retries;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Create a thread under a fresh, unused continuation id.
    pub async fn create(&self, seed: NewThread) -> Result<ContinuationId> {
        Ok(self.create_thread(seed).await?.continuation_id)
    }

    /// Create a thread and return it as stored.
    ///
    /// The seed's first turn, if any, is part of the single
    /// `set_if_absent` write.
    pub async fn create_thread(&self, seed: NewThread) -> Result<Thread> {
        let ttl = self.ttl.window(seed.ttl_class);

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = ContinuationId::new();
            let mut thread = Thread::new(id.clone(), seed.tool_name.clone(), seed.ttl_class)
                .with_parent(seed.parent_id.clone())
                .with_initial_context(seed.initial_context.clone());
            if let Some(turn) = &seed.first_turn {
                thread.push_turn(turn.clone());
            }
            let value = serde_json::to_string(&thread)?;

            let claimed = self
                .timed("set_if_absent", self.backend.set_if_absent(id.as_str(), value, ttl))
                .await?;
            if claimed {
                info!(
                    continuation_id = %id,
                    tool = %seed.tool_name,
                    ttl_class = ?seed.ttl_class,
                    turns = thread.turn_count(),
                    "Thread created"
                );
                return Ok(thread);
            }
            warn!(continuation_id = %id, "Continuation id collision, regenerating");
        }

        Err(StoreError::Unavailable(format!(
            "could not allocate an unused continuation id after {MAX_ID_ATTEMPTS} attempts"
        ))
        .into())
    }

    /// Read a live thread. Unknown and expired ids are both `ThreadNotFound`.
    pub async fn read(&self, id: &ContinuationId) -> Result<Thread> {
        let (thread, _) = self.read_versioned(id).await?;
        Ok(thread)
    }

    /// Append a turn, stamping it after every turn already stored.
    ///
    /// Fails closed: an unknown or expired id is never recreated. Returns
    /// the turn as stored.
    pub async fn append(&self, id: &ContinuationId, turn: Turn) -> Result<Turn> {
        let (stored, _) = self.append_with_ttl(id, turn, TtlClass::Standard).await?;
        Ok(stored)
    }

    /// Append a turn and upgrade the thread's TTL class in the same write.
    ///
    /// The class never downgrades. Returns the stored turn and the class
    /// now in effect.
    pub async fn append_with_ttl(
        &self,
        id: &ContinuationId,
        turn: Turn,
        ttl_class: TtlClass,
    ) -> Result<(Turn, TtlClass)> {
        self.update(id, "append", |thread| {
            if thread.turn_count() >= self.max_turns {
                return Err(ThreadError::TurnLimitReached {
                    id: id.to_string(),
                    limit: self.max_turns,
                }
                .into());
            }
            thread.ttl_class = thread.ttl_class.max(ttl_class);
            Ok((thread.push_turn(turn.clone()), thread.ttl_class))
        })
        .await
    }

    /// Re-arm the expiry of a thread.
    ///
    /// The class can be upgraded from standard to extended, never
    /// downgraded. Returns the class now in effect.
    pub async fn touch_ttl(&self, id: &ContinuationId, ttl_class: TtlClass) -> Result<TtlClass> {
        self.update(id, "touch_ttl", |thread| {
            thread.ttl_class = thread.ttl_class.max(ttl_class);
            thread.touch();
            Ok(thread.ttl_class)
        })
        .await
    }

    /// Remove expired threads from the backend.
    pub async fn sweep(&self) -> Result<usize> {
        let removed = self.timed("sweep", self.backend.sweep_expired()).await?;
        if removed > 0 {
            info!(removed, backend = self.backend.name(), "Expired threads swept");
        }
        Ok(removed)
    }

    /// Number of live threads.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.timed("count", self.backend.count()).await?)
    }

    /// Optimistic read-modify-write of one thread record.
    async fn update<T>(
        &self,
        id: &ContinuationId,
        operation: &'static str,
        mut mutate: impl FnMut(&mut Thread) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.max_append_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let (mut thread, version) = self.read_versioned(id).await?;
            let outcome = mutate(&mut thread)?;
            let value = serde_json::to_string(&thread)?;
            let ttl = self.ttl.window(thread.ttl_class);

            let swapped = self
                .timed(
                    "compare_and_swap",
                    self.backend.compare_and_swap(id.as_str(), version, value, ttl),
                )
                .await?;
            if swapped {
                debug!(
                    continuation_id = %id,
                    operation,
                    attempt,
                    turns = thread.turn_count(),
                    "Thread updated"
                );
                return Ok(outcome);
            }

            debug!(continuation_id = %id, operation, attempt, "Concurrent write detected, retrying");
            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            id: id.to_string(),
            attempts,
        }
        .into())
    }

    async fn read_versioned(&self, id: &ContinuationId) -> Result<(Thread, u64)> {
        if !id.is_well_formed() {
            return Err(not_found(id));
        }

        let Some(Versioned { value, version }) =
            self.timed("get", self.backend.get(id.as_str())).await?
        else {
            return Err(not_found(id));
        };

        let thread: Thread = serde_json::from_str(&value).map_err(|e| {
            warn!(continuation_id = %id, error = %e, "Stored thread failed to decode");
            StoreError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok((thread, version))
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, backend = self.backend.name(), "Store operation timed out");
                Err(StoreError::Timeout {
                    operation,
                    timeout_ms: self.operation_timeout.as_millis() as u64,
                })
            }
        }
    }
}

fn not_found(id: &ContinuationId) -> threadgate_core::Error {
    ThreadError::NotFound { id: id.to_string() }.into()
}
