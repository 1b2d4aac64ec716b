//! The continuation engine.
//!
//! Per request:
//!
//! - **New** (no continuation id): offload if needed → create the thread
//!   with its first turn in one write → return the id and the stored turn.
//! - **Resume** (id supplied): read the thread (unknown or expired ids
//!   surface as `ThreadNotFound`) → build the bounded bundle from the prior
//!   turns plus the incoming one → append the incoming turn and re-arm the
//!   TTL in one write → return the bundle.
//!
//! Turn text is committed to the budget first, oldest turn first, so the
//! newest prior turns are the ones dropped when the ceiling is tight. The
//! incoming turn is always included. Files get whatever is left, shared
//! between priority classes.
//!
//! Reconstruction never writes. The only writes are the append of the
//! incoming turn, issued after the bundle has been built, and
//! [`ContinuationEngine::record_response`] once the model has answered.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use threadgate_config::AppConfig;
use threadgate_core::error::{Result, StoreError};
use threadgate_core::thread::{
    AttachedFile, ContinuationId, FileReference, Role, Thread, TtlClass, Turn,
};
use threadgate_store::{NewThread, ThreadStore};
use tracing::{debug, info, warn};

use crate::context::budget::{
    Allocator, Candidate, ClassShares, OmissionReason, PriorityClass, allocate,
};
use crate::context::dedup::reduce;
use crate::context::token::{Estimable, Estimate, FileWarning, estimate_file_async, estimate_turn_tokens};
use crate::offload::{OFFLOAD_NOTE, Payload, PayloadOffloader, modified_at};

// ── Requests ──────────────────────────────────────────────────────────────

fn default_role() -> Role {
    Role::User
}

/// A tool call's turn, either starting or resuming a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub tool_name: String,

    #[serde(default = "default_role")]
    pub role: Role,

    pub text: String,

    /// Absolute paths, in caller order.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    #[serde(default)]
    pub continuation_id: Option<ContinuationId>,

    /// Retention hint. Applied at creation; on resume it can only upgrade.
    #[serde(default)]
    pub ttl_class: TtlClass,

    /// Only used when starting a thread.
    #[serde(default)]
    pub parent_id: Option<ContinuationId>,

    /// Only used when starting a thread.
    #[serde(default)]
    pub initial_context: serde_json::Map<String, serde_json::Value>,

    /// Ceiling for this call. Falls back to the engine default.
    #[serde(default)]
    pub token_ceiling: Option<usize>,

    /// Put the parent chain's turns ahead of this thread's on resume.
    #[serde(default)]
    pub include_parents: bool,
}

impl TurnRequest {
    pub fn new(tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            role: Role::User,
            text: text.into(),
            files: Vec::new(),
            continuation_id: None,
            ttl_class: TtlClass::Standard,
            parent_id: None,
            initial_context: serde_json::Map::new(),
            token_ceiling: None,
            include_parents: false,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_files<P: Into<PathBuf>>(mut self, files: impl IntoIterator<Item = P>) -> Self {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_continuation_id(mut self, id: ContinuationId) -> Self {
        self.continuation_id = Some(id);
        self
    }

    pub fn with_ttl_class(mut self, ttl_class: TtlClass) -> Self {
        self.ttl_class = ttl_class;
        self
    }

    pub fn with_parent(mut self, parent_id: ContinuationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_initial_context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.initial_context = context;
        self
    }

    pub fn with_token_ceiling(mut self, ceiling: usize) -> Self {
        self.token_ceiling = Some(ceiling);
        self
    }

    pub fn with_include_parents(mut self, include: bool) -> Self {
        self.include_parents = include;
        self
    }
}

/// A read-only request to rebuild a thread's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionRequest {
    pub continuation_id: ContinuationId,
    #[serde(default)]
    pub token_ceiling: Option<usize>,
    #[serde(default)]
    pub include_parents: bool,
}

// ── Outcomes ──────────────────────────────────────────────────────────────

/// Reply for a freshly started thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewThreadOutcome {
    pub continuation_id: ContinuationId,
    /// The first turn, as stored.
    pub turn_echo: Turn,
}

/// A turn placed in a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledTurn {
    /// Position in the reconstructed history (parent chain first, then
    /// this thread), zero-based.
    pub index: usize,

    /// Set for turns that came from an ancestor thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_thread: Option<ContinuationId>,

    #[serde(flatten)]
    pub turn: Turn,
}

/// A file that was left out of the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmittedFile {
    pub path: PathBuf,
    pub tokens: usize,
    pub class: PriorityClass,
    pub reason: OmissionReason,
}

/// Bounded context for one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeBundle {
    pub continuation_id: ContinuationId,
    /// Tool that started the thread.
    pub origin_tool: String,
    pub ttl_class: TtlClass,
    /// Included turns in chronological order.
    pub ordered_turns: Vec<BundledTurn>,
    /// Files to send, each once, attributed to the turn that introduced it.
    pub included_files: Vec<FileReference>,
    pub omitted_files: Vec<OmittedFile>,
    /// Prior turns left out for budget.
    pub omitted_turns: usize,
    /// Turns considered, included or not.
    pub total_turns: usize,
    pub warnings: Vec<FileWarning>,
    pub token_ceiling: usize,
    pub tokens_used: usize,
    /// The incoming turn alone did not fit, so `tokens_used` exceeds
    /// `token_ceiling`.
    #[serde(default)]
    pub over_ceiling: bool,
}

/// What `handle` did.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Started(NewThreadOutcome),
    Resumed(ResumeBundle),
}

// ── Engine ────────────────────────────────────────────────────────────────

/// Orchestrates the thread store, deduplicator, allocator and offloader.
pub struct ContinuationEngine {
    store: Arc<ThreadStore>,
    offloader: PayloadOffloader,
    shares: ClassShares,
    default_token_ceiling: usize,
    max_parent_depth: usize,
}

impl ContinuationEngine {
    pub fn new(store: Arc<ThreadStore>, offloader: PayloadOffloader) -> Self {
        Self {
            store,
            offloader,
            shares: ClassShares::default(),
            default_token_ceiling: 200_000,
            max_parent_depth: 20,
        }
    }

    pub fn from_config(store: Arc<ThreadStore>, config: &AppConfig) -> Self {
        Self::new(store, PayloadOffloader::from_config(&config.offload))
            .with_shares(ClassShares {
                source: config.budget.source_share,
                config: config.budget.config_share,
                docs: config.budget.docs_share,
                other: config.budget.other_share,
            })
            .with_default_token_ceiling(config.budget.default_token_ceiling)
            .with_max_parent_depth(config.conversation.max_parent_depth)
    }

    pub fn with_shares(mut self, shares: ClassShares) -> Self {
        self.shares = shares;
        self
    }

    pub fn with_default_token_ceiling(mut self, ceiling: usize) -> Self {
        self.default_token_ceiling = ceiling;
        self
    }

    pub fn with_max_parent_depth(mut self, depth: usize) -> Self {
        self.max_parent_depth = depth;
        self
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn offloader(&self) -> &PayloadOffloader {
        &self.offloader
    }

    pub fn default_token_ceiling(&self) -> usize {
        self.default_token_ceiling
    }

    /// Start or resume, depending on whether the request names a thread.
    pub async fn handle(&self, request: TurnRequest) -> Result<TurnOutcome> {
        match request.continuation_id.clone() {
            None => Ok(TurnOutcome::Started(self.start(request).await?)),
            Some(id) => Ok(TurnOutcome::Resumed(self.resume(&id, request).await?)),
        }
    }

    /// Create a thread whose first turn is `request`.
    pub async fn start(&self, request: TurnRequest) -> Result<NewThreadOutcome> {
        // Offload before creating so a failed write leaves nothing behind.
        let tool_name = request.tool_name.clone();
        let seed = NewThread::new(&tool_name)
            .with_ttl_class(request.ttl_class)
            .with_parent(request.parent_id.clone())
            .with_initial_context(request.initial_context.clone());
        let turn = self.build_turn(request).await?;

        let mut thread = self.store.create_thread(seed.with_first_turn(turn)).await?;
        let continuation_id = thread.continuation_id.clone();
        let turn_echo = thread.turns.pop().ok_or_else(|| {
            StoreError::Corrupt {
                id: continuation_id.to_string(),
                reason: "created thread has no first turn".to_string(),
            }
        })?;

        info!(continuation_id = %continuation_id, tool = %tool_name, "Conversation started");
        Ok(NewThreadOutcome {
            continuation_id,
            turn_echo,
        })
    }

    /// Rebuild bounded context for `id` including the incoming turn, then
    /// append that turn.
    pub async fn resume(&self, id: &ContinuationId, request: TurnRequest) -> Result<ResumeBundle> {
        let thread = self.store.read(id).await.inspect_err(|e| {
            if e.is_thread_not_found() {
                warn!(continuation_id = %id, tool = %request.tool_name, "Resume of unknown or expired thread");
            }
        })?;

        let ceiling = request.token_ceiling.unwrap_or(self.default_token_ceiling);
        let ttl_hint = request.ttl_class;
        let include_parents = request.include_parents;
        let tool_name = request.tool_name.clone();
        let turn = self.build_turn(request).await?;

        let history = self.history(thread, include_parents).await?;
        let files = file_candidates(&history, Some(&turn)).await;
        let mut bundle = self.assemble(history, Some(turn.clone()), files, ceiling);

        // One write: a retried call can never leave the turn stored twice.
        let (stored, ttl_class) = self
            .store
            .append_with_ttl(id, turn, bundle.ttl_class.max(ttl_hint))
            .await?;
        if let Some(last) = bundle.ordered_turns.last_mut() {
            last.turn = stored;
        }
        bundle.ttl_class = ttl_class;

        info!(
            continuation_id = %id,
            tool = %tool_name,
            turns = bundle.ordered_turns.len(),
            files = bundle.included_files.len(),
            omitted_files = bundle.omitted_files.len(),
            tokens = bundle.tokens_used,
            "Conversation resumed"
        );
        Ok(bundle)
    }

    /// Rebuild bounded context for `request.continuation_id` without writing.
    pub async fn reconstruct(&self, request: &ReconstructionRequest) -> Result<ResumeBundle> {
        let thread = self.store.read(&request.continuation_id).await?;
        let ceiling = request.token_ceiling.unwrap_or(self.default_token_ceiling);
        let history = self.history(thread, request.include_parents).await?;
        let files = file_candidates(&history, None).await;
        Ok(self.assemble(history, None, files, ceiling))
    }

    /// Append the model's answer. Called after the model responded.
    ///
    /// Attached files without a modification time are stat'ed first.
    pub async fn record_response(&self, id: &ContinuationId, mut turn: Turn) -> Result<Turn> {
        for file in turn.files.iter_mut().filter(|f| f.modified_at.is_none()) {
            file.modified_at = modified_at(&file.path).await;
        }
        let stored = self.store.append(id, turn).await?;
        debug!(continuation_id = %id, tool = %stored.tool_name, "Response recorded");
        Ok(stored)
    }

    /// The thread and its ancestors, oldest ancestor first.
    ///
    /// The thread itself must exist. The walk stops at a missing or expired
    /// ancestor, at a cycle, or after the configured depth.
    pub async fn chain(&self, id: &ContinuationId) -> Result<Vec<Thread>> {
        let thread = self.store.read(id).await?;
        self.ancestry(thread).await
    }

    async fn ancestry(&self, thread: Thread) -> Result<Vec<Thread>> {
        let mut visited = HashSet::from([thread.continuation_id.clone()]);
        let mut next = thread.parent_id.clone();
        let mut chain = vec![thread];

        while let Some(parent_id) = next.take() {
            if chain.len() > self.max_parent_depth || !visited.insert(parent_id.clone()) {
                break;
            }
            match self.store.read(&parent_id).await {
                Ok(parent) => {
                    next = parent.parent_id.clone();
                    chain.push(parent);
                }
                Err(e) if e.is_thread_not_found() => {
                    debug!(continuation_id = %parent_id, "Ancestor gone, chain truncated");
                }
                Err(e) => return Err(e),
            }
        }

        chain.reverse();
        Ok(chain)
    }

    async fn history(&self, thread: Thread, include_parents: bool) -> Result<History> {
        let id = thread.continuation_id.clone();
        let threads = if include_parents {
            self.ancestry(thread).await?
        } else {
            vec![thread]
        };

        let mut history = History {
            continuation_id: id.clone(),
            origin_tool: String::new(),
            ttl_class: TtlClass::Standard,
            turns: Vec::new(),
        };
        for thread in threads {
            let origin = (thread.continuation_id != id).then(|| thread.continuation_id.clone());
            if origin.is_none() {
                history.origin_tool = thread.tool_name.clone();
                history.ttl_class = thread.ttl_class;
            }
            history
                .turns
                .extend(thread.turns.into_iter().map(|turn| (origin.clone(), turn)));
        }
        Ok(history)
    }

    /// Turn a request into a turn, offloading its text if needed and
    /// recording the current modification time of every attached file.
    async fn build_turn(&self, request: TurnRequest) -> Result<Turn> {
        let mut files = Vec::with_capacity(request.files.len() + 1);
        let text = match self.offloader.maybe_offload(request.text).await? {
            Payload::Inline(text) => text,
            Payload::File(file) => {
                files.push(file);
                OFFLOAD_NOTE.to_string()
            }
        };

        for path in request.files {
            let mtime = modified_at(&path).await;
            files.push(AttachedFile::new(path).with_modified_at(mtime));
        }

        let turn = match request.role {
            Role::User => Turn::user(request.tool_name, text),
            Role::Assistant => Turn::assistant(request.tool_name, text),
        };
        Ok(turn.with_files(files))
    }

    fn assemble(
        &self,
        history: History,
        pending: Option<Turn>,
        sized_files: Vec<Candidate<FileCandidate>>,
        ceiling: usize,
    ) -> ResumeBundle {
        let pending_tokens = pending.as_ref().map(estimate_turn_tokens).unwrap_or(0);
        let total_turns = history.turns.len() + usize::from(pending.is_some());

        // Turn text first, oldest first.
        let prior = history.turns.len();
        let turn_candidates = history
            .turns
            .into_iter()
            .enumerate()
            .map(|(index, (origin, turn))| {
                Candidate::new(HistoryTurn { index, origin, turn }, PriorityClass::Other)
            })
            .collect();
        let turn_budget = ceiling.saturating_sub(pending_tokens);
        let turns = allocate(turn_budget, turn_candidates);

        let mut ordered_turns: Vec<BundledTurn> = turns
            .selected
            .into_iter()
            .map(|s| BundledTurn {
                index: s.item.index,
                from_thread: s.item.origin,
                turn: s.item.turn,
            })
            .collect();
        if let Some(turn) = pending {
            ordered_turns.push(BundledTurn {
                index: prior,
                from_thread: None,
                turn,
            });
        }

        // Files share what the turns left.
        let file_budget = turn_budget - turns.spent_tokens;
        let files = Allocator::with_shares(self.shares).allocate(file_budget, sized_files);

        let mut included: Vec<FileCandidate> = files.selected.into_iter().map(|s| s.item).collect();
        included.sort_by_key(|f| f.order);

        let omitted_files: Vec<OmittedFile> = files
            .omitted
            .into_iter()
            .map(|o| OmittedFile {
                path: o.item.reference.path,
                tokens: o.tokens,
                class: o.class,
                reason: o.reason,
            })
            .collect();

        if !omitted_files.is_empty() || !turns.omitted.is_empty() {
            debug!(
                continuation_id = %history.continuation_id,
                ceiling,
                omitted_files = omitted_files.len(),
                omitted_turns = turns.omitted.len(),
                "Context trimmed to fit ceiling"
            );
        }

        let tokens_used = pending_tokens + turns.spent_tokens + files.spent_tokens;
        let over_ceiling = tokens_used > ceiling;
        if over_ceiling {
            warn!(
                continuation_id = %history.continuation_id,
                ceiling,
                tokens_used,
                "Incoming turn alone exceeds the token ceiling"
            );
        }

        ResumeBundle {
            continuation_id: history.continuation_id,
            origin_tool: history.origin_tool,
            ttl_class: history.ttl_class,
            ordered_turns,
            included_files: included.into_iter().map(|f| f.reference).collect(),
            omitted_files,
            omitted_turns: turns.omitted.len(),
            total_turns,
            warnings: files.warnings,
            token_ceiling: ceiling,
            tokens_used,
            over_ceiling,
        }
    }
}

/// Turns in reconstruction order, each tagged with the ancestor it came
/// from (`None` for the thread itself).
struct History {
    continuation_id: ContinuationId,
    origin_tool: String,
    ttl_class: TtlClass,
    turns: Vec<(Option<ContinuationId>, Turn)>,
}

struct HistoryTurn {
    index: usize,
    origin: Option<ContinuationId>,
    turn: Turn,
}

impl Estimable for HistoryTurn {
    fn estimate(&self) -> Estimate {
        Estimate::tokens(estimate_turn_tokens(&self.turn))
    }
}

struct FileCandidate {
    order: usize,
    reference: FileReference,
    estimate: Estimate,
}

impl Estimable for FileCandidate {
    fn estimate(&self) -> Estimate {
        self.estimate.clone()
    }
}

/// Deduplicated files across the history and the incoming turn, sized
/// before allocation so the allocator never reads from disk.
async fn file_candidates(history: &History, pending: Option<&Turn>) -> Vec<Candidate<FileCandidate>> {
    let turns: Vec<Turn> = history
        .turns
        .iter()
        .map(|(_, turn)| turn.clone())
        .chain(pending.cloned())
        .collect();

    let mut candidates = Vec::new();
    for (order, reference) in reduce(&turns).into_iter().enumerate() {
        let class = turns[reference.first_seen_turn_index]
            .files
            .iter()
            .find(|f| f.path == reference.path)
            .map(PriorityClass::for_attachment)
            .unwrap_or_else(|| PriorityClass::for_path(&reference.path));
        let estimate = estimate_file_async(&reference.path).await;
        candidates.push(Candidate::new(FileCandidate { order, reference, estimate }, class));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use threadgate_core::error::{Error, ThreadError};
    use threadgate_core::store::{KvBackend, Versioned};
    use threadgate_store::InMemoryBackend;

    use crate::context::token::estimate_file;

    struct Fixture {
        engine: ContinuationEngine,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_threshold(50_000)
        }

        fn with_threshold(threshold: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(ThreadStore::new(Arc::new(InMemoryBackend::new())));
            let engine = ContinuationEngine::new(
                store,
                PayloadOffloader::new(threshold, dir.path().join("offload")),
            );
            Self { engine, dir }
        }

        fn file(&self, name: &str, bytes: usize) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, "x".repeat(bytes)).unwrap();
            path
        }
    }

    fn started(outcome: TurnOutcome) -> NewThreadOutcome {
        match outcome {
            TurnOutcome::Started(new) => new,
            TurnOutcome::Resumed(_) => panic!("expected a new thread"),
        }
    }

    fn resumed(outcome: TurnOutcome) -> ResumeBundle {
        match outcome {
            TurnOutcome::Resumed(bundle) => bundle,
            TurnOutcome::Started(_) => panic!("expected a resume"),
        }
    }

    #[tokio::test]
    async fn start_then_resume_through_another_tool() {
        let fx = Fixture::new();
        let a_py = fx.file("a.py", 120);

        let new = started(fx.engine.handle(TurnRequest::new("chat", "hello")).await.unwrap());
        assert_eq!(new.turn_echo.text, "hello");
        assert_eq!(new.turn_echo.tool_name, "chat");

        let bundle = resumed(
            fx.engine
                .handle(
                    TurnRequest::new("analyze", "continue")
                        .with_files([a_py.clone()])
                        .with_continuation_id(new.continuation_id.clone()),
                )
                .await
                .unwrap(),
        );

        assert_eq!(bundle.continuation_id, new.continuation_id);
        assert_eq!(bundle.origin_tool, "chat");
        let turns: Vec<_> = bundle
            .ordered_turns
            .iter()
            .map(|t| (t.index, t.turn.tool_name.as_str(), t.turn.text.as_str()))
            .collect();
        assert_eq!(turns, vec![(0, "chat", "hello"), (1, "analyze", "continue")]);
        assert_eq!(bundle.included_files.len(), 1);
        assert_eq!(bundle.included_files[0].path, a_py);
        assert_eq!(bundle.included_files[0].first_seen_turn_index, 1);
        assert!(bundle.omitted_files.is_empty());

        let thread = fx.engine.store().read(&new.continuation_id).await.unwrap();
        assert_eq!(thread.turn_count(), 2);
        assert!(thread.turns[1].files[0].modified_at.is_some());
    }

    #[tokio::test]
    async fn resume_of_unknown_thread_creates_nothing() {
        let fx = Fixture::new();
        let err = fx
            .engine
            .handle(TurnRequest::new("chat", "hi").with_continuation_id(ContinuationId::new()))
            .await
            .unwrap_err();

        assert!(err.is_thread_not_found());
        assert!(!err.is_retryable());
        assert_eq!(fx.engine.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tight_ceiling_drops_newest_prior_turns_first() {
        let fx = Fixture::new();
        let id = fx.engine.start(TurnRequest::new("chat", "a".repeat(40))).await.unwrap().continuation_id;
        fx.engine.record_response(&id, Turn::assistant("chat", "b".repeat(40))).await.unwrap();
        fx.engine.record_response(&id, Turn::assistant("chat", "c".repeat(40))).await.unwrap();

        // Each prior turn costs 14 tokens; the new one 5.
        let bundle = fx
            .engine
            .resume(&id, TurnRequest::new("chat", "next").with_token_ceiling(35))
            .await
            .unwrap();

        let indices: Vec<_> = bundle.ordered_turns.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 3]);
        assert_eq!(bundle.omitted_turns, 1);
        assert_eq!(bundle.total_turns, 4);
        assert_eq!(bundle.tokens_used, 33);
    }

    #[tokio::test]
    async fn incoming_turn_is_kept_even_over_the_ceiling() {
        let fx = Fixture::new();
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;

        let bundle = fx
            .engine
            .resume(&id, TurnRequest::new("chat", "z".repeat(400)).with_token_ceiling(10))
            .await
            .unwrap();
        assert_eq!(bundle.ordered_turns.len(), 1);
        assert_eq!(bundle.ordered_turns[0].index, 1);
        assert_eq!(bundle.omitted_turns, 1);
        assert!(bundle.tokens_used > bundle.token_ceiling);
        assert!(bundle.over_ceiling);

        let bundle = fx.engine.resume(&id, TurnRequest::new("chat", "short")).await.unwrap();
        assert!(!bundle.over_ceiling);
        assert!(bundle.tokens_used <= bundle.token_ceiling);
    }

    #[tokio::test]
    async fn oversized_file_is_reported_not_dropped_silently() {
        let fx = Fixture::new();
        let big = fx.file("big.log", 8_000);
        let small = fx.file("small.rs", 35);
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;

        let bundle = fx
            .engine
            .resume(
                &id,
                TurnRequest::new("review", "check these")
                    .with_files([big.clone(), small.clone()])
                    .with_token_ceiling(200),
            )
            .await
            .unwrap();

        assert_eq!(bundle.included_files.len(), 1);
        assert_eq!(bundle.included_files[0].path, small);
        assert_eq!(bundle.omitted_files.len(), 1);
        assert_eq!(bundle.omitted_files[0].path, big);
        assert_eq!(bundle.omitted_files[0].class, PriorityClass::Other);
        assert_eq!(bundle.omitted_files[0].reason, OmissionReason::BudgetExceeded);
        assert!(bundle.tokens_used <= 200);
    }

    #[tokio::test]
    async fn unreadable_file_is_a_warning() {
        let fx = Fixture::new();
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;

        let bundle = fx
            .engine
            .resume(&id, TurnRequest::new("debug", "why").with_files(["/no/such/file.rs"]))
            .await
            .unwrap();
        assert_eq!(bundle.warnings.len(), 1);
        assert_eq!(bundle.warnings[0].path, PathBuf::from("/no/such/file.rs"));
        assert_eq!(bundle.ordered_turns.len(), 2);
    }

    #[tokio::test]
    async fn file_repeated_unchanged_is_sent_once() {
        let fx = Fixture::new();
        let lib = fx.file("lib.rs", 100);
        let id = fx
            .engine
            .start(TurnRequest::new("review", "first").with_files([lib.clone()]))
            .await
            .unwrap()
            .continuation_id;

        let bundle = fx
            .engine
            .resume(&id, TurnRequest::new("review", "again").with_files([lib.clone()]))
            .await
            .unwrap();
        assert_eq!(
            bundle.included_files,
            vec![FileReference {
                path: lib,
                first_seen_turn_index: 0,
            }]
        );
    }

    #[tokio::test]
    async fn files_are_sized_once_before_allocation() {
        let fx = Fixture::new();
        let lib = fx.file("lib.rs", 300);
        let gone = fx.dir.path().join("gone.md");
        let mtime = modified_at(&lib).await;

        let history = History {
            continuation_id: ContinuationId::new(),
            origin_tool: "review".into(),
            ttl_class: TtlClass::Standard,
            turns: vec![
                (None, Turn::user("review", "one").with_files(vec![AttachedFile::new(&lib).with_modified_at(mtime)])),
                (None, Turn::assistant("review", "two")),
            ],
        };
        let pending = Turn::user("review", "three").with_files(vec![
            AttachedFile::new(&lib).with_modified_at(mtime),
            AttachedFile::new(&gone),
        ]);

        let sized = file_candidates(&history, Some(&pending)).await;
        let summary: Vec<_> = sized
            .iter()
            .map(|c| (c.item.reference.path.clone(), c.class, c.item.estimate.tokens))
            .collect();
        assert_eq!(
            summary,
            vec![
                (lib.clone(), PriorityClass::Source, estimate_file(&lib).tokens),
                (gone.clone(), PriorityClass::Docs, 0),
            ]
        );
        assert_eq!(sized[1].item.estimate.warning.as_ref().unwrap().path, gone);
    }

    #[tokio::test]
    async fn reconstruct_does_not_write() {
        let fx = Fixture::new();
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;
        let before = fx.engine.store().read(&id).await.unwrap();

        let bundle = fx
            .engine
            .reconstruct(&ReconstructionRequest {
                continuation_id: id.clone(),
                token_ceiling: Some(1_000),
                include_parents: false,
            })
            .await
            .unwrap();
        assert_eq!(bundle.ordered_turns.len(), 1);
        assert_eq!(bundle.token_ceiling, 1_000);

        let after = fx.engine.store().read(&id).await.unwrap();
        assert_eq!(after.turn_count(), 1);
        assert_eq!(after.last_activity_at, before.last_activity_at);
    }

    #[tokio::test]
    async fn response_keeps_provider_metadata_verbatim() {
        let fx = Fixture::new();
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;
        let meta = serde_json::json!({"model": "m-1", "usage": {"output": 7}});

        fx.engine
            .record_response(&id, Turn::assistant("chat", "hi").with_provider_metadata(meta.clone()))
            .await
            .unwrap();

        let thread = fx.engine.store().read(&id).await.unwrap();
        assert_eq!(thread.turns[1].role, Role::Assistant);
        assert_eq!(thread.turns[1].provider_metadata.as_ref().unwrap().0, meta);
    }

    #[tokio::test]
    async fn large_prompt_is_offloaded_and_ranked_as_source() {
        let fx = Fixture::with_threshold(32);
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;

        let bundle = fx
            .engine
            .resume(&id, TurnRequest::new("analyze", "p".repeat(33)))
            .await
            .unwrap();

        let stored = &bundle.ordered_turns[1].turn;
        assert_eq!(stored.text, OFFLOAD_NOTE);
        assert!(stored.files[0].offloaded);
        assert_eq!(bundle.included_files[0].path, stored.files[0].path);
        assert_eq!(std::fs::read_to_string(&stored.files[0].path).unwrap(), "p".repeat(33));
    }

    #[tokio::test]
    async fn failed_offload_leaves_no_thread() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = Arc::new(ThreadStore::new(Arc::new(InMemoryBackend::new())));
        let engine = ContinuationEngine::new(store, PayloadOffloader::new(4, blocker.join("sub")));

        let err = engine.start(TurnRequest::new("chat", "far too long")).await.unwrap_err();
        assert!(matches!(err, Error::Offload(_)));
        assert_eq!(engine.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resume_can_upgrade_ttl_class() {
        let fx = Fixture::new();
        let id = fx.engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;

        let bundle = fx
            .engine
            .resume(&id, TurnRequest::new("analyze", "deep dive").with_ttl_class(TtlClass::Extended))
            .await
            .unwrap();
        assert_eq!(bundle.ttl_class, TtlClass::Extended);

        // Never downgraded afterwards.
        let bundle = fx.engine.resume(&id, TurnRequest::new("chat", "thanks")).await.unwrap();
        assert_eq!(bundle.ttl_class, TtlClass::Extended);
    }

    /// In-memory backend that counts writes and can drop the connection on
    /// the next one.
    #[derive(Default)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        swaps: AtomicUsize,
        creates: AtomicUsize,
        fail_next_write: AtomicBool,
    }

    impl FlakyBackend {
        fn check(&self) -> std::result::Result<(), StoreError> {
            if self.fail_next_write.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn get(&self, key: &str) -> std::result::Result<Option<Versioned>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String, ttl: Duration) -> std::result::Result<u64, StoreError> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_if_absent(
            &self,
            key: &str,
            value: String,
            ttl: Duration,
        ) -> std::result::Result<bool, StoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn compare_and_swap(
            &self,
            key: &str,
            expected_version: u64,
            value: String,
            ttl: Duration,
        ) -> std::result::Result<bool, StoreError> {
            self.swaps.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.compare_and_swap(key, expected_version, value, ttl).await
        }
        async fn sweep_expired(&self) -> std::result::Result<usize, StoreError> {
            self.inner.sweep_expired().await
        }
        async fn count(&self) -> std::result::Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    fn flaky_engine(dir: &std::path::Path) -> (ContinuationEngine, Arc<FlakyBackend>) {
        let backend = Arc::new(FlakyBackend::default());
        let store = Arc::new(ThreadStore::new(backend.clone()));
        let engine = ContinuationEngine::new(store, PayloadOffloader::new(1_000, dir));
        (engine, backend)
    }

    #[tokio::test]
    async fn start_writes_thread_and_first_turn_together() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, backend) = flaky_engine(dir.path());

        backend.fail_next_write.store(true, Ordering::SeqCst);
        let err = engine.start(TurnRequest::new("chat", "hello")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.store().count().await.unwrap(), 0);

        let new = engine.start(TurnRequest::new("chat", "hello")).await.unwrap();
        assert_eq!(backend.creates.load(Ordering::SeqCst), 2);
        assert_eq!(backend.swaps.load(Ordering::SeqCst), 0);

        let thread = engine.store().read(&new.continuation_id).await.unwrap();
        assert_eq!(thread.turn_count(), 1);
        assert_eq!(thread.turns[0].text, "hello");
        assert_eq!(thread.turns[0].timestamp, new.turn_echo.timestamp);
    }

    #[tokio::test]
    async fn retried_resume_stores_the_turn_once() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, backend) = flaky_engine(dir.path());
        let id = engine.start(TurnRequest::new("chat", "hello")).await.unwrap().continuation_id;

        let request = || TurnRequest::new("analyze", "deep dive").with_ttl_class(TtlClass::Extended);

        backend.fail_next_write.store(true, Ordering::SeqCst);
        let err = engine.resume(&id, request()).await.unwrap_err();
        assert!(err.is_retryable());
        let thread = engine.store().read(&id).await.unwrap();
        assert_eq!(thread.turn_count(), 1);
        assert_eq!(thread.ttl_class, TtlClass::Standard);

        let before = backend.swaps.load(Ordering::SeqCst);
        let bundle = engine.resume(&id, request()).await.unwrap();
        assert_eq!(backend.swaps.load(Ordering::SeqCst) - before, 1);
        assert_eq!(bundle.ttl_class, TtlClass::Extended);

        let thread = engine.store().read(&id).await.unwrap();
        let texts: Vec<_> = thread.turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "deep dive"]);
        assert_eq!(thread.ttl_class, TtlClass::Extended);
    }

    #[tokio::test]
    async fn chain_walks_parents_and_tolerates_missing_ancestors() {
        let fx = Fixture::new();
        let root = fx.engine.start(TurnRequest::new("plan", "root")).await.unwrap().continuation_id;
        let child = fx
            .engine
            .start(TurnRequest::new("chat", "child").with_parent(root.clone()))
            .await
            .unwrap()
            .continuation_id;
        let orphan = fx
            .engine
            .start(TurnRequest::new("chat", "orphan").with_parent(ContinuationId::new()))
            .await
            .unwrap()
            .continuation_id;

        let ids: Vec<_> = fx
            .engine
            .chain(&child)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.continuation_id)
            .collect();
        assert_eq!(ids, vec![root.clone(), child.clone()]);
        assert_eq!(fx.engine.chain(&orphan).await.unwrap().len(), 1);

        let bundle = fx
            .engine
            .reconstruct(&ReconstructionRequest {
                continuation_id: child.clone(),
                token_ceiling: None,
                include_parents: true,
            })
            .await
            .unwrap();
        assert_eq!(bundle.ordered_turns[0].turn.text, "root");
        assert_eq!(bundle.ordered_turns[0].from_thread, Some(root));
        assert_eq!(bundle.ordered_turns[1].turn.text, "child");
        assert_eq!(bundle.ordered_turns[1].from_thread, None);
        assert_eq!(bundle.origin_tool, "chat");
    }

    #[tokio::test]
    async fn initial_context_is_stored_verbatim() {
        let fx = Fixture::new();
        let args = serde_json::json!({"path": "/repo", "depth": 3, "flags": ["fast"]})
            .as_object()
            .cloned()
            .unwrap();

        let id = fx
            .engine
            .start(TurnRequest::new("analyze", "go").with_initial_context(args.clone()))
            .await
            .unwrap()
            .continuation_id;
        fx.engine.resume(&id, TurnRequest::new("analyze", "more")).await.unwrap();

        let thread = fx.engine.store().read(&id).await.unwrap();
        assert_eq!(thread.initial_context, args);
    }

    #[tokio::test]
    async fn turn_limit_surfaces_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ThreadStore::new(Arc::new(InMemoryBackend::new())).with_max_turns(2));
        let engine = ContinuationEngine::new(store, PayloadOffloader::new(1_000, dir.path()));

        let id = engine.start(TurnRequest::new("chat", "one")).await.unwrap().continuation_id;
        engine.resume(&id, TurnRequest::new("chat", "two")).await.unwrap();
        let err = engine.resume(&id, TurnRequest::new("chat", "three")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Thread(ThreadError::TurnLimitReached { limit: 2, .. })
        ));
    }

    #[test]
    fn turn_request_defaults_from_json() {
        let request: TurnRequest =
            serde_json::from_str(r#"{"tool_name":"chat","text":"hi"}"#).unwrap();
        assert_eq!(request.role, Role::User);
        assert!(request.continuation_id.is_none());
        assert!(request.files.is_empty());
        assert_eq!(request.ttl_class, TtlClass::Standard);
    }
}
