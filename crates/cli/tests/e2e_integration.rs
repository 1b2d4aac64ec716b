//! End-to-end integration tests for threadgate.
//!
//! These tests drive the store, engine and context crates together the way
//! the gateway does, covering the conversation lifecycle from the first
//! tool call through budgeted reconstruction and expiry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use threadgate_core::thread::{AttachedFile, ContinuationId, Turn};
use threadgate_engine::{
    Candidate, ContinuationEngine, Estimable, Estimate, OFFLOAD_NOTE, OmissionReason,
    PayloadOffloader, PriorityClass, ReconstructionRequest, TurnOutcome, TurnRequest, allocate,
    reduce, render_history,
};
use threadgate_store::{InMemoryBackend, NewThread, ThreadStore, TtlPolicy};

// ── Helpers ──────────────────────────────────────────────────────────────

fn memory_store() -> Arc<ThreadStore> {
    Arc::new(ThreadStore::new(Arc::new(InMemoryBackend::new())))
}

fn engine_in(dir: &Path, threshold: usize) -> ContinuationEngine {
    ContinuationEngine::new(
        memory_store(),
        PayloadOffloader::new(threshold, dir.join("offload")),
    )
}

fn attached(path: &str, mtime_secs: i64) -> AttachedFile {
    AttachedFile::new(path).with_modified_at(Utc.timestamp_opt(mtime_secs, 0).single())
}

#[derive(Debug, Clone)]
struct Fixed(&'static str, usize);

impl Estimable for Fixed {
    fn estimate(&self) -> Estimate {
        Estimate::tokens(self.1)
    }
}

// ── File deduplication ───────────────────────────────────────────────────

#[test]
fn e2e_unchanged_file_is_sent_once_from_first_mention() {
    let turns: Vec<Turn> = (0..5)
        .map(|i| {
            let turn = Turn::user("review", format!("turn {i}"));
            if i % 2 == 0 {
                turn.with_files(vec![attached("/src/lib.rs", 1_700_000_000)])
            } else {
                turn
            }
        })
        .collect();

    let refs = reduce(&turns);
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].path, PathBuf::from("/src/lib.rs"));
    assert_eq!(refs[0].first_seen_turn_index, 0);
}

#[test]
fn e2e_file_changed_on_disk_is_sent_again() {
    let mut turns = vec![
        Turn::user("review", "one").with_files(vec![attached("/src/lib.rs", 1_700_000_000)]),
        Turn::assistant("review", "two"),
        Turn::user("review", "three").with_files(vec![attached("/src/lib.rs", 1_700_000_000)]),
        Turn::assistant("review", "four"),
    ];
    turns.push(Turn::user("review", "five").with_files(vec![attached("/src/lib.rs", 1_700_000_600)]));

    let refs = reduce(&turns);
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].first_seen_turn_index, 4);
}

// ── Budget allocation ────────────────────────────────────────────────────

#[test]
fn e2e_source_fits_and_docs_are_marked_omitted() {
    let result = allocate(
        100,
        vec![
            Candidate::new(Fixed("src_file", 90), PriorityClass::Source),
            Candidate::new(Fixed("doc_file", 50), PriorityClass::Docs),
        ],
    );

    let selected: Vec<_> = result.selected.iter().map(|s| s.item.0).collect();
    assert_eq!(selected, vec!["src_file"]);
    assert_eq!(result.spent_tokens, 90);
    assert_eq!(result.omitted.len(), 1);
    assert_eq!(result.omitted[0].item.0, "doc_file");
    assert_eq!(result.omitted[0].reason, OmissionReason::BudgetExceeded);
}

#[test]
fn e2e_larger_budget_never_selects_less() {
    let candidates = || {
        vec![
            Candidate::new(Fixed("main.rs", 70), PriorityClass::Source),
            Candidate::new(Fixed("Cargo.toml", 15), PriorityClass::Config),
            Candidate::new(Fixed("util.rs", 40), PriorityClass::Source),
            Candidate::new(Fixed("README.md", 25), PriorityClass::Docs),
            Candidate::new(Fixed("build.log", 5), PriorityClass::Other),
        ]
    };

    let mut previous = 0;
    for budget in 0..=200 {
        let spent = allocate(budget, candidates()).spent_tokens;
        assert!(spent <= budget);
        assert!(spent >= previous, "budget {budget}: {spent} < {previous}");
        previous = spent;
    }
    assert_eq!(previous, 155);
}

// ── Thread store ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn e2e_concurrent_appends_keep_every_turn_in_order() {
    let store = memory_store();
    let id = store.create(NewThread::new("chat")).await.unwrap();

    let writers: Vec<_> = (0..12)
        .map(|i| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.append(&id, Turn::user("chat", format!("w{i}"))).await })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let thread = store.read(&id).await.unwrap();
    assert_eq!(thread.turn_count(), 12);
    assert!(thread.turns.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test(start_paused = true)]
async fn e2e_idle_thread_expires_after_its_window() {
    let window = Duration::from_secs(3600);
    let store = ThreadStore::new(Arc::new(InMemoryBackend::new())).with_ttl_policy(TtlPolicy {
        standard: window,
        extended: window * 16,
    });
    let id = store.create(NewThread::new("chat")).await.unwrap();

    tokio::time::advance(window - Duration::from_secs(1)).await;
    store.append(&id, Turn::user("chat", "still here")).await.unwrap();

    tokio::time::advance(window - Duration::from_secs(1)).await;
    assert_eq!(store.read(&id).await.unwrap().turn_count(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let err = store.read(&id).await.unwrap_err();
    assert!(err.is_thread_not_found());
}

// ── Continuation engine ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_chat_thread_continued_by_analyze() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), 50_000);

    let id = match engine.handle(TurnRequest::new("chat", "hello")).await.unwrap() {
        TurnOutcome::Started(new) => {
            assert_eq!(new.turn_echo.text, "hello");
            new.continuation_id
        }
        TurnOutcome::Resumed(_) => panic!("first call must start a thread"),
    };

    let bundle = match engine
        .handle(
            TurnRequest::new("analyze", "continue")
                .with_files(["/a.py"])
                .with_continuation_id(id.clone()),
        )
        .await
        .unwrap()
    {
        TurnOutcome::Resumed(bundle) => bundle,
        TurnOutcome::Started(_) => panic!("second call must resume"),
    };

    let turns: Vec<_> = bundle
        .ordered_turns
        .iter()
        .map(|t| (t.turn.tool_name.as_str(), t.turn.text.as_str()))
        .collect();
    assert_eq!(turns, vec![("chat", "hello"), ("analyze", "continue")]);
    assert!(bundle.included_files.iter().any(|f| f.path == Path::new("/a.py")));
    // Missing on this machine: recorded, not fatal.
    assert!(bundle.warnings.iter().any(|w| w.path == Path::new("/a.py")));

    let history = render_history(&bundle);
    assert!(history.contains("--- Turn 1 (user, via chat) ---"));
    assert!(history.contains("--- Turn 2 (user, via analyze) ---"));
}

#[tokio::test]
async fn e2e_unknown_id_is_not_silently_created() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), 50_000);
    let ghost = ContinuationId::new();

    let err = engine
        .handle(TurnRequest::new("chat", "hi").with_continuation_id(ghost.clone()))
        .await
        .unwrap_err();
    assert!(err.is_thread_not_found());

    let err = engine
        .reconstruct(&ReconstructionRequest {
            continuation_id: ghost,
            token_ceiling: None,
            include_parents: false,
        })
        .await
        .unwrap_err();
    assert!(err.is_thread_not_found());
    assert_eq!(engine.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn e2e_oversized_prompt_becomes_a_file_reference() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), 64);

    let inline = engine.start(TurnRequest::new("chat", "a".repeat(64))).await.unwrap();
    assert_eq!(inline.turn_echo.text.len(), 64);
    assert!(inline.turn_echo.files.is_empty());

    let offloaded = engine.start(TurnRequest::new("chat", "b".repeat(65))).await.unwrap();
    let stored = engine.store().read(&offloaded.continuation_id).await.unwrap();
    let turn = &stored.turns[0];
    assert_eq!(turn.text, OFFLOAD_NOTE);
    assert_eq!(turn.files.len(), 1);
    assert!(turn.files[0].offloaded);
    assert_eq!(std::fs::read_to_string(&turn.files[0].path).unwrap(), "b".repeat(65));
}
