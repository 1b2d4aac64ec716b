//! Turn and Thread domain types.
//!
//! These are the value objects persisted by the thread store and rebuilt by
//! the continuation engine:
//! Tool call arrives → Turn is built → appended to its Thread → Thread is
//! read back and trimmed to a token budget on the next call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Externally visible identifier of a conversation thread.
///
/// Freshly generated ids are random v4 UUIDs (122 bits of entropy).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationId(pub String);

impl ContinuationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Whether this id could have been produced by [`ContinuationId::new`].
    /// Anything else can never name a stored thread.
    pub fn is_well_formed(&self) -> bool {
        Uuid::parse_str(&self.0).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContinuationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ids arriving from callers are trimmed; well-formedness is checked on lookup.
impl From<&str> for ContinuationId {
    fn from(s: &str) -> Self {
        Self(s.trim().to_string())
    }
}

impl From<String> for ContinuationId {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl std::str::FromStr for ContinuationId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl std::fmt::Display for ContinuationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The calling tool, on behalf of the end user
    User,
    /// The model backend
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// How long an idle thread is retained.
///
/// Ordered: `Standard < Extended`, so a touch can only ever upgrade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    #[default]
    Standard,
    /// Heavier analytical sessions.
    Extended,
}

/// Opaque per-turn provider payload (model name, billed usage, ...).
///
/// Stored and returned verbatim. Nothing in threadgate branches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderMetadata(pub serde_json::Value);

/// A file path attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    /// Absolute path. Contents are never stored.
    pub path: PathBuf,

    /// Modification time observed when the turn was recorded. `None` when
    /// the file could not be stat'ed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,

    /// Set when this file holds a prompt that was too large to inline.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub offloaded: bool,
}

impl AttachedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modified_at: None,
            offloaded: false,
        }
    }

    /// A transient file holding an oversized prompt.
    pub fn offloaded_prompt(path: impl Into<PathBuf>) -> Self {
        Self {
            offloaded: true,
            ..Self::new(path)
        }
    }

    pub fn with_modified_at(mut self, modified_at: Option<DateTime<Utc>>) -> Self {
        self.modified_at = modified_at;
        self
    }
}

/// One role-tagged exchange unit within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,

    /// Rendered message body.
    pub text: String,

    /// Tool that produced or consumed this turn. Opaque to the engine.
    pub tool_name: String,

    /// Files attached at this turn, in caller order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<AttachedFile>,

    /// Assigned by [`Thread::push_turn`]; strictly increasing within a thread.
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<ProviderMetadata>,
}

impl Turn {
    /// Create a new user turn.
    pub fn user(tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_role(Role::User, tool_name, text)
    }

    /// Create a new assistant turn.
    pub fn assistant(tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, tool_name, text)
    }

    fn with_role(role: Role, tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_name: tool_name.into(),
            files: Vec::new(),
            timestamp: Utc::now(),
            provider_metadata: None,
        }
    }

    pub fn with_files(mut self, files: Vec<AttachedFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_provider_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.provider_metadata = Some(ProviderMetadata(metadata));
        self
    }

    /// Paths attached at this turn.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }
}

/// A path as seen by the conversation, attributed to the turn that first
/// introduced its current content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: PathBuf,
    pub first_seen_turn_index: usize,
}

/// A named, ordered list of turns plus lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub continuation_id: ContinuationId,

    /// Thread this one was spawned from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ContinuationId>,

    /// Tool that created the thread.
    pub tool_name: String,

    pub created_at: DateTime<Utc>,

    pub last_activity_at: DateTime<Utc>,

    #[serde(default)]
    pub ttl_class: TtlClass,

    /// Ordered turns, oldest first.
    #[serde(default)]
    pub turns: Vec<Turn>,

    /// Arguments of the creating tool call. Stored verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub initial_context: serde_json::Map<String, serde_json::Value>,
}

impl Thread {
    /// Create a new empty thread.
    pub fn new(continuation_id: ContinuationId, tool_name: impl Into<String>, ttl_class: TtlClass) -> Self {
        let now = Utc::now();
        Self {
            continuation_id,
            parent_id: None,
            tool_name: tool_name.into(),
            created_at: now,
            last_activity_at: now,
            ttl_class,
            turns: Vec::new(),
            initial_context: serde_json::Map::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: Option<ContinuationId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_initial_context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.initial_context = context;
        self
    }

    /// Number of turns. Diagnostics only.
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Append a turn, stamping it strictly after the previous one.
    ///
    /// Returns the turn as stored.
    pub fn push_turn(&mut self, mut turn: Turn) -> Turn {
        let now = Utc::now();
        turn.timestamp = match self.turns.last() {
            Some(last) => now.max(last.timestamp + Duration::microseconds(1)),
            None => now,
        };
        self.last_activity_at = self.last_activity_at.max(turn.timestamp);
        self.turns.push(turn.clone());
        turn
    }

    /// Record activity without adding a turn.
    pub fn touch(&mut self) {
        self.last_activity_at = self.last_activity_at.max(Utc::now());
    }
}
