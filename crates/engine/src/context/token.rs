//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token for prose,
//! fewer for dense source and markup (per-extension ratios below). Close
//! enough for BPE tokenizers to budget against, and deterministic.
//!
//! A file that cannot be read estimates to zero tokens and carries a
//! [`FileWarning`]; estimation never fails.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use threadgate_core::thread::Turn;
use tracing::warn;

/// Characters per token for text of unknown type.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Fixed per-turn cost for role and tool markers in the rendered history.
pub const TURN_OVERHEAD_TOKENS: usize = 4;

/// A file that could not be read during estimation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// The result of estimating one piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Estimate {
    pub tokens: usize,
    pub warning: Option<FileWarning>,
}

impl Estimate {
    pub fn tokens(tokens: usize) -> Self {
        Self {
            tokens,
            warning: None,
        }
    }
}

/// Content the engine budgets: inline text or a referenced file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    File(PathBuf),
}

/// Anything the budget allocator can size.
pub trait Estimable {
    fn estimate(&self) -> Estimate;
}

impl Estimable for Content {
    fn estimate(&self) -> Estimate {
        match self {
            Content::Text(text) => Estimate::tokens(estimate_tokens(text)),
            Content::File(path) => estimate_file(path),
        }
    }
}

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() + 3) / 4
}

/// Estimate with an explicit characters-per-token ratio. Rounds up.
pub fn estimate_tokens_with_ratio(len: usize, chars_per_token: f64) -> usize {
    if len == 0 {
        return 0;
    }
    (len as f64 / chars_per_token).ceil() as usize
}

/// Estimate a turn, including its fixed overhead.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    TURN_OVERHEAD_TOKENS + estimate_tokens(&turn.text)
}

/// Characters-per-token ratio for a file, by extension.
pub fn chars_per_token(path: &Path) -> f64 {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("py") | Some("rs") | Some("kt") | Some("tf") => 3.5,
        Some("js") | Some("mjs") | Some("cjs") => 3.2,
        Some("ts") | Some("php") => 3.3,
        Some("jsx") | Some("tsx") => 3.1,
        Some("java") | Some("rb") => 3.6,
        Some("c") | Some("h") | Some("sql") => 3.8,
        Some("cpp") | Some("cc") | Some("hpp") => 3.7,
        Some("go") => 3.9,
        Some("swift") => 3.4,
        Some("scala") | Some("toml") => 3.2,
        Some("sh") | Some("bash") => 4.1,
        Some("html") | Some("htm") => 2.9,
        Some("css") | Some("scss") => 3.4,
        Some("json") => 2.5,
        Some("yaml") | Some("yml") => 3.0,
        Some("xml") => 2.8,
        Some("csv") => 3.1,
        Some("md") | Some("rst") => 4.2,
        Some("log") => 4.5,
        _ => DEFAULT_CHARS_PER_TOKEN,
    }
}

/// Estimate a file's tokens by reading it once.
///
/// Missing or unreadable files estimate to zero with a warning.
pub fn estimate_file(path: &Path) -> Estimate {
    file_estimate(path, std::fs::read(path))
}

/// [`estimate_file`] without blocking the runtime.
pub async fn estimate_file_async(path: &Path) -> Estimate {
    file_estimate(path, tokio::fs::read(path).await)
}

fn file_estimate(path: &Path, read: std::io::Result<Vec<u8>>) -> Estimate {
    match read {
        // Raw length: lossy decoding would inflate non-UTF-8 bytes threefold.
        Ok(bytes) => Estimate::tokens(estimate_tokens_with_ratio(bytes.len(), chars_per_token(path))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "File unreadable, estimating as zero tokens");
            Estimate {
                tokens: 0,
                warning: Some(FileWarning {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }),
            }
        }
    }
}
