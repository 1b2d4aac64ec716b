//! Large-payload offload.
//!
//! Prompt text longer than the configured threshold never enters a turn.
//! It is written to a transient file, and the turn carries a short note
//! plus a file reference instead, so the estimator and allocator only ever
//! see turn text and referenced files.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use threadgate_config::OffloadConfig;
use threadgate_core::error::OffloadError;
use threadgate_core::thread::AttachedFile;
use tracing::{debug, warn};
use uuid::Uuid;

/// Turn text stored in place of an offloaded prompt.
pub const OFFLOAD_NOTE: &str = "[prompt attached as file]";

const FILE_PREFIX: &str = "prompt-";
const FILE_SUFFIX: &str = ".txt";

/// Where a prompt ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(String),
    File(AttachedFile),
}

/// Writes oversized prompts to a side directory.
#[derive(Debug, Clone)]
pub struct PayloadOffloader {
    threshold: usize,
    dir: PathBuf,
}

impl PayloadOffloader {
    /// `threshold` is in bytes; text strictly longer than it is offloaded.
    pub fn new(threshold: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            threshold,
            dir: dir.into(),
        }
    }

    pub fn from_config(config: &OffloadConfig) -> Self {
        Self::new(config.threshold_bytes, config.dir())
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keep `raw_text` inline, or move it to a file if it is too long.
    ///
    /// A failed write fails the request; the text is never truncated.
    pub async fn maybe_offload(&self, raw_text: String) -> Result<Payload, OffloadError> {
        if raw_text.len() <= self.threshold {
            return Ok(Payload::Inline(raw_text));
        }

        let path = self.dir.join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", Uuid::new_v4()));
        let write_failed = |e: std::io::Error| {
            warn!(path = %path.display(), error = %e, "Failed to offload large prompt");
            OffloadError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(write_failed)?;
        tokio::fs::write(&path, raw_text.as_bytes())
            .await
            .map_err(write_failed)?;

        warn!(
            path = %path.display(),
            bytes = raw_text.len(),
            threshold = self.threshold,
            "Large prompt offloaded to file"
        );

        let modified_at = modified_at(&path).await;
        Ok(Payload::File(
            AttachedFile::offloaded_prompt(path).with_modified_at(modified_at),
        ))
    }

    /// Delete offloaded prompts older than `max_age`. Returns how many were removed.
    ///
    /// Only files this offloader could have written are considered.
    pub async fn prune(&self, max_age: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)) {
                continue;
            }

            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(_) => continue,
            };
            if age < max_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to prune offloaded prompt"),
            }
        }

        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "Pruned offloaded prompts");
        }
        removed
    }
}

/// Modification time of a file, if it can be stat'ed.
pub(crate) async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
