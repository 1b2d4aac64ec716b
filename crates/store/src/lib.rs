//! Thread persistence for threadgate.

pub mod in_memory;
pub mod thread_store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryBackend;
pub use thread_store::{NewThread, ThreadStore, TtlPolicy};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use std::sync::Arc;
use threadgate_config::AppConfig;
use threadgate_core::error::StoreError;
use threadgate_core::store::KvBackend;

/// Open the backend named in the configuration.
pub async fn open_backend(config: &AppConfig) -> Result<Arc<dyn KvBackend>, StoreError> {
    match config.store.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryBackend::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = config.store.sqlite_path();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Unavailable(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
            let backend = SqliteBackend::new(&path.to_string_lossy()).await?;
            Ok(Arc::new(backend))
        }
        other => Err(StoreError::Unavailable(format!(
            "store backend \"{other}\" is not available in this build"
        ))),
    }
}

/// Build a [`ThreadStore`] with the limits and windows from the configuration.
pub async fn open_thread_store(config: &AppConfig) -> Result<ThreadStore, StoreError> {
    let backend = open_backend(config).await?;
    Ok(ThreadStore::new(backend)
        .with_ttl_policy(TtlPolicy {
            standard: config.conversation.standard_ttl(),
            extended: config.conversation.extended_ttl(),
        })
        .with_operation_timeout(config.store.operation_timeout())
        .with_max_append_retries(config.store.max_append_retries)
        .with_max_turns(config.conversation.max_turns))
}
