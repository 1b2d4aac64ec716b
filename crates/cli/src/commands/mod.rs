pub mod config_cmd;
pub mod serve;
pub mod show;
pub mod status;
pub mod sweep;

use std::sync::Arc;

use threadgate_config::AppConfig;
use threadgate_engine::ContinuationEngine;

/// Open the configured store directly, outside the gateway.
///
/// Only meaningful for persistent backends; the memory backend starts empty.
pub async fn open_engine(config: &AppConfig) -> Result<ContinuationEngine, Box<dyn std::error::Error>> {
    if config.store.backend == "memory" {
        println!("   Note: the memory backend is process-local; this process sees an empty store.");
    }
    tracing::debug!(backend = %config.store.backend, "Opening thread store");
    let store = threadgate_store::open_thread_store(config).await?;
    Ok(ContinuationEngine::from_config(Arc::new(store), config))
}
