//! HTTP gateway for threadgate.
//!
//! Makes the continuation engine reachable over JSON for tool-call
//! handlers running in other processes, and runs the background sweeper
//! that purges expired threads and stale offloaded prompts.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use threadgate_config::AppConfig;
use threadgate_engine::ContinuationEngine;

/// Build the full router: `/health` plus the v1 API.
pub fn build_router(api_state: api_v1::SharedApiState) -> Router {
    let max_body_bytes = api_state.config.gateway.max_body_bytes;

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(api_state))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// The thread store is opened once here and shared by every request.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let store = Arc::new(threadgate_store::open_thread_store(&config).await?);
    let engine = Arc::new(ContinuationEngine::from_config(store, &config));

    let sweeper = (config.store.sweep_interval_secs > 0).then(|| {
        spawn_sweeper(
            engine.clone(),
            Duration::from_secs(config.store.sweep_interval_secs),
            config.conversation.extended_ttl(),
        )
    });

    let api_state = Arc::new(api_v1::ApiV1State {
        engine,
        config: config.clone(),
        start_time: chrono::Utc::now(),
    });
    let app = build_router(api_state);

    info!(
        addr = %addr,
        backend = %config.store.backend,
        sweep_interval_secs = config.store.sweep_interval_secs,
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// --- Sweeper ---

/// What one sweep pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub threads: usize,
    pub prompts: usize,
}

/// Remove expired threads, then offloaded prompts older than
/// `prompt_max_age`. Store faults are logged, not propagated.
pub async fn sweep_once(engine: &ContinuationEngine, prompt_max_age: Duration) -> SweepReport {
    let threads = match engine.store().sweep().await {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "Thread sweep failed");
            0
        }
    };
    let prompts = engine.offloader().prune(prompt_max_age).await;
    SweepReport { threads, prompts }
}

/// Run [`sweep_once`] every `every` until the task is aborted.
pub fn spawn_sweeper(
    engine: Arc<ContinuationEngine>,
    every: Duration,
    prompt_max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = sweep_once(&engine, prompt_max_age).await;
            if report != SweepReport::default() {
                info!(threads = report.threads, prompts = report.prompts, "Sweep complete");
            }
        }
    })
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
