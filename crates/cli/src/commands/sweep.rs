//! `threadgate sweep` — One expiry pass against the configured store.

use threadgate_config::AppConfig;

use super::open_engine;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let engine = open_engine(&config).await?;

    let report =
        threadgate_gateway::sweep_once(&engine, config.conversation.extended_ttl()).await;

    println!("Sweep complete");
    println!("   Expired threads removed:   {}", report.threads);
    println!("   Offloaded prompts removed: {}", report.prompts);
    Ok(())
}
