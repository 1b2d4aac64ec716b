//! `threadgate serve` — Start the HTTP gateway.

use threadgate_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("threadgate gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {}", config.store.backend);
    println!(
        "   TTL:       {}h standard, {}h extended",
        config.conversation.standard_ttl_hours, config.conversation.extended_ttl_hours
    );

    threadgate_gateway::start(config).await?;

    Ok(())
}
