//! `threadgate status` — Show configuration and store status.

use threadgate_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    println!("threadgate status");
    println!("=================");
    println!("  Config dir:     {}", AppConfig::config_dir().display());
    println!("  Store:          {}", config.store.backend);
    if config.store.backend == "sqlite" {
        println!("  SQLite path:    {}", config.store.sqlite_path().display());
    }
    println!("  Max turns:      {}", config.conversation.max_turns);
    println!(
        "  TTL windows:    {}h standard / {}h extended",
        config.conversation.standard_ttl_hours, config.conversation.extended_ttl_hours
    );
    println!("  Token ceiling:  {}", config.budget.default_token_ceiling);
    println!(
        "  Offload:        > {} bytes → {}",
        config.offload.threshold_bytes,
        config.offload.dir().display()
    );
    println!("  Gateway:        {}:{}", config.gateway.host, config.gateway.port);

    if config.store.backend != "memory" {
        match threadgate_store::open_thread_store(&config).await {
            Ok(store) => match store.count().await {
                Ok(count) => println!("  Live threads:   {count}"),
                Err(e) => println!("  Live threads:   unavailable ({e})"),
            },
            Err(e) => println!("  Live threads:   unavailable ({e})"),
        }
    }

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  Config file found");
    } else {
        println!("\n  No config file — run `threadgate config init` to create one");
    }

    Ok(())
}
