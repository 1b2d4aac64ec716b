//! `threadgate config` — Configuration management commands.

use std::path::{Path, PathBuf};

use threadgate_config::AppConfig;

fn config_path() -> PathBuf {
    AppConfig::config_dir().join("config.toml")
}

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path();
    if write_default(&path, force)? {
        println!("Wrote default configuration to {}", path.display());
    } else {
        println!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    Ok(())
}

/// Write the default config to `path`. Returns `false` if a file was
/// already there and `force` is not set.
fn write_default(path: &Path, force: bool) -> Result<bool, Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path().display());
    Ok(())
}
