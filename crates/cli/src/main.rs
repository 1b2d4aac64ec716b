//! threadgate CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP gateway and expiry sweeper
//! - `status`  — Show configuration and store status
//! - `show`    — Print one stored thread
//! - `sweep`   — Run one expiry pass against the configured store
//! - `config`  — Write, print or locate the configuration file

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "threadgate",
    about = "threadgate — conversation continuation for AI tool calls",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show configuration and store status
    Status,

    /// Print a stored thread
    Show {
        /// Continuation id
        id: String,

        /// Print the raw JSON record
        #[arg(long, conflicts_with = "history")]
        json: bool,

        /// Print the rendered history block a tool would receive
        #[arg(long)]
        history: bool,
    },

    /// Remove expired threads and stale offloaded prompts
    Sweep,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Status => commands::status::run().await?,
        Commands::Show { id, json, history } => commands::show::run(&id, json, history).await?,
        Commands::Sweep => commands::sweep::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
