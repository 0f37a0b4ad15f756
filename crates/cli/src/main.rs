//! Parley CLI — the main entry point.
//!
//! Commands:
//! - `config` — Print the default configuration, or check a config file
//! - `chat`   — Talk to the bot in the terminal through the full pipeline

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley — a chat-platform LLM agent runtime",
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
    /// Print the default config, or validate a config file
    Config {
        /// Config file to validate
        #[arg(long)]
        check: Option<PathBuf>,
    },

    /// Chat with the bot in this terminal
    Chat {
        /// Config file (defaults to ~/.parley/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Your display name in the conversation
        #[arg(long, default_value = "you")]
        user: String,
    },
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
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { check } => commands::config_cmd::run(check).await?,
        Commands::Chat { config, user } => commands::chat::run(config, user).await?,
    }

    Ok(())
}
