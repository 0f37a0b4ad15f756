//! `parley chat` — Run the full pipeline against a terminal-backed channel.
//!
//! Every line typed becomes a message in a local channel. Address the bot
//! with `@<name>` or the command prefix (`!<name> …`); anything else only
//! gets an answer through the random trigger.

use parley_agent::Pipeline;
use parley_channels::LocalPlatform;
use parley_config::BotConfig;
use parley_core::{ChatMessage, Event};
use parley_memory::JsonlStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const CHANNEL_ID: &str = "terminal";
const BOT_ID: &str = "parley-bot";
const USER_ID: &str = "terminal-user";

pub async fn run(config_path: Option<PathBuf>, user: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => BotConfig::load_from(&path),
        None => BotConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;

    let vendor = parley_providers::build_from_config(&config)
        .map_err(|e| format!("Failed to build vendors: {e}"))?;
    let platform = Arc::new(LocalPlatform::new(BOT_ID, &config.name).with_echo(true));
    let store_path = JsonlStore::default_path();
    info!(path = %store_path.display(), "Using activation store");
    let store = Arc::new(JsonlStore::new(store_path));

    let pipeline = Pipeline::new(BOT_ID, config.clone(), platform.clone(), Arc::new(vendor), store)
        .with_tools(parley_tools::default_registry());
    let queue = pipeline.queue();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = tokio::spawn(pipeline.run(shutdown_rx));

    println!();
    println!("  Parley — {} ({}, {} mode)", config.name, config.model, config.mode);
    println!("  Mention @{} or start with {}{} to get a reply.", config.name, config.activation.command_prefix, config.name);
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if matches!(line.as_str(), "exit" | "quit" | "/exit" | "/quit") {
            break;
        }

        queue.push(Event::message(typed(&platform, &config.name, &user, &line)));
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    runner.await?;
    Ok(())
}

/// Store a typed line in the terminal channel, mentioning the bot when the
/// line contains `@<name>`.
fn typed(platform: &LocalPlatform, bot_name: &str, user: &str, line: &str) -> ChatMessage {
    let mentions = if line.contains(&format!("@{bot_name}")) {
        vec![BOT_ID.to_string()]
    } else {
        Vec::new()
    };
    platform.post_mentioning(CHANNEL_ID, USER_ID, user, line, mentions)
}
