//! `parley config` — Print or validate configuration.

use parley_config::BotConfig;
use std::path::PathBuf;

pub async fn run(check: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = check else {
        print!("{}", BotConfig::default_toml());
        return Ok(());
    };

    println!("🔍 Validating {}...", path.display());
    if !path.exists() {
        return Err(format!("{} does not exist", path.display()).into());
    }

    match BotConfig::load_from(&path) {
        Ok(config) => {
            println!("   ✅ Config parsed and validated");

            let mut warnings = Vec::new();
            if config.api_key.is_none() && config.vendors.values().all(|v| v.api_key.is_none()) {
                warnings.push("No API key set (set PARLEY_API_KEY or vendors.<name>.api_key)");
            }
            if config.activation.command_prefix.is_empty() {
                warnings.push("Empty command_prefix disables commands");
            }
            for w in &warnings {
                println!("   ⚠️  {w}");
            }

            println!();
            println!("   Name:      {}", config.name);
            println!("   Model:     {}", config.model);
            println!("   Mode:      {}", config.mode);
            println!(
                "   Window:    {} messages / {} chars (hard max {})",
                config.context.recency_window_messages,
                config.context.recency_window_characters,
                config.context.hard_max_characters
            );
            println!(
                "   Tools:     {} (max depth {})",
                if config.tools.enabled { "enabled" } else { "disabled" },
                config.tools.max_tool_depth
            );
            println!("   Vendors:   {}", config.vendors.len());
            Ok(())
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            Err(e.into())
        }
    }
}
