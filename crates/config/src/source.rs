//! Where the per-channel base configuration comes from.

use async_trait::async_trait;

use crate::{BotConfig, ConfigError};

/// Supplies the base configuration for a channel.
///
/// The pipeline calls this lazily, at most once per event batch.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self, channel_id: &str, guild_id: Option<&str>)
    -> Result<BotConfig, ConfigError>;
}

/// One config for every channel.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    config: BotConfig,
}

impl StaticConfigSource {
    pub fn new(config: BotConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(
        &self,
        _channel_id: &str,
        _guild_id: Option<&str>,
    ) -> Result<BotConfig, ConfigError> {
        Ok(self.config.clone())
    }
}
