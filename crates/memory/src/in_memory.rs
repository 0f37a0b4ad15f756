//! In-memory store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use parley_core::error::StoreError;
use parley_core::store::{activation_is_live, tool_record_is_live};
use parley_core::{Activation, ActivationStore, ChannelKey, ToolRecord};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct ChannelLog {
    tools: Vec<ToolRecord>,
    activations: Vec<Activation>,
}

/// A store that keeps every log in memory for the life of the process.
#[derive(Default)]
pub struct InMemoryStore {
    logs: RwLock<HashMap<ChannelKey, ChannelLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tool record for a key, live or not.
    pub async fn all_tool_records(&self, key: &ChannelKey) -> Vec<ToolRecord> {
        self.logs
            .read()
            .await
            .get(key)
            .map(|l| l.tools.clone())
            .unwrap_or_default()
    }

    /// Every activation for a key, live or not.
    pub async fn all_activations(&self, key: &ChannelKey) -> Vec<Activation> {
        self.logs
            .read()
            .await
            .get(key)
            .map(|l| l.activations.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActivationStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn record_tool_call(&self, key: &ChannelKey, record: &ToolRecord) -> Result<(), StoreError> {
        self.logs
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .tools
            .push(record.clone());
        Ok(())
    }

    async fn record_activation(&self, key: &ChannelKey, activation: &Activation) -> Result<(), StoreError> {
        self.logs
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .activations
            .push(activation.clone());
        Ok(())
    }

    async fn tool_history(
        &self,
        key: &ChannelKey,
        live_message_ids: &HashSet<String>,
    ) -> Result<Vec<ToolRecord>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(key)
            .map(|l| {
                l.tools
                    .iter()
                    .filter(|r| tool_record_is_live(r, live_message_ids))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn activations(
        &self,
        key: &ChannelKey,
        live_message_ids: &HashSet<String>,
    ) -> Result<Vec<Activation>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(key)
            .map(|l| {
                l.activations
                    .iter()
                    .filter(|a| activation_is_live(a, live_message_ids))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
