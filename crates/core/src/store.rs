//! ActivationStore trait — append-only persistence of activations and tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::activation::Activation;
use crate::error::StoreError;
use crate::tool::{ToolCall, ToolResult};

/// Storage key: one log per (bot, channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub bot_id: String,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn new(bot_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bot_id, self.channel_id)
    }
}

/// A tool call paired with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub call: ToolCall,
    pub result: ToolResult,
}

/// Append-only activation and tool log.
///
/// Read paths take the set of message IDs present in the current window and
/// return only entries whose associated messages still exist.
#[async_trait]
pub trait ActivationStore: Send + Sync {
    /// Backend name (e.g., "jsonl", "in_memory").
    fn name(&self) -> &str;

    /// Durably append one executed tool call and its result.
    async fn record_tool_call(&self, key: &ChannelKey, record: &ToolRecord)
    -> Result<(), StoreError>;

    /// Append a finished activation.
    async fn record_activation(
        &self,
        key: &ChannelKey,
        activation: &Activation,
    ) -> Result<(), StoreError>;

    /// Tool records whose triggering message is in `live_message_ids`,
    /// oldest first.
    async fn tool_history(
        &self,
        key: &ChannelKey,
        live_message_ids: &HashSet<String>,
    ) -> Result<Vec<ToolRecord>, StoreError>;

    /// Activations with at least one associated message (anchor or sent
    /// message) in `live_message_ids`, oldest first.
    async fn activations(
        &self,
        key: &ChannelKey,
        live_message_ids: &HashSet<String>,
    ) -> Result<Vec<Activation>, StoreError>;
}

/// Whether a tool record is still anchored in the current window.
pub fn tool_record_is_live(record: &ToolRecord, live: &HashSet<String>) -> bool {
    record
        .call
        .triggering_message_id
        .as_ref()
        .is_some_and(|id| live.contains(id))
}

/// Whether an activation still has a message in the current window.
pub fn activation_is_live(activation: &Activation, live: &HashSet<String>) -> bool {
    activation
        .anchor_message_id
        .as_ref()
        .is_some_and(|id| live.contains(id))
        || activation.sent_message_ids().any(|id| live.contains(id))
}
