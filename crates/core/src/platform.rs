//! Platform trait — the abstraction over chat platforms.
//!
//! A Platform connects Parley to a messaging service (Discord, a local
//! terminal, a test double). The core only ever talks to it through this
//! narrow contract: fetch recent history, send, delete, typing, webhooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

/// A raw message as the platform reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Platform message ID
    pub id: String,

    /// The chat channel this message lives in
    pub channel_id: String,

    /// Author's platform user ID
    pub author_id: String,

    /// Author's display name
    pub author_name: String,

    /// The text content
    pub content: String,

    pub timestamp: DateTime<Utc>,

    /// ID of the message this one replies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// User IDs mentioned in this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,

    /// Reaction emoji currently attached to the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<String>,

    /// Attachment metadata (image bytes arrive separately, see [`FetchedImage`])
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatMessage {
    /// Build a plain text message (tests, local platforms).
    pub fn new(
        id: impl Into<String>,
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            author_name: author_name.into(),
            content: content.into(),
            timestamp: Utc::now(),
            reply_to: None,
            mentions: Vec::new(),
            reactions: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|m| m == user_id)
    }
}

/// An attachment on a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,

    pub filename: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Image bytes downloaded alongside a history fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    /// The message the image is attached to
    pub message_id: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Parameters for a history fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    /// Maximum number of messages to return (most recent first on the wire,
    /// chronological in the result).
    pub depth: usize,

    /// If set, the fetch extends back to this message (up to twice `depth`)
    /// so the window start stays stable between activations.
    pub oldest_anchor: Option<String>,

    /// Messages to leave out of the result (e.g. a command being deleted).
    pub exclude: Vec<String>,
}

/// Result of a history fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchedContext {
    /// Messages in chronological order (oldest first).
    pub messages: Vec<ChatMessage>,

    /// Downloaded image attachments.
    pub images: Vec<FetchedImage>,

    /// Raw config fragments pinned in the channel, in pin order.
    pub pinned_config: Vec<String>,

    pub guild_id: Option<String>,
}

impl FetchedContext {
    /// IDs of every message present in this window.
    pub fn message_ids(&self) -> std::collections::HashSet<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }
}

/// The core Platform trait.
///
/// Implementations own connection handling, message splitting and rate
/// limiting; the pipeline treats every method as a fallible I/O call.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Human-readable platform name (e.g., "discord", "local").
    fn name(&self) -> &str;

    /// Fetch bounded recent history for a channel.
    async fn fetch_context(
        &self,
        channel_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedContext, PlatformError>;

    /// Send a message. Text exceeding the platform limit is split; the
    /// returned IDs are in send order.
    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Vec<String>, PlatformError>;

    /// Upload a text file attachment with an optional caption.
    async fn send_attachment(
        &self,
        channel_id: &str,
        filename: &str,
        content: &[u8],
        caption: Option<&str>,
    ) -> Result<Vec<String>, PlatformError>;

    async fn delete_message(&self, channel_id: &str, message_id: &str)
    -> Result<(), PlatformError>;

    /// Begin showing a typing indicator.
    async fn start_typing(&self, _channel_id: &str) -> Result<(), PlatformError> {
        Ok(()) // No-op default
    }

    async fn stop_typing(&self, _channel_id: &str) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Post under a custom display name.
    async fn send_webhook(
        &self,
        channel_id: &str,
        text: &str,
        display_name: &str,
    ) -> Result<Vec<String>, PlatformError>;
}
