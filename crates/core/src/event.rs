//! Inbound events — everything the activation pipeline reacts to.
//!
//! Events are produced by the platform connector (messages, edits, deletes,
//! reactions) or internally (timers, self-activation), queued once and
//! consumed once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::ChatMessage;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    MessageCreated { message: ChatMessage },
    MessageEdited { message: ChatMessage },
    MessageDeleted { message_id: String },
    ReactionAdded {
        message_id: String,
        emoji: String,
        user_id: String,
    },
    /// A scheduled wake-up for a channel.
    Timer { name: String },
    /// The bot asked to act again in a channel.
    SelfActivation { reason: String },
}

/// Coarse split used when batching: bursts never mix categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Platform,
    Internal,
}

/// An inbound event. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, channel_id: impl Into<String>) -> Self {
        Self {
            kind,
            channel_id: channel_id.into(),
            guild_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for a newly created message.
    pub fn message(message: ChatMessage) -> Self {
        let channel_id = message.channel_id.clone();
        Self::new(EventKind::MessageCreated { message }, channel_id)
    }

    pub fn with_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }

    pub fn category(&self) -> EventCategory {
        match self.kind {
            EventKind::MessageCreated { .. }
            | EventKind::MessageEdited { .. }
            | EventKind::MessageDeleted { .. }
            | EventKind::ReactionAdded { .. } => EventCategory::Platform,
            EventKind::Timer { .. } | EventKind::SelfActivation { .. } => EventCategory::Internal,
        }
    }

    /// The new message carried by this event, if it is a message creation.
    pub fn new_message(&self) -> Option<&ChatMessage> {
        match &self.kind {
            EventKind::MessageCreated { message } => Some(message),
            _ => None,
        }
    }
}
