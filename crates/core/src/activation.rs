//! Activation records — one per response cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What caused the bot to respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Command,
    Mention,
    Reply,
    Random,
    /// Timer or self-activation.
    Internal,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Command => "command",
            Self::Mention => "mention",
            Self::Reply => "reply",
            Self::Random => "random",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// One model turn inside an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Position within the activation (strictly increasing).
    pub index: usize,

    /// Full model text, reasoning and tool tags included.
    pub text: String,

    /// Platform messages this completion became. Empty for a phantom.
    #[serde(default)]
    pub sent_message_ids: Vec<String>,
}

impl Completion {
    /// A completion that produced no visible chat message.
    pub fn is_phantom(&self) -> bool {
        self.sent_message_ids.is_empty()
    }
}

/// A complete response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub id: String,
    pub channel_id: String,
    pub bot_id: String,
    pub trigger: TriggerKind,

    /// The message the activation responded to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_message_id: Option<String>,

    /// Ordered model turns.
    #[serde(default)]
    pub completions: Vec<Completion>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Activation {
    pub fn new(
        channel_id: impl Into<String>,
        bot_id: impl Into<String>,
        trigger: TriggerKind,
        anchor_message_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            bot_id: bot_id.into(),
            trigger,
            anchor_message_id,
            completions: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Append the next completion, keeping indices strictly ordered.
    pub fn push_completion(&mut self, text: impl Into<String>, sent_message_ids: Vec<String>) {
        let index = self.completions.len();
        self.completions.push(Completion {
            index,
            text: text.into(),
            sent_message_ids,
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Full context chunk per sent message: the first message a completion
    /// was split into carries the whole text; the rest map to empty chunks.
    pub fn message_contexts(&self) -> HashMap<String, String> {
        let mut contexts = HashMap::new();
        for completion in &self.completions {
            let mut ids = completion.sent_message_ids.iter();
            if let Some(first) = ids.next() {
                contexts.insert(first.clone(), completion.text.clone());
            }
            for rest in ids {
                contexts.insert(rest.clone(), String::new());
            }
        }
        contexts
    }

    /// Every platform message this activation produced.
    pub fn sent_message_ids(&self) -> impl Iterator<Item = &str> {
        self.completions
            .iter()
            .flat_map(|c| c.sent_message_ids.iter().map(String::as_str))
    }
}
