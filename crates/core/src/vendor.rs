//! Vendor trait — the abstraction over LLM backends.
//!
//! A Vendor knows how to turn a vendor-neutral [`LlmRequest`] into its own
//! wire format, send it, and map the answer back into an [`LlmCompletion`].
//!
//! Implementations: Anthropic Messages, OpenAI-compatible endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VendorError;
use crate::message::ContentBlock;
use crate::message::ParticipantMessage;
use crate::tool::ToolDefinition;

/// How the conversation is laid out on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// One growing "Participant: text" transcript the model continues.
    #[default]
    Prefill,
    /// Role-based user/assistant turns.
    Chat,
}

impl std::fmt::Display for TransformMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prefill => write!(f, "prefill"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// A vendor-neutral completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Model name; also used to pick the vendor.
    pub model: String,

    /// The bounded conversation, oldest first.
    pub messages: Vec<ParticipantMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// The bot's display name (its turns become assistant turns).
    pub bot_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Stop sequences in priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    pub max_tokens: u32,

    pub temperature: f32,

    #[serde(default)]
    pub mode: TransformMode,

    /// Seed the completion with an opening reasoning tag (prefill only).
    #[serde(default)]
    pub prefill_thinking: bool,

    /// Text the model already produced in this turn; a re-issued request
    /// resumes after it (prefill only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub continuation: String,

    /// Extra instruction appended in chat mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_priming: Option<String>,

    /// End chat-mode requests with a "respond as <bot>:" user primer.
    #[serde(default)]
    pub respond_as_primer: bool,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, bot_name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            system_prompt: None,
            bot_name: bot_name.into(),
            tools: Vec::new(),
            stop_sequences: Vec::new(),
            max_tokens: 1024,
            temperature: 1.0,
            mode: TransformMode::Prefill,
            prefill_thinking: false,
            continuation: String::new(),
            persona_priming: None,
            respond_as_primer: false,
        }
    }

    pub fn with_messages(mut self, messages: Vec<ParticipantMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_mode(mut self, mode: TransformMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Index of the message carrying the cache marker, if any.
    pub fn cache_marker_index(&self) -> Option<usize> {
        self.messages.iter().position(|m| m.cache_marker)
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Refusal,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

/// A vendor-neutral completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,

    /// The stop sequence that ended generation, when `stop_reason` is
    /// [`StopReason::StopSequence`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,

    #[serde(default)]
    pub usage: Usage,

    /// Which model actually responded.
    pub model: String,
}

impl LlmCompletion {
    /// A plain text completion that ended its turn normally.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            stop_sequence: None,
            usage: Usage::default(),
            model: String::new(),
        }
    }

    /// Concatenated text blocks.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>()
    }

    /// Vendor-native tool invocations, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// The core Vendor trait.
///
/// Each vendor (Anthropic, OpenAI-compatible, ...) implements this.
/// The router picks one by matching the request's model against
/// [`Vendor::model_patterns`].
#[async_trait]
pub trait Vendor: Send + Sync {
    /// Human-readable vendor name (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Glob patterns of model names this vendor serves (e.g. `claude-*`).
    fn model_patterns(&self) -> &[String];

    /// Whether continuation-style requests are supported.
    fn supports_prefill(&self) -> bool {
        true
    }

    /// Maximum number of stop sequences accepted for `model`, if capped.
    fn max_stop_sequences(&self, _model: &str) -> Option<usize> {
        None
    }

    /// Send a request and wait for the full completion.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, VendorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_defaults() {
        let req = LlmRequest::new("claude-sonnet-4", "Parley")
            .with_messages(vec![ParticipantMessage::text("alice", "hi")]);
        assert_eq!(req.mode, TransformMode::Prefill);
        assert_eq!(req.messages.len(), 1);
        assert!(req.cache_marker_index().is_none());
    }

    #[test]
    fn stop_reason_wire_names() {
        let json = serde_json::to_string(&StopReason::StopSequence).unwrap();
        assert_eq!(json, "\"stop_sequence\"");
        let back: StopReason = serde_json::from_str("\"tool_use\"").unwrap();
        assert_eq!(back, StopReason::ToolUse);
    }

    #[test]
    fn completion_collects_tool_uses() {
        let completion = LlmCompletion {
            content: vec![
                ContentBlock::text("let me check"),
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read".into(),
                    input: serde_json::json!({"path": "a"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            stop_sequence: None,
            usage: Usage::default(),
            model: "m".into(),
        };
        assert_eq!(completion.text_content(), "let me check");
        let uses = completion.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "read");
    }

    #[test]
    fn mode_displays_lowercase() {
        assert_eq!(TransformMode::Chat.to_string(), "chat");
        assert_eq!(TransformMode::Prefill.to_string(), "prefill");
    }
}
