//! Normalized conversation types.
//!
//! A [`ParticipantMessage`] is the unit the Context Builder produces and the
//! Request Transformation layer consumes: one author, an ordered list of
//! [`ContentBlock`]s, and the platform message it came from (if any).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },

    /// An image, already sized to fit the per-image cap.
    Image {
        media_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// A tool invocation issued by the model.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The outcome of a tool invocation.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Characters this block contributes to the text payload.
    ///
    /// Images contribute nothing; their bytes are budgeted separately.
    pub fn payload_chars(&self) -> usize {
        match self {
            Self::Text { text } => text.chars().count(),
            Self::Image { .. } => 0,
            Self::ToolUse { name, input, .. } => {
                // Rendered as `<name>{json}</name>` in continuation mode.
                name.chars().count() * 2 + 5 + input.to_string().chars().count()
            }
            Self::ToolResult { content, .. } => content.chars().count(),
        }
    }
}

/// A normalized conversation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantMessage {
    /// Display name of the author ("System" for tool results).
    pub participant: String,

    /// Ordered content.
    pub content: Vec<ContentBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// The platform message this was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,

    /// Set on exactly one message: the end of the cacheable prefix.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_marker: bool,
}

impl ParticipantMessage {
    /// Create a message with a single text block.
    pub fn text(participant: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(participant, vec![ContentBlock::text(text)])
    }

    pub fn new(participant: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            participant: participant.into(),
            content,
            timestamp: None,
            source_message_id: None,
            cache_marker: false,
        }
    }

    /// Attach the originating platform message id.
    pub fn with_source(mut self, message_id: impl Into<String>) -> Self {
        self.source_message_id = Some(message_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Concatenated text blocks, newline separated.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Append text, extending the trailing text block if there is one.
    pub fn push_text(&mut self, separator: &str, text: &str) {
        if let Some(ContentBlock::Text { text: last }) = self.content.last_mut() {
            if !last.is_empty() {
                last.push_str(separator);
            }
            last.push_str(text);
        } else {
            self.content.push(ContentBlock::text(text));
        }
    }

    /// Total text payload in characters (text, tool input, tool output).
    pub fn payload_chars(&self) -> usize {
        self.content.iter().map(ContentBlock::payload_chars).sum()
    }

    pub fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::Image { .. }))
    }

    /// Total image bytes carried by this message.
    pub fn image_bytes(&self) -> usize {
        self.content
            .iter()
            .map(|b| match b {
                ContentBlock::Image { data, .. } => data.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// Serialize binary payloads as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_has_single_block() {
        let msg = ParticipantMessage::text("alice", "hello");
        assert_eq!(msg.participant, "alice");
        assert_eq!(msg.text_content(), "hello");
        assert_eq!(msg.payload_chars(), 5);
        assert!(!msg.has_images());
    }

    #[test]
    fn push_text_extends_trailing_block() {
        let mut msg = ParticipantMessage::text("bot", "first");
        msg.push_text("\n", "second");
        assert_eq!(msg.content.len(), 1);
        assert_eq!(msg.text_content(), "first\nsecond");
    }

    #[test]
    fn push_text_after_image_opens_new_block() {
        let mut msg = ParticipantMessage::new(
            "alice",
            vec![ContentBlock::Image {
                media_type: "image/png".into(),
                data: vec![1, 2, 3],
            }],
        );
        msg.push_text("\n", "caption");
        assert_eq!(msg.content.len(), 2);
        assert_eq!(msg.image_bytes(), 3);
        assert_eq!(msg.payload_chars(), 7);
    }

    #[test]
    fn payload_counts_characters_not_bytes() {
        let msg = ParticipantMessage::text("alice", "héllo");
        assert_eq!(msg.payload_chars(), 5);
    }

    #[test]
    fn tool_result_counts_toward_payload() {
        let msg = ParticipantMessage::new(
            "System",
            vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "0123456789".into(),
                is_error: false,
            }],
        );
        assert_eq!(msg.payload_chars(), 10);
    }

    #[test]
    fn image_block_serializes_as_base64() {
        let block = ContentBlock::Image {
            media_type: "image/png".into(),
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["data"], "3q2+7w==");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }
}
