//! Turning model output into chat messages.

use parley_config::BotConfig;
use parley_core::error::PlatformError;
use parley_core::{Platform, ToolCall, ToolResult};
use parley_providers::transform::THINKING_OPEN;
use tracing::debug;

const THINKING_CLOSE: &str = "</thinking>";

/// Filename used when reasoning is too long for a side message.
pub const THINKING_ATTACHMENT: &str = "thinking.txt";

/// Split model text into the visible reply and its reasoning.
///
/// Every `<thinking>…</thinking>` block goes to the reasoning side; an
/// unclosed block swallows the rest of the text.
pub fn split_thinking(text: &str) -> (String, String) {
    let mut visible = String::new();
    let mut thinking: Vec<&str> = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(THINKING_OPEN) {
        visible.push_str(&rest[..open]);
        let inner = &rest[open + THINKING_OPEN.len()..];
        match inner.find(THINKING_CLOSE) {
            Some(close) => {
                thinking.push(inner[..close].trim());
                rest = &inner[close + THINKING_CLOSE.len()..];
            }
            None => {
                thinking.push(inner.trim());
                rest = "";
            }
        }
    }
    visible.push_str(rest);

    let thinking = thinking
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    (visible, thinking)
}

/// Send one completion's visible text, and its reasoning when configured.
///
/// Returns the IDs of the visible messages; empty when there was nothing to
/// show (a phantom completion).
pub async fn deliver(
    platform: &dyn Platform,
    config: &BotConfig,
    channel_id: &str,
    text: &str,
    reply_to: Option<&str>,
) -> Result<Vec<String>, PlatformError> {
    let (visible, thinking) = split_thinking(text);

    if config.thinking.show && !thinking.is_empty() {
        let hidden = &config.context.hidden_prefix;
        if thinking.chars().count() <= config.thinking.attachment_threshold {
            platform
                .send_message(channel_id, &format!("{hidden}💭 {thinking}"), None)
                .await?;
        } else {
            platform
                .send_attachment(
                    channel_id,
                    THINKING_ATTACHMENT,
                    thinking.as_bytes(),
                    Some(&format!("{hidden}💭")),
                )
                .await?;
        }
    }

    let visible = visible.trim();
    if visible.is_empty() {
        debug!(channel_id, "Completion has no visible text");
        return Ok(Vec::new());
    }
    platform.send_message(channel_id, visible, reply_to).await
}

/// Post a hidden copy of a tool call and its outcome.
pub async fn mirror_tool_call(
    platform: &dyn Platform,
    config: &BotConfig,
    channel_id: &str,
    call: &ToolCall,
    result: &ToolResult,
) -> Result<(), PlatformError> {
    let text = format!(
        "{}{} {} → {}",
        config.context.hidden_prefix,
        call.name,
        call.input,
        result.display_text()
    );
    platform
        .send_webhook(channel_id, &text, &format!("{} tools", config.name))
        .await?;
    Ok(())
}
