//! The tool loop — model calls tools, sees results, calls the model again.
//!
//! Each round:
//!
//! 1. **Complete** the request, re-issuing as a continuation while a stop
//!    sequence cut a tool or reasoning tag in half
//! 2. **Extract** tool calls (vendor-native first, then free-text tags)
//! 3. **Execute** them, persisting every record before it is used
//! 4. **Append** the bot turn and the results, and go again
//!
//! The loop ends on a completion with no tool calls, or when the depth cap
//! is reached.

use parley_config::BotConfig;
use parley_core::{
    Activation, ActivationStore, ChannelKey, ContentBlock, LlmCompletion, LlmRequest,
    ParticipantMessage, Platform, StopReason, ToolCall, ToolRecord, ToolRegistry, TransformMode,
    Vendor,
};
use parley_providers::transform::THINKING_OPEN;
use tracing::{debug, info, warn};

use crate::context::SYSTEM_PARTICIPANT;
use crate::deliver::{deliver, mirror_tool_call, split_thinking};
use crate::state::ChannelState;
use crate::tool_parse::{parse_invocations, preamble, unclosed_tag};

/// Final reply when the depth cap hits a turn with nothing else to say.
pub const TOOL_LIMIT_NOTICE: &str = "[tool call limit reached]";

/// How a tool loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Text of the final completion, to be delivered by the caller.
    pub final_text: String,
    /// Tool execution rounds performed.
    pub depth: usize,
    pub cap_reached: bool,
}

/// Collaborators for one activation's tool loop.
pub struct ToolLoop<'a> {
    pub vendor: &'a dyn Vendor,
    pub platform: &'a dyn Platform,
    pub tools: &'a ToolRegistry,
    pub store: &'a dyn ActivationStore,
    pub config: &'a BotConfig,
    pub key: &'a ChannelKey,
    /// The message the activation answers; tool calls are attributed to it.
    pub trigger_message_id: Option<&'a str>,
}

impl ToolLoop<'_> {
    pub async fn run(
        &self,
        request: &mut LlmRequest,
        activation: &mut Activation,
        state: &mut ChannelState,
    ) -> parley_core::Result<LoopOutcome> {
        let max_depth = self.config.tools.max_tool_depth;
        let mut depth = 0;

        loop {
            let (text, completion) = self.complete(request).await?;
            let (calls, narrative) = self.extract_calls(request.mode, &text, &completion);

            if calls.is_empty() {
                return Ok(LoopOutcome {
                    final_text: text,
                    depth,
                    cap_reached: false,
                });
            }

            if depth >= max_depth {
                warn!(
                    channel_id = %self.key.channel_id,
                    depth,
                    "Tool depth limit reached, ending activation"
                );
                let final_text = if split_thinking(&narrative).0.trim().is_empty() {
                    TOOL_LIMIT_NOTICE.to_string()
                } else {
                    narrative
                };
                return Ok(LoopOutcome {
                    final_text,
                    depth,
                    cap_reached: true,
                });
            }
            depth += 1;
            debug!(depth, calls = calls.len(), "Executing tool calls");

            let sent = if self.config.tools.show_preamble {
                deliver(
                    self.platform,
                    self.config,
                    &self.key.channel_id,
                    &narrative,
                    self.trigger_message_id,
                )
                .await?
            } else {
                Vec::new()
            };
            activation.push_completion(text.clone(), sent);

            let mut results = Vec::with_capacity(calls.len());
            for mut call in calls {
                call.triggering_message_id = self.trigger_message_id.map(str::to_string);
                call.raw_model_text = text.clone();

                let result = self.tools.execute(&call).await;
                info!(tool = %call.name, error = result.is_error(), "Tool executed");

                let record = ToolRecord { call, result };
                self.store.record_tool_call(self.key, &record).await?;
                if self.config.tools.mirror_tool_calls {
                    mirror_tool_call(
                        self.platform,
                        self.config,
                        &self.key.channel_id,
                        &record.call,
                        &record.result,
                    )
                    .await?;
                }
                state.tool_cache.push(record.clone());
                results.push(record);
            }

            append_round(request, &text, &completion, &results);
            request.continuation.clear();
        }
    }

    /// One completion, continued while a stop sequence interrupted an open
    /// tag. Returns the full text produced, reasoning seed included.
    async fn complete(&self, request: &mut LlmRequest) -> parley_core::Result<(String, LlmCompletion)> {
        let transcript = request.mode == TransformMode::Prefill;
        let mut produced = if transcript && request.prefill_thinking {
            THINKING_OPEN.to_string()
        } else {
            String::new()
        };

        let mut completion = self.vendor.complete(request).await?;
        produced.push_str(&completion.text_content());

        let mut rounds = 0;
        while transcript
            && completion.stop_reason == StopReason::StopSequence
            && rounds < self.config.tools.max_continuations
        {
            let Some(tag) = unclosed_tag(&produced, |n| self.tools.contains(n)) else {
                break;
            };
            rounds += 1;
            debug!(tag, round = rounds, "Stop sequence inside open tag, continuing");

            produced.push_str(completion.stop_sequence.as_deref().unwrap_or_default());
            request.continuation = format!(" {produced}");
            completion = self.vendor.complete(request).await?;
            produced.push_str(&completion.text_content());
        }
        request.continuation.clear();

        Ok((produced, completion))
    }

    /// Tool calls in a completion plus the text that came before them.
    fn extract_calls(
        &self,
        mode: TransformMode,
        text: &str,
        completion: &LlmCompletion,
    ) -> (Vec<ToolCall>, String) {
        if !self.config.tools.enabled {
            return (Vec::new(), text.to_string());
        }

        let native: Vec<ToolCall> = completion
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| ToolCall::new(id, name, input.clone()))
            .collect();
        if !native.is_empty() || mode != TransformMode::Prefill {
            return (native, text.to_string());
        }

        let invocations = parse_invocations(text, |n| self.tools.contains(n));
        let narrative = preamble(text, &invocations).to_string();
        let calls = invocations
            .into_iter()
            .map(|inv| ToolCall::new(format!("call_{}", uuid::Uuid::new_v4().simple()), inv.name, inv.input))
            .collect();
        (calls, narrative)
    }
}

/// Append the bot turn verbatim and one system turn per result.
fn append_round(
    request: &mut LlmRequest,
    text: &str,
    completion: &LlmCompletion,
    results: &[ToolRecord],
) {
    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    if request.mode == TransformMode::Chat || !completion.tool_uses().is_empty() {
        content.extend(results.iter().map(|r| ContentBlock::ToolUse {
            id: r.call.id.clone(),
            name: r.call.name.clone(),
            input: r.call.input.clone(),
        }));
    }
    request
        .messages
        .push(ParticipantMessage::new(request.bot_name.clone(), content));

    for record in results {
        request.messages.push(ParticipantMessage::new(
            SYSTEM_PARTICIPANT,
            vec![ContentBlock::ToolResult {
                tool_use_id: record.call.id.clone(),
                content: record
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| record.result.output.clone()),
                is_error: record.result.is_error(),
            }],
        ));
    }
}
