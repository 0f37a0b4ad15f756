//! Anthropic native vendor implementation.
//!
//! Uses Anthropic's Messages API directly.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Prefill: the transcript rides in a trailing assistant turn
//! - Chat: native tool use with `tool_use` / `tool_result` content blocks
//! - `cache_control: ephemeral` on the block ending the cached prefix

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parley_core::error::VendorError;
use parley_core::tool::ToolDefinition;
use parley_core::{ContentBlock, LlmCompletion, LlmRequest, StopReason, TransformMode, Usage, Vendor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transform::{WireConversation, WirePart, WireRole, WireTurn, transform};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Stop sequences sent per request; lower-priority ones are dropped.
const MAX_STOP_SEQUENCES: usize = 8;

/// Anthropic native Messages API vendor.
pub struct AnthropicVendor {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl AnthropicVendor {
    /// Create a new Anthropic vendor.
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            models: vec!["claude-*".into()],
            client,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Model patterns this vendor serves.
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Build the JSON body for a request.
    fn build_body(request: &LlmRequest) -> serde_json::Value {
        let conv = transform(request);
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&conv),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        if let Some(system) = &conv.system {
            body["system"] = serde_json::json!(system);
        }

        if request.mode == TransformMode::Chat && !conv.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&conv.tools));
        }

        let stops: Vec<&str> = request
            .stop_sequences
            .iter()
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
            .take(MAX_STOP_SEQUENCES)
            .collect();
        if !stops.is_empty() {
            body["stop_sequences"] = serde_json::json!(stops);
        }

        body
    }

    fn to_api_messages(conv: &WireConversation) -> Vec<AnthropicMessage> {
        conv.turns.iter().map(Self::to_api_message).collect()
    }

    fn to_api_message(turn: &WireTurn) -> AnthropicMessage {
        let content = turn
            .parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                let cache_control = (turn.cache_part == Some(i)).then(CacheControl::ephemeral);
                match part {
                    WirePart::Text(text) => ApiBlock::Text {
                        text: text.clone(),
                        cache_control,
                    },
                    WirePart::Image { media_type, data } => ApiBlock::Image {
                        source: ImageSource {
                            source_type: "base64".into(),
                            media_type: media_type.clone(),
                            data: STANDARD.encode(data),
                        },
                        cache_control,
                    },
                    WirePart::ToolUse { id, name, input } => ApiBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                        cache_control,
                    },
                    WirePart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => ApiBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                        is_error: *is_error,
                        cache_control,
                    },
                }
            })
            .collect();

        AnthropicMessage {
            role: match turn.role {
                WireRole::User => "user".into(),
                WireRole::Assistant => "assistant".into(),
            },
            content,
        }
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    /// Convert an Anthropic API response into a vendor-neutral completion.
    fn to_completion(resp: AnthropicResponse) -> LlmCompletion {
        let mut content = Vec::new();
        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text } => content.push(ContentBlock::Text { text }),
                ResponseContentBlock::ToolUse { id, name, input } => {
                    content.push(ContentBlock::ToolUse { id, name, input })
                }
                ResponseContentBlock::Thinking { thinking } => content.push(ContentBlock::Text {
                    text: format!("<thinking>{thinking}</thinking>\n"),
                }),
                ResponseContentBlock::Other => {}
            }
        }

        let stop_reason = match resp.stop_reason.as_deref() {
            Some("max_tokens") => StopReason::MaxTokens,
            Some("stop_sequence") => StopReason::StopSequence,
            Some("tool_use") => StopReason::ToolUse,
            Some("refusal") => StopReason::Refusal,
            _ => StopReason::EndTurn,
        };

        LlmCompletion {
            content,
            stop_reason,
            stop_sequence: resp.stop_sequence,
            usage: Usage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
                cache_read_tokens: resp.usage.cache_read_input_tokens,
                cache_write_tokens: resp.usage.cache_creation_input_tokens,
            },
            model: resp.model,
        }
    }
}

#[async_trait]
impl Vendor for AnthropicVendor {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_patterns(&self) -> &[String] {
        &self.models
    }

    fn max_stop_sequences(&self, _model: &str) -> Option<usize> {
        Some(MAX_STOP_SEQUENCES)
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, VendorError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::build_body(request);

        debug!(vendor = %self.name, model = %request.model, mode = %request.mode, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VendorError::Timeout(e.to_string())
                } else {
                    VendorError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(VendorError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status == 401 || status == 403 {
            return Err(VendorError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(VendorError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| VendorError::InvalidResponse(format!("Failed to parse Anthropic response: {e}")))?;

        Ok(Self::to_completion(api_resp))
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Clone, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl CacheControl {
    fn ephemeral() -> Self {
        Self { kind: "ephemeral" }
    }
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    stop_sequence: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
}
