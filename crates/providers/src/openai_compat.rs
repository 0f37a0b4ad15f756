//! OpenAI-compatible vendor implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Groq, and any
//! OpenAI-compatible endpoint.
//!
//! - Chat mode: `/chat/completions` with native function calling and
//!   data-URL images
//! - Prefill mode: the flattened transcript is sent as a plain prompt to
//!   `/completions`; images are omitted

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parley_core::error::VendorError;
use parley_core::tool::ToolDefinition;
use parley_core::{ContentBlock, LlmCompletion, LlmRequest, StopReason, TransformMode, Usage, Vendor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transform::{WireConversation, WirePart, WireRole, transform};

/// OpenAI rejects more than four stop sequences.
const MAX_STOP_SEQUENCES: usize = 4;

/// An OpenAI-compatible LLM vendor.
pub struct OpenAiCompatVendor {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiCompatVendor {
    /// Create a new OpenAI-compatible vendor.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            models: Vec::new(),
            client,
        }
    }

    /// Create an OpenRouter vendor (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI vendor (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
            .with_models(vec!["gpt-*".into(), "o?-*".into()])
    }

    /// Model patterns this vendor serves.
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    fn capped_stops(request: &LlmRequest) -> Vec<&str> {
        request
            .stop_sequences
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .take(MAX_STOP_SEQUENCES)
            .collect()
    }

    /// Body for `/chat/completions`.
    fn build_chat_body(request: &LlmRequest) -> serde_json::Value {
        let conv = transform(request);
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&conv),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });

        if !conv.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&conv.tools));
        }

        let stops = Self::capped_stops(request);
        if !stops.is_empty() {
            body["stop"] = serde_json::json!(stops);
        }
        body
    }

    /// Body for `/completions`.
    fn build_prefill_body(request: &LlmRequest) -> serde_json::Value {
        let conv = transform(request);
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": conv.flatten_text(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        let stops = Self::capped_stops(request);
        if !stops.is_empty() {
            body["stop"] = serde_json::json!(stops);
        }
        body
    }

    /// Convert wire turns to OpenAI chat messages.
    ///
    /// Native tool results become `tool` role messages placed before the
    /// rest of their user turn.
    fn to_api_messages(conv: &WireConversation) -> Vec<ApiMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &conv.system {
            messages.push(ApiMessage::text("system", system));
        }

        for turn in &conv.turns {
            match turn.role {
                WireRole::Assistant => {
                    let mut text = String::new();
                    let mut tool_calls = Vec::new();
                    for part in &turn.parts {
                        match part {
                            WirePart::Text(t) => text.push_str(t),
                            WirePart::ToolUse { id, name, input } => tool_calls.push(ApiToolCall {
                                id: id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            }),
                            WirePart::ToolResult { content, .. } => text.push_str(content),
                            WirePart::Image { .. } => {}
                        }
                    }
                    messages.push(ApiMessage {
                        role: "assistant".into(),
                        content: (!text.is_empty()).then(|| serde_json::json!(text)),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        tool_call_id: None,
                    });
                }
                WireRole::User => {
                    let mut content = Vec::new();
                    for part in &turn.parts {
                        match part {
                            WirePart::ToolResult {
                                tool_use_id,
                                content: output,
                                ..
                            } => messages.push(ApiMessage {
                                role: "tool".into(),
                                content: Some(serde_json::json!(output)),
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id.clone()),
                            }),
                            WirePart::Text(t) => {
                                content.push(serde_json::json!({"type": "text", "text": t}))
                            }
                            WirePart::Image { media_type, data } => content.push(serde_json::json!({
                                "type": "image_url",
                                "image_url": {
                                    "url": format!("data:{media_type};base64,{}", STANDARD.encode(data))
                                }
                            })),
                            WirePart::ToolUse { name, input, .. } => content.push(serde_json::json!({
                                "type": "text",
                                "text": crate::transform::render_tool_tag(name, input)
                            })),
                        }
                    }
                    if !content.is_empty() {
                        messages.push(ApiMessage {
                            role: "user".into(),
                            content: Some(serde_json::Value::Array(content)),
                            tool_calls: None,
                            tool_call_id: None,
                        });
                    }
                }
            }
        }
        messages
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    fn map_finish_reason(reason: Option<&str>) -> StopReason {
        match reason {
            Some("length") => StopReason::MaxTokens,
            Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
            Some("content_filter") => StopReason::Refusal,
            _ => StopReason::EndTurn,
        }
    }

    fn chat_to_completion(resp: ChatResponse) -> Result<LlmCompletion, VendorError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| VendorError::InvalidResponse("No choices in response".into()))?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Text { text });
        }
        for tc in choice.message.tool_calls.unwrap_or_default() {
            let input = serde_json::from_str(&tc.function.arguments).map_err(|e| {
                VendorError::InvalidResponse(format!(
                    "Tool call '{}' has malformed arguments: {e}",
                    tc.function.name
                ))
            })?;
            content.push(ContentBlock::ToolUse {
                id: tc.id,
                name: tc.function.name,
                input,
            });
        }

        Ok(LlmCompletion {
            content,
            stop_reason: Self::map_finish_reason(choice.finish_reason.as_deref()),
            stop_sequence: None,
            usage: resp.usage.map(ApiUsage::into_usage).unwrap_or_default(),
            model: resp.model,
        })
    }

    fn text_to_completion(resp: TextResponse) -> Result<LlmCompletion, VendorError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| VendorError::InvalidResponse("No choices in response".into()))?;

        Ok(LlmCompletion {
            content: vec![ContentBlock::Text { text: choice.text }],
            stop_reason: Self::map_finish_reason(choice.finish_reason.as_deref()),
            stop_sequence: None,
            usage: resp.usage.map(ApiUsage::into_usage).unwrap_or_default(),
            model: resp.model,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, VendorError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
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
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, vendor = %self.name, body = %error_body, "Vendor returned error");
            return Err(VendorError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Vendor for OpenAiCompatVendor {
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
        debug!(vendor = %self.name, model = %request.model, mode = %request.mode, "Sending completion request");

        match request.mode {
            TransformMode::Chat => {
                let body = Self::build_chat_body(request);
                let response = self.post("/chat/completions", &body).await?;
                let api_response: ChatResponse = response.json().await.map_err(|e| {
                    VendorError::InvalidResponse(format!("Failed to parse response: {e}"))
                })?;
                Self::chat_to_completion(api_response)
            }
            TransformMode::Prefill => {
                let body = Self::build_prefill_body(request);
                let response = self.post("/completions", &body).await?;
                let api_response: TextResponse = response.json().await.map_err(|e| {
                    VendorError::InvalidResponse(format!("Failed to parse response: {e}"))
                })?;
                Self::text_to_completion(api_response)
            }
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(serde_json::json!(text)),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    model: String,
    choices: Vec<TextChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct TextChoice {
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl ApiUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            ..Usage::default()
        }
    }
}
