//! Scripted collaborators shared by the agent tests.

use async_trait::async_trait;
use parley_core::error::{ToolError, VendorError};
use parley_core::{ContentBlock, LlmCompletion, LlmRequest, StopReason, Tool, Usage, Vendor};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns queued completions in order and keeps every request it saw.
pub struct ScriptedVendor {
    patterns: Vec<String>,
    script: Mutex<Vec<Result<LlmCompletion, VendorError>>>,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedVendor {
    pub fn new(script: Vec<LlmCompletion>) -> Self {
        Self::with_results(script.into_iter().map(Ok).collect())
    }

    pub fn with_results(script: Vec<Result<LlmCompletion, VendorError>>) -> Self {
        Self {
            patterns: vec!["*".into()],
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Vendor for ScriptedVendor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_patterns(&self) -> &[String] {
        &self.patterns
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, VendorError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(VendorError::InvalidResponse("script exhausted".into()));
        }
        script.remove(0)
    }
}

/// A completion that stopped on `stop`.
pub fn stopped_at(text: &str, stop: &str) -> LlmCompletion {
    LlmCompletion {
        content: vec![ContentBlock::text(text)],
        stop_reason: StopReason::StopSequence,
        stop_sequence: Some(stop.into()),
        usage: Usage::default(),
        model: "test".into(),
    }
}

/// A native tool-use completion.
pub fn native_tool_use(id: &str, name: &str, input: serde_json::Value) -> LlmCompletion {
    LlmCompletion {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: StopReason::ToolUse,
        stop_sequence: None,
        usage: Usage::default(),
        model: "test".into(),
    }
}

/// Echoes its `text` input and counts invocations.
#[derive(Default)]
pub struct EchoTool {
    pub calls: AtomicUsize,
}

impl EchoTool {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        input
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'text'".into()))
    }
}
