//! Remote tool servers.
//!
//! A tool server is reached through a narrow request/response contract
//! ([`ToolProtocolClient`]). Each tool it advertises is wrapped in a
//! [`RemoteTool`] so it registers and dispatches exactly like an
//! in-process plugin.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolDefinition, ToolRegistry};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output returned by a tool server for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOutput {
    /// Text blocks in server order.
    pub content: Vec<String>,
    /// The server flagged the call as failed.
    pub is_error: bool,
}

impl RemoteOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text.into()],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![text.into()],
            is_error: true,
        }
    }

    fn joined(&self) -> String {
        self.content.join("\n")
    }
}

/// Client side of a tool server connection.
#[async_trait]
pub trait ToolProtocolClient: Send + Sync {
    /// Server name, used for logging and error attribution.
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<RemoteOutput, ToolError>;
}

/// A tool served by a remote tool server.
pub struct RemoteTool {
    /// Name exposed to the model (tag-safe).
    name: String,
    /// Name the server knows the tool by.
    remote_name: String,
    description: String,
    input_schema: Value,
    client: Arc<dyn ToolProtocolClient>,
}

impl RemoteTool {
    pub fn new(definition: ToolDefinition, client: Arc<dyn ToolProtocolClient>) -> Self {
        Self {
            name: sanitize_tool_name(&definition.name),
            remote_name: definition.name,
            description: definition.description,
            input_schema: definition.input_schema,
            client,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn invoke(&self, input: Value) -> Result<String, ToolError> {
        if !input.is_object() {
            return Err(ToolError::InvalidArguments(format!(
                "'{}' expects a JSON object, got {input}",
                self.name
            )));
        }

        debug!(server = self.client.server_name(), tool = %self.remote_name, "Calling remote tool");
        let output = self.client.call_tool(&self.remote_name, input).await?;
        let text = output.joined();

        if output.is_error {
            let reason = if text.is_empty() {
                format!("server reported an error while calling '{}'", self.remote_name)
            } else {
                text
            };
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason,
            });
        }

        if text.is_empty() {
            return Ok("[tool returned no content]".into());
        }
        Ok(text)
    }
}

/// Register every tool a server advertises. Returns the number registered.
///
/// Tools whose names collide with an already-registered tool are skipped.
pub async fn register_remote_tools(
    registry: &mut ToolRegistry,
    client: Arc<dyn ToolProtocolClient>,
) -> Result<usize, ToolError> {
    let definitions = client.list_tools().await?;
    let mut registered = 0;

    for definition in definitions {
        let tool = RemoteTool::new(definition, Arc::clone(&client));
        if registry.contains(tool.name()) {
            warn!(
                server = client.server_name(),
                tool = tool.name(),
                "Tool name already registered, skipping"
            );
            continue;
        }
        registry.register(Arc::new(tool));
        registered += 1;
    }

    info!(server = client.server_name(), tools = registered, "Remote tools registered");
    Ok(registered)
}

/// Reduce a tool name to characters that survive the `<name>{json}</name>`
/// text syntax.
fn sanitize_tool_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    while name.contains("__") {
        name = name.replace("__", "_");
    }
    let name = name.trim_matches('_');

    if name.is_empty() {
        return "tool".into();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("_{name}");
    }
    name.to_string()
}
