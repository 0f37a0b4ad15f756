//! Request transformation — the normalized conversation laid out as turns.
//!
//! Both wire modes produce a [`WireConversation`]: an optional system prompt
//! plus alternating user/assistant turns made of text, image and tool parts.
//! Each vendor then serializes the turns in its own JSON dialect.
//!
//! - **Prefill**: everything becomes one growing `Participant: text`
//!   transcript in assistant turns that the model continues after a trailing
//!   `BotName:` primer. Image messages break the transcript into a separate
//!   user turn. Tools are described as compact usage examples.
//! - **Chat**: consecutive non-bot messages are grouped into a user turn,
//!   bot messages become assistant turns, and tools stay native.
//!
//! In both modes the cache breakpoint lands on the part that ends with the
//! marked message, never later.

use std::collections::HashSet;

use parley_core::{ContentBlock, LlmRequest, ParticipantMessage, TransformMode};
use parley_core::tool::ToolDefinition;
use serde_json::Value;

/// Opening user turn of every prefill transcript.
pub const PREFILL_PRIMER: &str = "<cmd>cat untitled.log</cmd>";

/// Opening reasoning tag seeded when prefill thinking is on.
pub const THINKING_OPEN: &str = "<thinking>";

/// Placeholder user turn for chat requests that would otherwise start or
/// end on an assistant turn.
const CHAT_FILLER: &str = "[continue]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRole {
    User,
    Assistant,
}

/// One piece of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePart {
    Text(String),
    Image {
        media_type: String,
        data: Vec<u8>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireTurn {
    pub role: WireRole,
    pub parts: Vec<WirePart>,
    /// Index of the part carrying the cache breakpoint.
    pub cache_part: Option<usize>,
}

impl WireTurn {
    pub fn new(role: WireRole) -> Self {
        Self {
            role,
            parts: Vec::new(),
            cache_part: None,
        }
    }

    fn with_text(role: WireRole, text: &str) -> Self {
        let mut turn = Self::new(role);
        turn.parts.push(WirePart::Text(text.to_string()));
        turn
    }

    /// Append text to the trailing text part. A part that already carries
    /// the cache breakpoint is closed; new text opens a fresh part.
    fn push_text(&mut self, text: &str) {
        let closed = self.cache_part.is_some() && self.cache_part == self.parts.len().checked_sub(1);
        match self.parts.last_mut() {
            Some(WirePart::Text(existing)) if !closed => existing.push_str(text),
            _ => self.parts.push(WirePart::Text(text.to_string())),
        }
    }

    /// Put the cache breakpoint on the last part.
    fn mark_cache(&mut self) {
        if let Some(i) = self.parts.len().checked_sub(1) {
            self.cache_part = Some(i);
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                WirePart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, WirePart::Image { .. }))
    }

    fn trim_end(&mut self) {
        if let Some(WirePart::Text(text)) = self.parts.last_mut() {
            let trimmed = text.trim_end().len();
            text.truncate(trimmed);
        }
    }
}

/// A request laid out as vendor-ready turns.
#[derive(Debug, Clone, PartialEq)]
pub struct WireConversation {
    pub system: Option<String>,
    pub turns: Vec<WireTurn>,
    /// Native tool definitions (chat mode only; prefill renders examples).
    pub tools: Vec<ToolDefinition>,
}

impl WireConversation {
    /// Plain-text prompt for text completion endpoints: the transcript
    /// without the primer turn, images dropped.
    pub fn flatten_text(&self) -> String {
        let mut prompt = String::new();
        if let Some(system) = &self.system {
            prompt.push_str(system);
            prompt.push_str("\n\n");
        }
        for turn in &self.turns {
            let text = turn.text();
            if text == PREFILL_PRIMER {
                continue;
            }
            prompt.push_str(&text);
        }
        prompt
    }

    /// Index of the turn carrying the cache breakpoint.
    pub fn cache_turn(&self) -> Option<usize> {
        self.turns.iter().position(|t| t.cache_part.is_some())
    }
}

/// Lay out a request in its configured mode.
pub fn transform(request: &LlmRequest) -> WireConversation {
    match request.mode {
        TransformMode::Prefill => transform_prefill(request),
        TransformMode::Chat => transform_chat(request),
    }
}

/// Continuation-style layout.
pub fn transform_prefill(request: &LlmRequest) -> WireConversation {
    let mut turns = Vec::new();
    push_turn(&mut turns, WireTurn::with_text(WireRole::User, PREFILL_PRIMER));

    let mut transcript = WireTurn::new(WireRole::Assistant);
    for msg in &request.messages {
        let line = format!("{}\n", transcript_line(msg));
        if msg.has_images() {
            if !transcript.parts.is_empty() {
                let done = std::mem::replace(&mut transcript, WireTurn::new(WireRole::Assistant));
                push_turn(&mut turns, done);
            }
            let mut image_turn = WireTurn::new(WireRole::User);
            for block in &msg.content {
                if let ContentBlock::Image { media_type, data } = block {
                    image_turn.parts.push(WirePart::Image {
                        media_type: media_type.clone(),
                        data: data.clone(),
                    });
                }
            }
            image_turn.push_text(&line);
            if msg.cache_marker {
                image_turn.mark_cache();
            }
            push_turn(&mut turns, image_turn);
        } else {
            transcript.push_text(&line);
            if msg.cache_marker {
                transcript.mark_cache();
            }
        }
    }

    let seed = if !request.continuation.is_empty() {
        request.continuation.clone()
    } else if request.prefill_thinking {
        format!(" {THINKING_OPEN}")
    } else {
        String::new()
    };
    transcript.push_text(&format!("{}:{}", request.bot_name, seed));
    transcript.trim_end();
    push_turn(&mut turns, transcript);

    let mut system = request.system_prompt.clone().unwrap_or_default();
    if !request.tools.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&render_tool_examples(&request.tools));
    }

    WireConversation {
        system: (!system.is_empty()).then_some(system),
        turns,
        tools: Vec::new(),
    }
}

/// Role-based layout.
pub fn transform_chat(request: &LlmRequest) -> WireConversation {
    let mut turns: Vec<WireTurn> = Vec::new();
    let mut tool_use_ids: HashSet<String> = HashSet::new();

    for msg in &request.messages {
        let turn = if msg.participant == request.bot_name {
            assistant_turn(msg, &mut tool_use_ids)
        } else {
            user_turn(msg, &tool_use_ids)
        };
        if let Some(turn) = turn {
            push_turn(&mut turns, turn);
        }
    }

    if turns.first().is_none_or(|t| t.role == WireRole::Assistant) {
        turns.insert(0, WireTurn::with_text(WireRole::User, CHAT_FILLER));
    }

    let mut tail = Vec::new();
    if let Some(priming) = &request.persona_priming {
        tail.push(priming.clone());
    }
    if request.respond_as_primer {
        tail.push(format!("Respond as {}:", request.bot_name));
    }
    if !tail.is_empty() {
        push_turn(
            &mut turns,
            WireTurn::with_text(WireRole::User, &tail.join("\n")),
        );
    } else if turns.last().is_some_and(|t| t.role == WireRole::Assistant) {
        push_turn(&mut turns, WireTurn::with_text(WireRole::User, CHAT_FILLER));
    }

    WireConversation {
        system: request.system_prompt.clone(),
        turns,
        tools: request.tools.clone(),
    }
}

fn assistant_turn(msg: &ParticipantMessage, tool_use_ids: &mut HashSet<String>) -> Option<WireTurn> {
    let mut turn = WireTurn::new(WireRole::Assistant);
    for block in &msg.content {
        match block {
            ContentBlock::Text { text } if !text.is_empty() => turn.push_text(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_use_ids.insert(id.clone());
                turn.parts.push(WirePart::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            ContentBlock::ToolResult { content, .. } => turn.push_text(content),
            _ => {}
        }
    }
    if turn.parts.is_empty() {
        return None;
    }
    if msg.cache_marker {
        turn.mark_cache();
    }
    Some(turn)
}

fn user_turn(msg: &ParticipantMessage, tool_use_ids: &HashSet<String>) -> Option<WireTurn> {
    let mut turn = WireTurn::new(WireRole::User);
    let mut text = String::new();
    for block in &msg.content {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } if tool_use_ids.contains(tool_use_id) => {
                turn.parts.push(WirePart::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                });
            }
            ContentBlock::ToolResult { content, .. } => push_line(&mut text, content),
            ContentBlock::Text { text: t } => push_line(&mut text, t),
            ContentBlock::Image { media_type, data } => turn.parts.push(WirePart::Image {
                media_type: media_type.clone(),
                data: data.clone(),
            }),
            ContentBlock::ToolUse { name, input, .. } => {
                push_line(&mut text, &render_tool_tag(name, input))
            }
        }
    }
    let only_native_results = !turn.parts.is_empty()
        && turn
            .parts
            .iter()
            .all(|p| matches!(p, WirePart::ToolResult { .. }))
        && text.is_empty();
    if !only_native_results {
        turn.parts
            .push(WirePart::Text(format!("{}: {}", msg.participant, text)));
    }
    if msg.cache_marker {
        turn.mark_cache();
    }
    Some(turn)
}

fn push_line(buf: &mut String, line: &str) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}

/// Append a turn, merging it into the previous one when roles match.
fn push_turn(turns: &mut Vec<WireTurn>, turn: WireTurn) {
    match turns.last_mut() {
        Some(prev) if prev.role == turn.role => {
            if let Some(i) = turn.cache_part {
                prev.cache_part = Some(prev.parts.len() + i);
            }
            prev.parts.extend(turn.parts);
        }
        _ => turns.push(turn),
    }
}

/// One transcript line: `Participant: text`, tool calls rendered as tags.
pub fn transcript_line(msg: &ParticipantMessage) -> String {
    let mut body = String::new();
    for block in &msg.content {
        match block {
            ContentBlock::Text { text } => push_line(&mut body, text),
            ContentBlock::ToolUse { name, input, .. } => {
                push_line(&mut body, &render_tool_tag(name, input))
            }
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                if *is_error {
                    push_line(&mut body, &format!("Error: {content}"));
                } else {
                    push_line(&mut body, content);
                }
            }
            ContentBlock::Image { .. } => {}
        }
    }
    format!("{}: {}", msg.participant, body)
}

/// `<name>{json}</name>`, the free-text invocation syntax.
pub fn render_tool_tag(name: &str, input: &Value) -> String {
    format!("<{name}>{input}</{name}>")
}

/// Compact tool descriptions: one usage example per tool carrying only the
/// required fields, each with one representative value for its type.
pub fn render_tool_examples(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "To use a tool, write its name as a tag around JSON input. Available tools:\n",
    );
    for tool in tools {
        let example = example_input(&tool.input_schema);
        out.push_str(&render_tool_tag(&tool.name, &example));
        if !tool.description.is_empty() {
            out.push_str(" - ");
            out.push_str(&tool.description);
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}

fn example_input(schema: &Value) -> Value {
    let mut example = serde_json::Map::new();
    let properties = schema.get("properties");
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for field in required.iter().filter_map(Value::as_str) {
        let property = properties.and_then(|p| p.get(field));
        example.insert(field.to_string(), example_value(property));
    }
    Value::Object(example)
}

fn example_value(property: Option<&Value>) -> Value {
    let Some(property) = property else {
        return Value::String("...".into());
    };
    if let Some(first) = property
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
    {
        return first.clone();
    }
    let kind = match property.get("type") {
        Some(Value::String(s)) => s.as_str(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|k| *k != "null")
            .unwrap_or("string"),
        _ => "string",
    };
    match kind {
        "integer" | "number" => Value::from(0),
        "boolean" => Value::Bool(true),
        "array" => Value::Array(Vec::new()),
        "object" => Value::Object(serde_json::Map::new()),
        _ => Value::String("...".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo() -> Vec<ParticipantMessage> {
        vec![
            ParticipantMessage::text("alice", "hi"),
            ParticipantMessage::text("bob", "hello"),
            ParticipantMessage::text("Parley", "hey both"),
            ParticipantMessage::text("alice", "what's up"),
        ]
    }

    fn prefill_request(messages: Vec<ParticipantMessage>) -> LlmRequest {
        LlmRequest::new("claude-sonnet-4", "Parley").with_messages(messages)
    }

    #[test]
    fn prefill_flattens_into_transcript() {
        let conv = transform_prefill(&prefill_request(convo()));
        assert_eq!(conv.turns.len(), 2);
        assert_eq!(conv.turns[0].role, WireRole::User);
        assert_eq!(conv.turns[0].text(), PREFILL_PRIMER);
        assert_eq!(conv.turns[1].role, WireRole::Assistant);
        assert_eq!(
            conv.turns[1].text(),
            "alice: hi\nbob: hello\nParley: hey both\nalice: what's up\nParley:"
        );
    }

    #[test]
    fn prefill_ends_without_trailing_whitespace() {
        let mut req = prefill_request(convo());
        req.continuation = "I was saying ".into();
        let conv = transform_prefill(&req);
        let last = conv.turns.last().unwrap().text();
        assert!(last.ends_with("Parley:I was saying"));
    }

    #[test]
    fn prefill_thinking_seeds_open_tag() {
        let mut req = prefill_request(convo());
        req.prefill_thinking = true;
        let conv = transform_prefill(&req);
        assert!(conv.turns.last().unwrap().text().ends_with("Parley: <thinking>"));
    }

    #[test]
    fn prefill_image_breaks_turn() {
        let mut messages = convo();
        messages.insert(
            2,
            ParticipantMessage::new(
                "bob",
                vec![
                    ContentBlock::Image {
                        media_type: "image/png".into(),
                        data: vec![1, 2, 3],
                    },
                    ContentBlock::text("look"),
                ],
            ),
        );
        let conv = transform_prefill(&prefill_request(messages));
        let roles: Vec<WireRole> = conv.turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                WireRole::User,
                WireRole::Assistant,
                WireRole::User,
                WireRole::Assistant
            ]
        );
        assert!(conv.turns[2].has_images());
        assert_eq!(conv.turns[2].text(), "bob: look\n");
        assert!(!conv.turns[1].has_images());
    }

    #[test]
    fn prefill_cache_breakpoint_stops_at_marker() {
        let mut messages = convo();
        messages[1].cache_marker = true;
        let conv = transform_prefill(&prefill_request(messages));
        let transcript = &conv.turns[1];
        assert_eq!(transcript.cache_part, Some(0));
        assert_eq!(
            transcript.parts[0],
            WirePart::Text("alice: hi\nbob: hello\n".into())
        );
        // Everything after the marker lives in a later, uncached part.
        assert_eq!(transcript.parts.len(), 2);
        assert_eq!(conv.cache_turn(), Some(1));
    }

    #[test]
    fn prefill_without_marker_has_no_breakpoint() {
        let conv = transform_prefill(&prefill_request(convo()));
        assert!(conv.cache_turn().is_none());
    }

    #[test]
    fn prefill_renders_tool_calls_as_tags() {
        let messages = vec![
            ParticipantMessage::new(
                "Parley",
                vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read".into(),
                    input: serde_json::json!({"path": "a.txt"}),
                }],
            ),
            ParticipantMessage::new(
                "System",
                vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "contents".into(),
                    is_error: false,
                }],
            ),
        ];
        let conv = transform_prefill(&prefill_request(messages));
        let text = conv.turns[1].text();
        assert!(text.starts_with("Parley: <read>{\"path\":\"a.txt\"}</read>\nSystem: contents\n"));
    }

    #[test]
    fn prefill_tools_become_examples_in_system() {
        let mut req = prefill_request(convo());
        req.system_prompt = Some("Be brief.".into());
        req.tools = vec![ToolDefinition {
            name: "search".into(),
            description: "Search the web".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                    "safe": {"type": "boolean"}
                },
                "required": ["query", "safe"]
            }),
        }];
        let conv = transform_prefill(&req);
        let system = conv.system.unwrap();
        assert!(system.starts_with("Be brief.\n\n"));
        assert!(system.contains(r#"<search>{"query":"...","safe":true}</search> - Search the web"#));
        assert!(!system.contains("limit"));
        assert!(conv.tools.is_empty());
    }

    #[test]
    fn example_values_follow_types() {
        let schema = serde_json::json!({
            "properties": {
                "n": {"type": "number"},
                "tags": {"type": "array"},
                "opts": {"type": "object"},
                "mode": {"type": "string", "enum": ["fast", "slow"]},
                "maybe": {"type": ["null", "integer"]}
            },
            "required": ["n", "tags", "opts", "mode", "maybe"]
        });
        let example = example_input(&schema);
        assert_eq!(example["n"], 0);
        assert_eq!(example["tags"], serde_json::json!([]));
        assert_eq!(example["opts"], serde_json::json!({}));
        assert_eq!(example["mode"], "fast");
        assert_eq!(example["maybe"], 0);
    }

    #[test]
    fn chat_groups_non_bot_turns() {
        let req = prefill_request(convo()).with_mode(TransformMode::Chat);
        let conv = transform(&req);
        let roles: Vec<WireRole> = conv.turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![WireRole::User, WireRole::Assistant, WireRole::User]
        );
        assert_eq!(conv.turns[0].parts.len(), 2);
        assert_eq!(conv.turns[0].text(), "alice: hibob: hello");
        assert_eq!(conv.turns[1].text(), "hey both");
    }

    #[test]
    fn chat_starts_with_user_turn() {
        let messages = vec![
            ParticipantMessage::text("Parley", "I'm here"),
            ParticipantMessage::text("alice", "hi"),
        ];
        let conv = transform_chat(&prefill_request(messages));
        assert_eq!(conv.turns[0].role, WireRole::User);
        assert_eq!(conv.turns[1].role, WireRole::Assistant);
    }

    #[test]
    fn chat_primers_appended_as_user_turn() {
        let mut req = prefill_request(vec![
            ParticipantMessage::text("alice", "hi"),
            ParticipantMessage::text("Parley", "hello"),
        ]);
        req.persona_priming = Some("Stay in character.".into());
        req.respond_as_primer = true;
        let conv = transform_chat(&req);
        let last = conv.turns.last().unwrap();
        assert_eq!(last.role, WireRole::User);
        assert_eq!(last.text(), "Stay in character.\nRespond as Parley:");
    }

    #[test]
    fn chat_native_tool_results_follow_tool_use() {
        let messages = vec![
            ParticipantMessage::text("alice", "read it"),
            ParticipantMessage::new(
                "Parley",
                vec![
                    ContentBlock::text("checking"),
                    ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "read".into(),
                        input: serde_json::json!({}),
                    },
                ],
            ),
            ParticipantMessage::new(
                "System",
                vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "data".into(),
                    is_error: false,
                }],
            ),
        ];
        let conv = transform_chat(&prefill_request(messages));
        assert_eq!(conv.turns.len(), 3);
        assert!(matches!(conv.turns[1].parts[1], WirePart::ToolUse { .. }));
        assert_eq!(conv.turns[2].parts.len(), 1);
        assert!(matches!(
            conv.turns[2].parts[0],
            WirePart::ToolResult { ref tool_use_id, .. } if tool_use_id == "t1"
        ));
    }

    #[test]
    fn chat_cache_marker_on_marked_message_part() {
        let mut messages = convo();
        messages[0].cache_marker = true;
        let conv = transform_chat(&prefill_request(messages));
        assert_eq!(conv.turns[0].cache_part, Some(0));
        assert_eq!(conv.cache_turn(), Some(0));
    }

    #[test]
    fn flatten_text_skips_primer() {
        let conv = transform_prefill(&prefill_request(convo()));
        let prompt = conv.flatten_text();
        assert!(prompt.starts_with("alice: hi"));
        assert!(prompt.ends_with("Parley:"));
    }
}
