//! Free-text tool invocation parsing.
//!
//! In transcript mode the model calls a tool by writing its name as a tag
//! around JSON input: `<search>{"query": "rust"}</search>`. Tags inside code
//! (fenced blocks or inline backticks) are not invocations.

use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static OPEN_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([A-Za-z_][A-Za-z0-9_-]*)>").expect("valid tag regex"));

/// Tag name of a reasoning block.
pub const THINKING_TAG: &str = "thinking";

/// A tool invocation found in model text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInvocation {
    pub name: String,
    pub input: serde_json::Value,
    /// Byte range of the whole tag in the original text.
    pub start: usize,
    pub end: usize,
}

/// Replace code spans with spaces of the same byte length so offsets into
/// the masked text are valid offsets into the original.
pub fn mask_code(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let run = bytes[i..].iter().take_while(|&&b| b == b'`').count();
        let fence = &text[i..i + run];
        let close = text[i + run..].find(fence).map(|p| i + run + p + run);
        let Some(close) = close else {
            // An unmatched run is literal text.
            i += run;
            continue;
        };
        out.push_str(&text[copied..i]);
        out.extend(std::iter::repeat_n(' ', close - i));
        i = close;
        copied = close;
    }
    out.push_str(&text[copied..]);
    out
}

/// Find tool invocations for known tools, in order of appearance.
///
/// Malformed JSON bodies are logged and skipped.
pub fn parse_invocations(text: &str, is_known: impl Fn(&str) -> bool) -> Vec<ParsedInvocation> {
    let masked = mask_code(text);
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(caps) = OPEN_TAG_RE.captures_at(&masked, pos) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        pos = whole.end();
        if !is_known(name.as_str()) {
            continue;
        }

        let close_tag = format!("</{}>", name.as_str());
        let Some(close_offset) = masked[whole.end()..].find(&close_tag) else {
            continue;
        };
        let body_end = whole.end() + close_offset;
        let body = text[whole.end()..body_end].trim();

        let input = if body.is_empty() {
            Ok(serde_json::Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_str::<serde_json::Value>(body)
        };
        let end = body_end + close_tag.len();
        match input {
            Ok(input) => {
                found.push(ParsedInvocation {
                    name: name.as_str().to_string(),
                    input,
                    start: whole.start(),
                    end,
                });
            }
            Err(e) => {
                warn!(tool = name.as_str(), error = %e, "Skipping tool call with malformed JSON");
            }
        }
        pos = end;
    }

    found
}

/// Text before the first invocation.
pub fn preamble<'t>(text: &'t str, invocations: &[ParsedInvocation]) -> &'t str {
    match invocations.first() {
        Some(first) => &text[..first.start],
        None => text,
    }
}

/// Name of a tool or reasoning tag left open at the end of `text`.
pub fn unclosed_tag(text: &str, is_known: impl Fn(&str) -> bool) -> Option<String> {
    let masked = mask_code(text);
    let mut open: Option<String> = None;
    let mut pos = 0;

    while let Some(caps) = OPEN_TAG_RE.captures_at(&masked, pos) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        pos = whole.end();
        let name = name.as_str();
        if name != THINKING_TAG && !is_known(name) {
            continue;
        }
        let close_tag = format!("</{name}>");
        match masked[pos..].find(&close_tag) {
            Some(offset) => {
                pos += offset + close_tag.len();
                open = None;
            }
            None => {
                open = Some(name.to_string());
                break;
            }
        }
    }
    open
}
