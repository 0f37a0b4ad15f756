//! Context builder — raw channel history in, bounded conversation out.
//!
//! Runs the same steps in the same order on every activation:
//!
//! 1. **Merge** consecutive bot messages (hidden messages never merge)
//! 2. **Filter** hidden-prefix messages and messages carrying the hide reaction
//! 3. **Normalize** into participant messages, attaching budgeted images
//! 4. **Interleave** cached tool calls at their triggering message
//! 5. **Replay** stored model output (preserve-reasoning mode only)
//! 6. **Bound** the payload, rolling when it must
//! 7. **Place** the prompt-cache marker
//! 8. **Derive** stop sequences
//!
//! # Determinism
//!
//! The builder does no I/O and reads no clock: identical inputs always give
//! identical output.

use parley_config::BotConfig;
use parley_core::{
    Activation, ChatMessage, ContentBlock, FetchedImage, ParticipantMessage, ToolRecord,
};

use super::bound::{Limits, bound};
use super::images::{ImageBudget, select_images};
use super::replay::replay;
use super::stop_sequences::stop_sequences;

/// Messages at the end of the window kept outside the cached prefix.
pub const UNCACHED_TAIL_MESSAGES: usize = 20;

/// Participant name for tool results.
pub const SYSTEM_PARTICIPANT: &str = "System";

// ── Types ─────────────────────────────────────────────────────────────────

/// Everything the builder reads for one activation.
pub struct ContextInput<'a> {
    /// Fetched window, oldest first.
    pub messages: &'a [ChatMessage],
    pub images: &'a [FetchedImage],
    /// Cached tool calls for the channel, oldest first.
    pub tool_records: &'a [ToolRecord],
    /// Past activations still anchored in the window.
    pub activations: &'a [Activation],
    pub bot_id: &'a str,
    pub messages_since_roll: usize,
    pub last_cache_marker: Option<&'a str>,
    /// Vendor cap on stop sequences.
    pub max_stop_sequences: Option<usize>,
}

/// Builder output.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltContext {
    pub messages: Vec<ParticipantMessage>,
    /// The window was truncated; the since-roll counter must reset.
    pub did_truncate: bool,
    pub cache_marker: Option<String>,
    pub stop_sequences: Vec<String>,
    /// First platform message left in the window.
    pub oldest_message_id: Option<String>,
}

/// One platform message folded into an entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Piece {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Platform,
    ToolCall,
    ToolResult,
    /// Replayed model output that never became a chat message.
    Phantom,
}

/// Working representation between steps.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Entry {
    pub message: ParticipantMessage,
    pub kind: EntryKind,
    pub from_bot: bool,
    /// Platform messages this entry stands for.
    pub pieces: Vec<Piece>,
    /// Model output a tool call was parsed from.
    pub raw_model_text: Option<String>,
    /// Activation this entry was produced by, once known.
    pub activation: Option<String>,
}

impl Entry {
    pub fn contains_message(&self, id: &str) -> bool {
        self.pieces.iter().any(|p| p.id == id)
    }

    /// Replace the text blocks with a single block, keeping images first.
    pub fn set_text(&mut self, text: String) {
        self.message
            .content
            .retain(|b| !matches!(b, ContentBlock::Text { .. }));
        self.message.content.push(ContentBlock::Text { text });
    }
}

// ── Builder ───────────────────────────────────────────────────────────────

pub struct ContextBuilder<'c> {
    config: &'c BotConfig,
}

impl<'c> ContextBuilder<'c> {
    pub fn new(config: &'c BotConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, input: &ContextInput<'_>) -> BuiltContext {
        let ctx = &self.config.context;

        let merged = merge_bot_runs(input.messages, input.bot_id, |m| self.is_hidden(m));
        let visible: Vec<MergedMessage<'_>> = merged
            .into_iter()
            .filter(|m| !self.is_hidden(m.first))
            .collect();

        let mut entries = self.normalize(&visible, input);
        interleave_tool_records(&mut entries, input.tool_records, &self.config.name);

        if self.config.thinking.preserve_context {
            replay(&mut entries, input.activations, &self.config.name);
        }

        let did_truncate = bound(
            &mut entries,
            input.messages_since_roll,
            &Limits {
                normal_chars: ctx.recency_window_characters,
                max_messages: ctx.recency_window_messages,
                hard_max_chars: ctx.hard_max_characters,
                rolling_threshold: ctx.rolling_threshold,
            },
        );

        let cache_marker = place_cache_marker(
            &mut entries,
            if did_truncate { None } else { input.last_cache_marker },
        );

        let oldest_message_id = entries
            .iter()
            .find(|e| e.kind == EntryKind::Platform)
            .and_then(|e| e.pieces.first())
            .map(|p| p.id.clone());

        let messages: Vec<ParticipantMessage> = entries.into_iter().map(|e| e.message).collect();
        let stop_sequences = stop_sequences(
            &messages,
            &self.config.name,
            self.config.mode,
            ctx.participant_stop_count,
            &ctx.stop_sequences,
            input.max_stop_sequences,
        );

        BuiltContext {
            messages,
            did_truncate,
            cache_marker,
            stop_sequences,
            oldest_message_id,
        }
    }

    /// Hidden by prefix or by the hide reaction. Hidden messages never merge,
    /// so each part of a split reply is filtered on its own.
    fn is_hidden(&self, message: &ChatMessage) -> bool {
        let ctx = &self.config.context;
        starts_hidden(&message.content, &ctx.hidden_prefix)
            || (!ctx.hide_reaction.is_empty()
                && message.reactions.iter().any(|r| r == &ctx.hide_reaction))
    }

    fn normalize(&self, messages: &[MergedMessage<'_>], input: &ContextInput<'_>) -> Vec<Entry> {
        let ctx = &self.config.context;
        let order: Vec<&str> = messages
            .iter()
            .flat_map(|m| m.pieces.iter().map(|p| p.id.as_str()))
            .collect();
        let mut images = select_images(
            &order,
            input.images,
            &ImageBudget {
                max_images: ctx.max_images,
                max_total_bytes: ctx.max_total_image_bytes,
                max_image_bytes: ctx.max_image_bytes,
            },
        );

        messages
            .iter()
            .map(|m| {
                let from_bot = m.first.author_id == input.bot_id;
                let participant = if from_bot {
                    self.config.name.clone()
                } else {
                    m.first.author_name.clone()
                };

                let mut content: Vec<ContentBlock> = m
                    .pieces
                    .iter()
                    .flat_map(|p| images.remove(p.id.as_str()).unwrap_or_default())
                    .map(|img| ContentBlock::Image {
                        media_type: img.media_type,
                        data: img.data,
                    })
                    .collect();
                content.push(ContentBlock::text(join_pieces(&m.pieces)));

                Entry {
                    message: ParticipantMessage::new(participant, content)
                        .with_source(&m.first.id)
                        .with_timestamp(m.first.timestamp),
                    kind: EntryKind::Platform,
                    from_bot,
                    pieces: m.pieces.clone(),
                    raw_model_text: None,
                    activation: None,
                }
            })
            .collect()
    }
}

// ── Step 1: merge ─────────────────────────────────────────────────────────

/// Consecutive platform messages folded together.
pub(crate) struct MergedMessage<'a> {
    pub first: &'a ChatMessage,
    pub pieces: Vec<Piece>,
}

fn starts_hidden(content: &str, hidden_prefix: &str) -> bool {
    !hidden_prefix.is_empty() && content.starts_with(hidden_prefix)
}

fn merge_bot_runs<'a>(
    messages: &'a [ChatMessage],
    bot_id: &str,
    is_hidden: impl Fn(&ChatMessage) -> bool,
) -> Vec<MergedMessage<'a>> {
    let mut merged: Vec<MergedMessage<'a>> = Vec::new();
    let mut last_mergeable = false;

    for message in messages {
        let mergeable = message.author_id == bot_id && !is_hidden(message);
        let piece = Piece {
            id: message.id.clone(),
            text: message.content.clone(),
        };
        match merged.last_mut() {
            Some(prev) if mergeable && last_mergeable => {
                prev.pieces.push(piece);
            }
            _ => merged.push(MergedMessage {
                first: message,
                pieces: vec![piece],
            }),
        }
        last_mergeable = mergeable;
    }
    merged
}

/// Rejoin split pieces. Pieces produced by splitting keep their boundary
/// whitespace, so they join directly; anything else gets a newline.
pub(crate) fn join_pieces(pieces: &[Piece]) -> String {
    let mut text = String::new();
    for piece in pieces.iter().filter(|p| !p.text.is_empty()) {
        if !text.is_empty() && !text.ends_with(char::is_whitespace) {
            text.push('\n');
        }
        text.push_str(&piece.text);
    }
    text
}

// ── Step 4: interleave tool records ───────────────────────────────────────

fn interleave_tool_records(entries: &mut Vec<Entry>, records: &[ToolRecord], bot_name: &str) {
    let mut records: Vec<&ToolRecord> = records.iter().collect();
    records.sort_by_key(|r| r.call.timestamp);

    for record in records {
        let Some(trigger) = record.call.triggering_message_id.as_deref() else {
            continue;
        };
        let Some(pos) = entries
            .iter()
            .position(|e| e.kind == EntryKind::Platform && e.contains_message(trigger))
        else {
            continue;
        };

        let mut at = pos + 1;
        while at < entries.len()
            && entries[at]
                .message
                .timestamp
                .is_some_and(|t| t <= record.call.timestamp)
        {
            at += 1;
        }

        let (call, result) = tool_entries(record, bot_name);
        entries.insert(at, result);
        entries.insert(at, call);
    }
}

/// A record rendered as a bot-authored call and a system-authored result.
fn tool_entries(record: &ToolRecord, bot_name: &str) -> (Entry, Entry) {
    let raw = Some(record.call.raw_model_text.clone()).filter(|t| !t.is_empty());
    let call = Entry {
        message: ParticipantMessage::new(
            bot_name,
            vec![ContentBlock::ToolUse {
                id: record.call.id.clone(),
                name: record.call.name.clone(),
                input: record.call.input.clone(),
            }],
        )
        .with_timestamp(record.call.timestamp),
        kind: EntryKind::ToolCall,
        from_bot: true,
        pieces: Vec::new(),
        raw_model_text: raw.clone(),
        activation: None,
    };
    let (content, is_error) = match &record.result.error {
        Some(err) => (err.clone(), true),
        None => (record.result.output.clone(), false),
    };
    let result = Entry {
        message: ParticipantMessage::new(
            SYSTEM_PARTICIPANT,
            vec![ContentBlock::ToolResult {
                tool_use_id: record.call.id.clone(),
                content,
                is_error,
            }],
        )
        .with_timestamp(record.call.timestamp),
        kind: EntryKind::ToolResult,
        from_bot: false,
        pieces: Vec::new(),
        raw_model_text: raw,
        activation: None,
    };
    (call, result)
}

// ── Step 7: cache marker ──────────────────────────────────────────────────

/// Keep the previous marker while it is still in the window, otherwise
/// place a new one [`UNCACHED_TAIL_MESSAGES`] from the end.
fn place_cache_marker(entries: &mut [Entry], previous: Option<&str>) -> Option<String> {
    let kept = previous.and_then(|id| {
        entries
            .iter()
            .position(|e| e.message.source_message_id.as_deref() == Some(id))
    });

    let index = match kept {
        Some(i) => Some(i),
        None if entries.is_empty() => None,
        None => {
            let target = entries.len().saturating_sub(UNCACHED_TAIL_MESSAGES);
            // The marker must name a platform message.
            (0..=target)
                .rev()
                .chain(target + 1..entries.len())
                .find(|&i| entries[i].message.source_message_id.is_some())
        }
    };

    let index = index?;
    entries[index].message.cache_marker = true;
    entries[index].message.source_message_id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use parley_core::{ToolCall, ToolResult};

    const BOT: &str = "bot-id";

    fn config() -> BotConfig {
        BotConfig::default()
    }

    /// Messages one minute apart starting at a fixed instant.
    fn history(rows: &[(&str, &str)]) -> Vec<ChatMessage> {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, (author, text))| {
                let author_id = if *author == "Parley" { BOT } else { *author };
                let mut m = ChatMessage::new(format!("m{i}"), "ch", author_id, *author, *text);
                m.timestamp = base + Duration::minutes(i as i64);
                m
            })
            .collect()
    }

    fn input<'a>(messages: &'a [ChatMessage]) -> ContextInput<'a> {
        ContextInput {
            messages,
            images: &[],
            tool_records: &[],
            activations: &[],
            bot_id: BOT,
            messages_since_roll: 0,
            last_cache_marker: None,
            max_stop_sequences: None,
        }
    }

    fn texts(built: &BuiltContext) -> Vec<String> {
        built
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.participant, m.text_content()))
            .collect()
    }

    #[test]
    fn consecutive_bot_messages_merge() {
        let messages = history(&[
            ("alice", "hi"),
            ("Parley", "first part "),
            ("Parley", "second part"),
            ("Parley", "new thought"),
            ("alice", "ok"),
        ]);
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&messages));
        assert_eq!(
            texts(&built),
            vec![
                "alice: hi",
                "Parley: first part second part\nnew thought",
                "alice: ok"
            ]
        );
        assert_eq!(built.messages[1].source_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn hidden_messages_never_merge_and_are_dropped() {
        let messages = history(&[
            ("Parley", "one"),
            ("Parley", ".tool output"),
            ("Parley", "two"),
            ("alice", ".secret"),
        ]);
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&messages));
        assert_eq!(texts(&built), vec!["Parley: one", "Parley: two"]);
    }

    #[test]
    fn hide_reaction_filters() {
        let mut messages = history(&[("alice", "keep"), ("bob", "drop me")]);
        messages[1].reactions.push("🫥".into());
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&messages));
        assert_eq!(texts(&built), vec!["alice: keep"]);
    }

    #[test]
    fn hide_reaction_drops_only_that_part_of_a_split_reply() {
        let mut messages = history(&[
            ("alice", "q"),
            ("Parley", "part one "),
            ("Parley", "part two"),
            ("Parley", "part three"),
        ]);
        messages[2].reactions.push("🫥".into());
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&messages));
        assert_eq!(
            texts(&built),
            vec!["alice: q", "Parley: part one ", "Parley: part three"]
        );
    }

    #[test]
    fn identity_below_threshold() {
        let messages = history(&[("alice", "a"), ("bob", "b"), ("carol", "c")]);
        let mut config = config();
        config.context.recency_window_messages = 1;
        config.context.recency_window_characters = 1;
        let mut inp = input(&messages);
        inp.messages_since_roll = 5;
        let built = ContextBuilder::new(&config).build(&inp);
        assert_eq!(built.messages.len(), 3);
        assert!(!built.did_truncate);
    }

    #[test]
    fn hard_max_forces_truncate_to_normal_limit() {
        let long = "x".repeat(20_000);
        let rows: Vec<(&str, &str)> = (0..30).map(|_| ("alice", long.as_str())).collect();
        let messages = history(&rows);
        let config = config();
        let mut inp = input(&messages);
        inp.messages_since_roll = 10;
        let built = ContextBuilder::new(&config).build(&inp);

        assert!(built.did_truncate);
        let total: usize = built.messages.iter().map(|m| m.payload_chars()).sum();
        assert!(total <= config.context.recency_window_characters);
        assert_eq!(built.messages.len(), 5);
        assert_eq!(built.oldest_message_id.as_deref(), Some("m25"));
    }

    #[test]
    fn at_threshold_enforces_message_limit() {
        let rows: Vec<(&str, &str)> = (0..10).map(|_| ("alice", "hello")).collect();
        let messages = history(&rows);
        let mut config = config();
        config.context.recency_window_messages = 4;
        config.context.rolling_threshold = 5;
        let mut inp = input(&messages);
        inp.messages_since_roll = 5;
        let built = ContextBuilder::new(&config).build(&inp);
        assert!(built.did_truncate);
        assert_eq!(built.messages.len(), 4);
        assert_eq!(built.messages[0].source_message_id.as_deref(), Some("m6"));
    }

    #[test]
    fn cache_marker_placed_twenty_from_end() {
        let rows: Vec<(&str, &str)> = (0..30).map(|_| ("alice", "hey")).collect();
        let messages = history(&rows);
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&messages));
        assert_eq!(built.cache_marker.as_deref(), Some("m10"));
        assert!(built.messages[10].cache_marker);
        assert_eq!(built.messages.iter().filter(|m| m.cache_marker).count(), 1);
    }

    #[test]
    fn short_window_marks_first_message() {
        let messages = history(&[("alice", "a"), ("bob", "b")]);
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&messages));
        assert_eq!(built.cache_marker.as_deref(), Some("m0"));
    }

    #[test]
    fn cache_marker_is_stable() {
        let rows: Vec<(&str, &str)> = (0..40).map(|_| ("alice", "hey")).collect();
        let messages = history(&rows);
        let config = config();
        let builder = ContextBuilder::new(&config);

        let mut inp = input(&messages);
        inp.last_cache_marker = Some("m5");
        let first = builder.build(&inp);
        let second = builder.build(&inp);
        assert_eq!(first.cache_marker.as_deref(), Some("m5"));
        assert_eq!(first.cache_marker, second.cache_marker);
    }

    #[test]
    fn stale_marker_is_recomputed() {
        let rows: Vec<(&str, &str)> = (0..25).map(|_| ("alice", "hey")).collect();
        let messages = history(&rows);
        let config = config();
        let mut inp = input(&messages);
        inp.last_cache_marker = Some("gone");
        let built = ContextBuilder::new(&config).build(&inp);
        assert_eq!(built.cache_marker.as_deref(), Some("m5"));
    }

    #[test]
    fn empty_window() {
        let config = config();
        let built = ContextBuilder::new(&config).build(&input(&[]));
        assert!(built.messages.is_empty());
        assert!(built.cache_marker.is_none());
        assert!(built.oldest_message_id.is_none());
    }

    fn record(id: &str, trigger: &str, at: chrono::DateTime<Utc>) -> ToolRecord {
        let mut call = ToolCall::new(id, "read", serde_json::json!({"path": "notes.txt"}));
        call.triggering_message_id = Some(trigger.into());
        call.timestamp = at;
        ToolRecord {
            call,
            result: ToolResult::success(id, "file body"),
        }
    }

    #[test]
    fn tool_records_interleave_at_trigger() {
        let messages = history(&[
            ("alice", "read notes"),
            ("bob", "unrelated"),
            ("Parley", "the notes say hi"),
        ]);
        // Executed between bob's message and the reply.
        let at = messages[1].timestamp + Duration::seconds(30);
        let records = vec![record("t1", "m0", at)];
        let config = config();
        let mut inp = input(&messages);
        inp.tool_records = &records;
        let built = ContextBuilder::new(&config).build(&inp);

        let participants: Vec<&str> = built.messages.iter().map(|m| m.participant.as_str()).collect();
        assert_eq!(participants, vec!["alice", "bob", "Parley", "System", "Parley"]);
        assert!(built.messages[2].has_tool_use());
        assert!(matches!(
            &built.messages[3].content[0],
            ContentBlock::ToolResult { content, is_error: false, .. } if content == "file body"
        ));
    }

    #[test]
    fn tool_records_without_live_trigger_are_dropped() {
        let messages = history(&[("alice", "hi")]);
        let records = vec![record("t1", "elsewhere", messages[0].timestamp)];
        let config = config();
        let mut inp = input(&messages);
        inp.tool_records = &records;
        assert_eq!(ContextBuilder::new(&config).build(&inp).messages.len(), 1);
    }

    #[test]
    fn failed_tool_shows_error() {
        let messages = history(&[("alice", "go")]);
        let mut rec = record("t1", "m0", messages[0].timestamp + Duration::seconds(1));
        rec.result = ToolResult::failure("t1", "permission denied");
        let records = vec![rec];
        let config = config();
        let mut inp = input(&messages);
        inp.tool_records = &records;
        let built = ContextBuilder::new(&config).build(&inp);
        assert!(matches!(
            &built.messages[2].content[0],
            ContentBlock::ToolResult { content, is_error: true, .. } if content == "permission denied"
        ));
    }

    #[test]
    fn join_pieces_respects_split_whitespace() {
        let pieces = vec![
            Piece { id: "a".into(), text: "one ".into() },
            Piece { id: "b".into(), text: "two".into() },
            Piece { id: "c".into(), text: String::new() },
            Piece { id: "d".into(), text: "three".into() },
        ];
        assert_eq!(join_pieces(&pieces), "one two\nthree");
    }
}
