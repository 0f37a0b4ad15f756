//! Reasoning replay: put the model's full stored output back in place of
//! what the chat platform shows.
//!
//! Bot messages get the complete text of the completion they came from,
//! including reasoning and tool tags. Completions that never became a chat
//! message (phantoms) are reinserted where they happened. Tool-call entries
//! whose raw text is already carried by a replayed completion are dropped.

use parley_core::{Activation, ContentBlock, ParticipantMessage};
use std::collections::{HashMap, HashSet};

use super::builder::{Entry, EntryKind};

pub(crate) fn replay(entries: &mut Vec<Entry>, activations: &[Activation], bot_name: &str) {
    if activations.is_empty() {
        return;
    }

    restore_bot_text(entries, activations);

    let completion_texts: HashSet<&str> = activations
        .iter()
        .flat_map(|a| a.completions.iter().map(|c| c.text.as_str()))
        .collect();
    entries.retain(|e| {
        !(e.kind == EntryKind::ToolCall
            && e.raw_model_text
                .as_deref()
                .is_some_and(|raw| completion_texts.contains(raw)))
    });

    for activation in activations {
        insert_phantoms(entries, activation, bot_name);
    }

    merge_activation_runs(entries);
}

fn restore_bot_text(entries: &mut [Entry], activations: &[Activation]) {
    let mut contexts: HashMap<String, (String, String)> = HashMap::new();
    for activation in activations {
        for (message_id, text) in activation.message_contexts() {
            contexts.insert(message_id, (activation.id.clone(), text));
        }
    }

    for entry in entries
        .iter_mut()
        .filter(|e| e.kind == EntryKind::Platform && e.from_bot)
    {
        let mut owner = None;
        let mut chunks: Vec<&str> = Vec::new();
        for piece in &entry.pieces {
            match contexts.get(&piece.id) {
                Some((activation_id, text)) => {
                    owner.get_or_insert_with(|| activation_id.clone());
                    if !text.is_empty() {
                        chunks.push(text);
                    }
                }
                None => chunks.push(&piece.text),
            }
        }
        if owner.is_some() {
            let text = chunks.join("\n");
            entry.set_text(text);
            entry.activation = owner;
        }
    }
}

fn insert_phantoms(entries: &mut Vec<Entry>, activation: &Activation, bot_name: &str) {
    let Some(anchor) = activation.anchor_message_id.as_deref() else {
        return;
    };
    let Some(anchor_pos) = entries.iter().position(|e| e.contains_message(anchor)) else {
        return;
    };

    let mut after = anchor_pos;
    for completion in activation.completions.iter().filter(|c| c.is_phantom()) {
        let result_pos = entries.iter().skip(anchor_pos + 1).position(|e| {
            e.kind == EntryKind::ToolResult
                && e.raw_model_text.as_deref() == Some(completion.text.as_str())
        });
        let at = match result_pos {
            Some(offset) => anchor_pos + 1 + offset,
            None => after + 1,
        };

        entries.insert(
            at,
            Entry {
                message: ParticipantMessage::new(
                    bot_name,
                    vec![ContentBlock::text(completion.text.clone())],
                ),
                kind: EntryKind::Phantom,
                from_bot: true,
                pieces: Vec::new(),
                raw_model_text: None,
                activation: Some(activation.id.clone()),
            },
        );
        if at <= after + 1 {
            after += 1;
        }
    }
}

/// Fold adjacent bot entries from the same activation into one.
fn merge_activation_runs(entries: &mut Vec<Entry>) {
    let mut merged: Vec<Entry> = Vec::with_capacity(entries.len());
    for entry in entries.drain(..) {
        let joinable = |e: &Entry| {
            e.from_bot && matches!(e.kind, EntryKind::Platform | EntryKind::Phantom)
        };
        match merged.last_mut() {
            Some(prev)
                if joinable(prev)
                    && joinable(&entry)
                    && prev.activation.is_some()
                    && prev.activation == entry.activation =>
            {
                let text = entry.message.text_content();
                let separator = if prev.message.text_content().ends_with(char::is_whitespace) {
                    ""
                } else {
                    "\n"
                };
                prev.message.push_text(separator, &text);
                if prev.message.source_message_id.is_none() {
                    prev.message.source_message_id = entry.message.source_message_id;
                    prev.message.timestamp = entry.message.timestamp;
                }
                if prev.kind == EntryKind::Phantom {
                    prev.kind = entry.kind;
                }
                prev.pieces.extend(entry.pieces);
            }
            _ => merged.push(entry),
        }
    }
    *entries = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::builder::Piece;
    use parley_core::TriggerKind;

    fn platform(id: &str, participant: &str, text: &str, from_bot: bool) -> Entry {
        Entry {
            message: ParticipantMessage::text(participant, text).with_source(id),
            kind: EntryKind::Platform,
            from_bot,
            pieces: vec![Piece {
                id: id.into(),
                text: text.into(),
            }],
            raw_model_text: None,
            activation: None,
        }
    }

    fn tool_result(raw: &str) -> Entry {
        Entry {
            message: ParticipantMessage::new(
                "System",
                vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "42".into(),
                    is_error: false,
                }],
            ),
            kind: EntryKind::ToolResult,
            from_bot: false,
            pieces: Vec::new(),
            raw_model_text: Some(raw.into()),
            activation: None,
        }
    }

    fn lines(entries: &[Entry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| match e.kind {
                EntryKind::ToolResult => "System: <result>".to_string(),
                _ => format!("{}: {}", e.message.participant, e.message.text_content()),
            })
            .collect()
    }

    #[test]
    fn bot_text_replaced_with_full_completion() {
        let mut entries = vec![
            platform("u1", "alice", "hi", false),
            platform("b1", "Parley", "hello", true),
        ];
        let mut act = Activation::new("ch", "bot", TriggerKind::Mention, Some("u1".into()));
        act.push_completion("<thinking>be nice</thinking>hello", vec!["b1".into()]);

        replay(&mut entries, &[act], "Parley");
        assert_eq!(
            lines(&entries),
            vec!["alice: hi", "Parley: <thinking>be nice</thinking>hello"]
        );
        assert_eq!(entries[1].message.source_message_id.as_deref(), Some("b1"));
    }

    #[test]
    fn phantom_inserted_before_its_tool_result() {
        let raw = "<thinking>need calc</thinking><calc>{}</calc>";
        let mut entries = vec![
            platform("u1", "alice", "what is 6*7", false),
            tool_result(raw),
            platform("b1", "Parley", "42", true),
        ];
        let mut act = Activation::new("ch", "bot", TriggerKind::Mention, Some("u1".into()));
        act.push_completion(raw, vec![]);
        act.push_completion("42", vec!["b1".into()]);

        replay(&mut entries, &[act], "Parley");
        assert_eq!(
            lines(&entries),
            vec![
                "alice: what is 6*7",
                format!("Parley: {raw}").as_str(),
                "System: <result>",
                "Parley: 42"
            ]
        );
    }

    #[test]
    fn phantoms_without_tool_follow_anchor_in_order() {
        let mut entries = vec![
            platform("u1", "alice", "think hard", false),
            platform("u2", "bob", "later", false),
        ];
        let mut act = Activation::new("ch", "bot", TriggerKind::Mention, Some("u1".into()));
        act.push_completion("<thinking>one</thinking>", vec![]);
        act.push_completion("<thinking>two</thinking>", vec![]);

        replay(&mut entries, &[act], "Parley");
        assert_eq!(
            lines(&entries),
            vec![
                "alice: think hard",
                "Parley: <thinking>one</thinking>\n<thinking>two</thinking>",
                "bob: later"
            ]
        );
    }

    #[test]
    fn duplicate_tool_call_dropped() {
        let raw = "checking <calc>{}</calc>";
        let mut call = platform("x", "Parley", "", true);
        call.kind = EntryKind::ToolCall;
        call.pieces.clear();
        call.message.source_message_id = None;
        call.raw_model_text = Some(raw.into());
        let mut entries = vec![
            platform("u1", "alice", "go", false),
            platform("b1", "Parley", "checking", true),
            call,
            tool_result(raw),
        ];
        let mut act = Activation::new("ch", "bot", TriggerKind::Mention, Some("u1".into()));
        act.push_completion(raw, vec!["b1".into()]);

        replay(&mut entries, &[act], "Parley");
        assert_eq!(
            lines(&entries),
            vec!["alice: go", format!("Parley: {raw}").as_str(), "System: <result>"]
        );
    }

    #[test]
    fn no_activations_is_identity() {
        let mut entries = vec![platform("b1", "Parley", "hello", true)];
        let before = entries.clone();
        replay(&mut entries, &[], "Parley");
        assert_eq!(entries, before);
    }
}
