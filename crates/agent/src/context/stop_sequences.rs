//! Stop sequences that keep the model from speaking for anyone else.

use parley_core::{ParticipantMessage, TransformMode};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::builder::SYSTEM_PARTICIPANT;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_][A-Za-z0-9_.-]*)").expect("valid mention regex"));

/// Derive stop sequences in priority order, capped at `max`.
///
/// Transcript-mode boundary markers come first, then the most recent
/// distinct participants (authors and `@mentioned` names), then configured
/// sequences.
pub(crate) fn stop_sequences(
    messages: &[ParticipantMessage],
    bot_name: &str,
    mode: TransformMode,
    participant_count: usize,
    configured: &[String],
    max: Option<usize>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if mode == TransformMode::Prefill {
        out.push(format!("\n{SYSTEM_PARTICIPANT}:"));
    }

    let mut seen: HashSet<String> = HashSet::new();
    'scan: for message in messages.iter().rev() {
        let text = message.text_content();
        // Mentioned names rank ahead of the author.
        let mentioned = MENTION_RE
            .captures_iter(&text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim_end_matches(['.', '-']).to_string());
        let names = mentioned.chain(std::iter::once(message.participant.clone()));

        for name in names {
            if seen.len() >= participant_count {
                break 'scan;
            }
            if name.is_empty() || name == bot_name || name == SYSTEM_PARTICIPANT {
                continue;
            }
            if seen.insert(name.clone()) {
                out.push(format!("\n{name}:"));
            }
        }
    }

    out.extend(configured.iter().cloned());

    let mut unique = HashSet::new();
    out.retain(|s| !s.is_empty() && unique.insert(s.clone()));
    if let Some(max) = max {
        out.truncate(max);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(participant: &str, text: &str) -> ParticipantMessage {
        ParticipantMessage::text(participant, text)
    }

    #[test]
    fn recent_participants_in_recency_order() {
        let messages = vec![msg("alice", "hi"), msg("bob", "yo"), msg("Parley", "hey"), msg("carol", "sup")];
        let stops = stop_sequences(&messages, "Parley", TransformMode::Prefill, 10, &[], None);
        assert_eq!(stops, vec!["\nSystem:", "\ncarol:", "\nbob:", "\nalice:"]);
    }

    #[test]
    fn mentions_count_as_participants() {
        let messages = vec![msg("alice", "ask @dave. and @Parley")];
        let stops = stop_sequences(&messages, "Parley", TransformMode::Chat, 10, &[], None);
        assert_eq!(stops, vec!["\ndave:", "\nalice:"]);
    }

    #[test]
    fn participant_count_limits_names() {
        let messages = vec![msg("a", "1"), msg("b", "2"), msg("c", "3")];
        let stops = stop_sequences(&messages, "Parley", TransformMode::Chat, 2, &[], None);
        assert_eq!(stops, vec!["\nc:", "\nb:"]);
    }

    #[test]
    fn configured_last_deduplicated_and_capped() {
        let messages = vec![msg("alice", "hi")];
        let configured = vec!["\nalice:".to_string(), "END".to_string(), String::new()];
        let stops = stop_sequences(&messages, "Parley", TransformMode::Prefill, 10, &configured, None);
        assert_eq!(stops, vec!["\nSystem:", "\nalice:", "END"]);

        let capped = stop_sequences(&messages, "Parley", TransformMode::Prefill, 10, &configured, Some(2));
        assert_eq!(capped, vec!["\nSystem:", "\nalice:"]);
    }

    #[test]
    fn duplicate_authors_collapse() {
        let messages = vec![msg("alice", "1"), msg("alice", "2")];
        let stops = stop_sequences(&messages, "Parley", TransformMode::Chat, 10, &[], None);
        assert_eq!(stops, vec!["\nalice:"]);
    }
}
