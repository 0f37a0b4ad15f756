//! Window bounding with rolling truncation.
//!
//! The window normally grows untouched so the cached prompt prefix stays
//! valid. It is cut back only when it passes the hard character ceiling, or
//! once enough new messages have arrived since the last roll.

use super::builder::Entry;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub normal_chars: usize,
    pub max_messages: usize,
    pub hard_max_chars: usize,
    pub rolling_threshold: usize,
}

/// Bound `entries` in place. Returns whether the window was truncated.
pub(crate) fn bound(entries: &mut Vec<Entry>, messages_since_roll: usize, limits: &Limits) -> bool {
    let total: usize = entries.iter().map(|e| e.message.payload_chars()).sum();

    if total > limits.hard_max_chars {
        tracing::info!(
            total_chars = total,
            hard_max = limits.hard_max_chars,
            "Context over hard limit, truncating"
        );
        trim_oldest(entries, limits);
        return true;
    }

    if messages_since_roll >= limits.rolling_threshold {
        let before = entries.len();
        trim_oldest(entries, limits);
        return entries.len() < before;
    }

    false
}

/// Drop the oldest entries until both the character and count limits hold.
fn trim_oldest(entries: &mut Vec<Entry>, limits: &Limits) {
    let mut total: usize = entries.iter().map(|e| e.message.payload_chars()).sum();
    let mut start = 0;
    while start < entries.len()
        && (total > limits.normal_chars || entries.len() - start > limits.max_messages)
    {
        total -= entries[start].message.payload_chars();
        start += 1;
    }
    entries.drain(..start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::builder::EntryKind;
    use parley_core::ParticipantMessage;

    fn entry(chars: usize) -> Entry {
        Entry {
            message: ParticipantMessage::text("alice", "x".repeat(chars)),
            kind: EntryKind::Platform,
            from_bot: false,
            pieces: Vec::new(),
            raw_model_text: None,
            activation: None,
        }
    }

    fn limits() -> Limits {
        Limits {
            normal_chars: 100,
            max_messages: 3,
            hard_max_chars: 500,
            rolling_threshold: 10,
        }
    }

    #[test]
    fn under_threshold_is_identity() {
        let mut entries: Vec<Entry> = (0..8).map(|_| entry(40)).collect();
        assert!(!bound(&mut entries, 9, &limits()));
        assert_eq!(entries.len(), 8);
    }

    #[test]
    fn hard_limit_always_truncates() {
        let mut entries: Vec<Entry> = (0..6).map(|_| entry(100)).collect();
        assert!(bound(&mut entries, 0, &limits()));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn threshold_enforces_message_count() {
        let mut entries: Vec<Entry> = (0..5).map(|_| entry(1)).collect();
        assert!(bound(&mut entries, 10, &limits()));
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn threshold_with_nothing_to_cut_is_not_a_truncation() {
        let mut entries: Vec<Entry> = (0..2).map(|_| entry(1)).collect();
        assert!(!bound(&mut entries, 10, &limits()));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn single_oversized_entry_is_dropped() {
        let mut entries = vec![entry(600)];
        assert!(bound(&mut entries, 0, &limits()));
        assert!(entries.is_empty());
    }
}
