//! Activation decisions for a batch of events.
//!
//! Triggers are checked per message in strict priority order: a command
//! addressed to the bot, a direct mention, a reply to one of the bot's own
//! messages. Only when none match does the random trigger get a chance, with
//! a single sample drawn for the whole batch.

use parley_config::{BotConfig, ConfigSource};
use parley_core::{ChatMessage, Event, EventCategory, TriggerKind};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::state::ChannelStore;

/// A channel that should activate.
#[derive(Debug, Clone)]
pub struct Decision {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub trigger: TriggerKind,
    /// The message being answered; `None` for internal triggers.
    pub anchor_message_id: Option<String>,
    /// Command messages to delete and keep out of the context.
    pub commands: Vec<String>,
    /// Channel config, when deciding already needed it.
    pub config: Option<BotConfig>,
}

/// Evaluates batches against the bot's identity.
pub struct Decider<'a> {
    pub bot_id: &'a str,
    pub config: &'a BotConfig,
    pub source: &'a dyn ConfigSource,
    pub channels: &'a ChannelStore,
}

impl Decider<'_> {
    /// Decide which channels in `batch` activate. `sample` is a uniform draw
    /// in `[0, 1)` shared by the whole batch.
    pub async fn decide(&self, batch: &[Event], sample: f64) -> Vec<Decision> {
        let mut decisions = Vec::new();
        let mut configs: HashMap<String, Option<BotConfig>> = HashMap::new();

        for (channel_id, events) in group_by_channel(batch) {
            let guild_id = events.iter().find_map(|e| e.guild_id.clone());

            if events.iter().all(|e| e.category() == EventCategory::Internal) {
                debug!(channel_id, "Internal event, activating");
                decisions.push(Decision {
                    channel_id: channel_id.to_string(),
                    guild_id,
                    trigger: TriggerKind::Internal,
                    anchor_message_id: None,
                    commands: Vec::new(),
                    config: None,
                });
                continue;
            }

            let candidates: Vec<&ChatMessage> = events
                .iter()
                .filter_map(|e| e.new_message())
                .filter(|m| m.author_id != self.bot_id)
                .collect();
            let Some(latest) = candidates.last() else {
                continue;
            };

            let mut best: Option<(TriggerKind, &ChatMessage)> = None;
            let mut commands = Vec::new();
            for message in &candidates {
                let Some(kind) = self.classify(message) else {
                    continue;
                };
                if kind == TriggerKind::Command {
                    commands.push(message.id.clone());
                }
                if best.is_none_or(|(b, _)| rank(kind) >= rank(b)) {
                    best = Some((kind, message));
                }
            }

            let mut config = None;
            let chosen = match best {
                Some((kind, message)) => Some((kind, message.id.clone())),
                None => {
                    let loaded = match configs.get(channel_id) {
                        Some(c) => c.clone(),
                        None => {
                            let c = match self.source.load(channel_id, guild_id.as_deref()).await {
                                Ok(c) => Some(c),
                                Err(e) => {
                                    warn!(channel_id, error = %e, "Failed to load channel config");
                                    None
                                }
                            };
                            configs.insert(channel_id.to_string(), c.clone());
                            c
                        }
                    };
                    let hit = loaded
                        .as_ref()
                        .is_some_and(|c| random_hit(c.activation.reply_on_random, sample));
                    config = loaded;
                    hit.then(|| (TriggerKind::Random, latest.id.clone()))
                }
            };

            if let Some((trigger, anchor)) = chosen {
                debug!(channel_id, %trigger, anchor = %anchor, "Activation triggered");
                decisions.push(Decision {
                    channel_id: channel_id.to_string(),
                    guild_id,
                    trigger,
                    anchor_message_id: Some(anchor),
                    commands,
                    config,
                });
            }
        }

        decisions
    }

    fn classify(&self, message: &ChatMessage) -> Option<TriggerKind> {
        if self.is_command(message) {
            Some(TriggerKind::Command)
        } else if message.mentions_user(self.bot_id) {
            Some(TriggerKind::Mention)
        } else if message
            .reply_to
            .as_deref()
            .is_some_and(|id| self.channels.is_bot_message(id))
        {
            Some(TriggerKind::Reply)
        } else {
            None
        }
    }

    /// `<prefix><name> …`, `<prefix>@<name> …` or `<prefix><@id> …`.
    fn is_command(&self, message: &ChatMessage) -> bool {
        let prefix = &self.config.activation.command_prefix;
        if prefix.is_empty() {
            return false;
        }
        let Some(rest) = message.content.trim_start().strip_prefix(prefix.as_str()) else {
            return false;
        };

        let tag = format!("<@{}>", self.bot_id);
        if rest.starts_with(&tag) {
            return true;
        }

        let rest = rest.strip_prefix('@').unwrap_or(rest);
        let name = &self.config.name;
        rest.get(..name.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(name))
            && rest[name.len()..]
                .chars()
                .next()
                .is_none_or(|c| c.is_whitespace() || c.is_ascii_punctuation())
    }
}

fn rank(kind: TriggerKind) -> u8 {
    match kind {
        TriggerKind::Command => 3,
        TriggerKind::Mention => 2,
        TriggerKind::Reply => 1,
        TriggerKind::Random | TriggerKind::Internal => 0,
    }
}

/// One in `reply_on_random` chance; zero disables.
fn random_hit(reply_on_random: u32, sample: f64) -> bool {
    reply_on_random > 0 && sample < 1.0 / f64::from(reply_on_random)
}

/// Events grouped by channel, channels in order of first appearance.
fn group_by_channel(batch: &[Event]) -> Vec<(&str, Vec<&Event>)> {
    let mut groups: Vec<(&str, Vec<&Event>)> = Vec::new();
    for event in batch {
        match groups.iter_mut().find(|(c, _)| *c == event.channel_id) {
            Some((_, events)) => events.push(event),
            None => groups.push((event.channel_id.as_str(), vec![event])),
        }
    }
    groups
}
