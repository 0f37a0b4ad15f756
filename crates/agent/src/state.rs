//! Per-channel state and the busy set.
//!
//! [`ChannelStore`] owns every piece of mutable per-channel data the
//! pipeline keeps between activations. A channel's state can only be reached
//! through a [`ChannelLease`], and at most one lease per channel exists at a
//! time. Acquiring fails (rather than waits) when the channel is busy.

use parking_lot::Mutex;
use parley_core::{ChannelKey, ToolRecord};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// How many of the bot's own message IDs are remembered for reply detection.
const BOT_MESSAGE_MEMORY: usize = 10_000;

/// Mutable record for one (bot, channel).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelState {
    /// Tool calls and results for this channel, oldest first.
    pub tool_cache: Vec<ToolRecord>,

    /// Whether `tool_cache` has been loaded from the durable log.
    pub tool_cache_loaded: bool,

    /// Message ID ending the cacheable prefix in the last request.
    pub last_cache_marker: Option<String>,

    /// Messages seen since the context window was last truncated.
    pub messages_since_roll: usize,

    /// Newest message in the previous activation's window.
    pub newest_seen_message_id: Option<String>,

    /// First message of the bounded window; fetches extend back to it.
    pub oldest_message_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    busy: HashSet<ChannelKey>,
    states: HashMap<ChannelKey, ChannelState>,
    bot_message_ids: HashSet<String>,
    bot_message_order: VecDeque<String>,
}

/// Keyed store of channel state, owned by the pipeline.
#[derive(Default)]
pub struct ChannelStore {
    inner: Mutex<Inner>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the channel busy and take its state. `None` if the channel
    /// already has an activation in flight.
    pub fn try_acquire(self: &Arc<Self>, key: &ChannelKey) -> Option<ChannelLease> {
        let mut inner = self.inner.lock();
        if !inner.busy.insert(key.clone()) {
            return None;
        }
        let state = inner.states.get(key).cloned().unwrap_or_default();
        Some(ChannelLease {
            store: Arc::clone(self),
            key: key.clone(),
            original: state.clone(),
            state,
            committed: false,
        })
    }

    pub fn is_busy(&self, key: &ChannelKey) -> bool {
        self.inner.lock().busy.contains(key)
    }

    pub fn busy_count(&self) -> usize {
        self.inner.lock().busy.len()
    }

    /// Snapshot of a channel's state.
    pub fn state(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.inner.lock().states.get(key).cloned()
    }

    /// Remember message IDs the bot sent.
    pub fn track_bot_messages<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock();
        for id in ids {
            let id = id.into();
            if inner.bot_message_ids.insert(id.clone()) {
                inner.bot_message_order.push_back(id);
            }
        }
        while inner.bot_message_order.len() > BOT_MESSAGE_MEMORY {
            if let Some(old) = inner.bot_message_order.pop_front() {
                inner.bot_message_ids.remove(&old);
            }
        }
    }

    pub fn is_bot_message(&self, id: &str) -> bool {
        self.inner.lock().bot_message_ids.contains(id)
    }

    fn release(&self, key: &ChannelKey, state: ChannelState) {
        let mut inner = self.inner.lock();
        inner.states.insert(key.clone(), state);
        inner.busy.remove(key);
    }
}

/// Exclusive access to one channel's state for the length of an activation.
///
/// Dropping the lease frees the channel. Changes are kept only if
/// [`ChannelLease::commit`] was called; otherwise the state reverts and the
/// tool cache is reloaded from the durable log next time, since the log may
/// hold calls the failed activation made.
pub struct ChannelLease {
    store: Arc<ChannelStore>,
    key: ChannelKey,
    original: ChannelState,
    state: ChannelState,
    committed: bool,
}

impl ChannelLease {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ChannelState {
        &mut self.state
    }

    /// Keep the working state and free the channel.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let state = if self.committed {
            std::mem::take(&mut self.state)
        } else {
            let mut original = std::mem::take(&mut self.original);
            original.tool_cache_loaded = false;
            original.tool_cache.clear();
            original
        };
        self.store.release(&self.key, state);
    }
}
