//! The activation pipeline.
//!
//! ```text
//! Idle → Polling → Deciding → Idle
//!                          ↘ Activating → ToolLoop → Delivering → UpdatingState → Idle
//! ```
//!
//! One cooperative loop polls the [`EventQueue`]; every accepted activation
//! runs as its own task. A channel with an activation in flight drops new
//! batches until it finishes. A failed activation sends nothing further and
//! leaves the channel state as it was.

use parley_channels::{BackoffPolicy, RetryingPlatform};
use parley_config::{BotConfig, ConfigSource, StaticConfigSource};
use parley_core::store::tool_record_is_live;
use parley_core::{
    Activation, ActivationStore, ChannelKey, Error, FetchRequest, LlmRequest, Platform,
    ToolRecord, ToolRegistry, TransformMode, TriggerKind, Vendor,
};
use parley_providers::RetryingVendor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::{ContextBuilder, ContextInput};
use crate::deliver::deliver;
use crate::queue::EventQueue;
use crate::state::{ChannelLease, ChannelStore};
use crate::tool_loop::ToolLoop;
use crate::trigger::{Decider, Decision};

/// Sleep between polls of an empty queue.
pub const IDLE_POLL: Duration = Duration::from_millis(100);

/// Pause after an activation task panicked. Release builds abort on panic,
/// so this only applies to builds with unwinding.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Uniform `[0, 1)` source for the random trigger.
pub type Sampler = Arc<dyn Fn() -> f64 + Send + Sync>;

/// What a finished activation did.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationReport {
    pub channel_id: String,
    pub activation_id: String,
    pub trigger: TriggerKind,
    /// Every chat message the activation sent, preambles included.
    pub sent_message_ids: Vec<String>,
    pub tool_depth: usize,
    pub did_truncate: bool,
}

/// Result of one poll.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Events consumed from the queue.
    pub events: usize,
    /// Activations started by this batch.
    pub spawned: Vec<JoinHandle<parley_core::Result<ActivationReport>>>,
}

/// Polls events and runs activations for one bot.
#[derive(Clone)]
pub struct Pipeline {
    bot_id: String,
    config: BotConfig,
    config_source: Arc<dyn ConfigSource>,
    platform: Arc<dyn Platform>,
    vendor: Arc<dyn Vendor>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ActivationStore>,
    queue: Arc<EventQueue>,
    channels: Arc<ChannelStore>,
    sampler: Sampler,
}

impl Pipeline {
    pub fn new(
        bot_id: impl Into<String>,
        config: BotConfig,
        platform: Arc<dyn Platform>,
        vendor: Arc<dyn Vendor>,
        store: Arc<dyn ActivationStore>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            config_source: Arc::new(StaticConfigSource::new(config.clone())),
            config,
            platform,
            vendor,
            tools: Arc::new(ToolRegistry::new()),
            store,
            queue: Arc::new(EventQueue::new()),
            channels: Arc::new(ChannelStore::new()),
            sampler: Arc::new(rand::random::<f64>),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// Supply per-channel base configs instead of the one passed to `new`.
    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = source;
        self
    }

    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn channels(&self) -> Arc<ChannelStore> {
        Arc::clone(&self.channels)
    }

    /// Poll one batch, decide, and spawn the accepted activations.
    pub async fn tick(&self) -> TickOutcome {
        let batch = self.queue.poll_batch();
        if batch.is_empty() {
            return TickOutcome::default();
        }

        let sample = (self.sampler)();
        let decisions = Decider {
            bot_id: &self.bot_id,
            config: &self.config,
            source: self.config_source.as_ref(),
            channels: &self.channels,
        }
        .decide(&batch, sample)
        .await;
        debug!(events = batch.len(), activations = decisions.len(), "Batch decided");

        let mut spawned = Vec::new();
        for decision in decisions {
            let key = ChannelKey::new(&self.bot_id, &decision.channel_id);
            let Some(lease) = self.channels.try_acquire(&key) else {
                debug!(channel_id = %decision.channel_id, "Channel busy, dropping batch");
                continue;
            };
            let pipeline = self.clone();
            spawned.push(tokio::spawn(async move {
                pipeline.run_activation(decision, lease).await
            }));
        }

        TickOutcome {
            events: batch.len(),
            spawned,
        }
    }

    /// Poll until `shutdown` turns true (or its sender goes away), then wait
    /// for in-flight activations.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(bot_id = %self.bot_id, "Pipeline started");
        let mut in_flight: Vec<JoinHandle<parley_core::Result<ActivationReport>>> = Vec::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.tick().await;
            in_flight.extend(outcome.spawned);
            let crashed = reap_finished(&mut in_flight).await;

            let pause = if crashed {
                Some(ERROR_BACKOFF)
            } else if outcome.events == 0 {
                Some(IDLE_POLL)
            } else {
                None
            };
            match pause {
                Some(pause) => {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }

        info!(in_flight = in_flight.len(), "Pipeline stopping, draining activations");
        for handle in in_flight {
            if let Err(e) = handle.await {
                error!(error = %e, "Activation task failed during shutdown");
            }
        }
    }

    async fn run_activation(
        &self,
        decision: Decision,
        mut lease: ChannelLease,
    ) -> parley_core::Result<ActivationReport> {
        let channel_id = decision.channel_id.clone();
        let config = match decision.config.clone() {
            Some(c) => c,
            None => self
                .config_source
                .load(&channel_id, decision.guild_id.as_deref())
                .await
                .map_err(|e| Error::Config {
                    message: e.to_string(),
                })?,
        };

        let platform = RetryingPlatform::new(
            Arc::clone(&self.platform),
            BackoffPolicy::from_config(&config.retry),
        );
        info!(channel_id = %channel_id, trigger = %decision.trigger, "Activation started");

        if let Err(e) = platform.start_typing(&channel_id).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to start typing");
        }
        let result = self.activate(&platform, config, &decision, &mut lease).await;
        if let Err(e) = platform.stop_typing(&channel_id).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to stop typing");
        }

        match result {
            Ok(report) => {
                lease.commit();
                info!(
                    channel_id = %channel_id,
                    trigger = %report.trigger,
                    depth = report.tool_depth,
                    sent = report.sent_message_ids.len(),
                    "Activation finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(channel_id = %channel_id, error = %e, "Activation failed");
                Err(e)
            }
        }
    }

    async fn activate(
        &self,
        platform: &dyn Platform,
        config: BotConfig,
        decision: &Decision,
        lease: &mut ChannelLease,
    ) -> parley_core::Result<ActivationReport> {
        let key = lease.key().clone();
        let channel_id = key.channel_id.as_str();

        for id in &decision.commands {
            if let Err(e) = platform.delete_message(channel_id, id).await {
                warn!(channel_id, message_id = %id, error = %e, "Failed to delete command message");
            }
        }

        let fetched = platform
            .fetch_context(
                channel_id,
                &FetchRequest {
                    depth: config.context.fetch_depth(),
                    oldest_anchor: lease.state().oldest_message_id.clone(),
                    exclude: decision.commands.clone(),
                },
            )
            .await?;
        let config = config.with_overrides(&fetched.pinned_config);
        let live = fetched.message_ids();

        // Tool history is read from the log once, then kept in memory.
        if !lease.state().tool_cache_loaded {
            let history = self.store.tool_history(&key, &live).await?;
            let state = lease.state_mut();
            state.tool_cache = history;
            state.tool_cache_loaded = true;
        }
        let tool_records: Vec<ToolRecord> = lease
            .state()
            .tool_cache
            .iter()
            .filter(|r| tool_record_is_live(r, &live))
            .cloned()
            .collect();
        // Records anchored outside the window are gone for good.
        lease.state_mut().tool_cache = tool_records.clone();
        let activations = if config.thinking.preserve_context {
            self.store.activations(&key, &live).await?
        } else {
            Vec::new()
        };

        let new_messages = match &lease.state().newest_seen_message_id {
            Some(newest) => match fetched.messages.iter().position(|m| &m.id == newest) {
                Some(pos) => fetched.messages.len() - pos - 1,
                None => fetched.messages.len(),
            },
            None => fetched.messages.len(),
        };
        let since_roll = lease.state().messages_since_roll + new_messages;

        let vendor = RetryingVendor::new(Arc::clone(&self.vendor), config.retry.llm_attempts);
        let built = ContextBuilder::new(&config).build(&ContextInput {
            messages: &fetched.messages,
            images: &fetched.images,
            tool_records: &tool_records,
            activations: &activations,
            bot_id: &self.bot_id,
            messages_since_roll: since_roll,
            last_cache_marker: lease.state().last_cache_marker.as_deref(),
            max_stop_sequences: vendor.max_stop_sequences(&config.model),
        });
        debug!(
            channel_id,
            messages = built.messages.len(),
            truncated = built.did_truncate,
            "Context built"
        );

        let mut request = build_request(&config, built.messages.clone(), built.stop_sequences.clone());
        if config.tools.enabled {
            request.tools = self.tools.definitions();
        }

        let mut activation = Activation::new(
            channel_id,
            &self.bot_id,
            decision.trigger,
            decision.anchor_message_id.clone(),
        );
        let anchor = decision.anchor_message_id.as_deref();
        let outcome = ToolLoop {
            vendor: &vendor,
            platform,
            tools: &self.tools,
            store: self.store.as_ref(),
            config: &config,
            key: &key,
            trigger_message_id: anchor,
        }
        .run(&mut request, &mut activation, lease.state_mut())
        .await?;

        let sent = deliver(platform, &config, channel_id, &outcome.final_text, anchor).await?;
        activation.push_completion(outcome.final_text, sent);
        activation.finish();

        let sent_ids: Vec<String> = activation.sent_message_ids().map(str::to_string).collect();
        self.channels.track_bot_messages(sent_ids.iter().cloned());
        self.store.record_activation(&key, &activation).await?;

        let state = lease.state_mut();
        if built.did_truncate {
            state.messages_since_roll = 0;
            state.oldest_message_id = built.oldest_message_id.clone();
        } else {
            state.messages_since_roll = since_roll;
            if state.oldest_message_id.is_none() {
                state.oldest_message_id = built.oldest_message_id.clone();
            }
        }
        state.last_cache_marker = built.cache_marker.clone();
        if let Some(newest) = fetched.messages.last() {
            state.newest_seen_message_id = Some(newest.id.clone());
        }

        Ok(ActivationReport {
            channel_id: channel_id.to_string(),
            activation_id: activation.id,
            trigger: decision.trigger,
            sent_message_ids: sent_ids,
            tool_depth: outcome.depth,
            did_truncate: built.did_truncate,
        })
    }
}

fn build_request(
    config: &BotConfig,
    messages: Vec<parley_core::ParticipantMessage>,
    stop_sequences: Vec<String>,
) -> LlmRequest {
    let mut request = LlmRequest::new(&config.model, &config.name)
        .with_messages(messages)
        .with_mode(config.mode);
    request.system_prompt = config.system_prompt.clone();
    request.stop_sequences = stop_sequences;
    request.max_tokens = config.max_tokens;
    request.temperature = config.temperature;
    request.prefill_thinking = config.thinking.prefill && config.mode == TransformMode::Prefill;
    request.persona_priming = config.chat.persona_priming.clone();
    request.respond_as_primer = config.chat.respond_as_primer;
    request
}

/// Collect finished tasks. Returns whether any of them panicked.
async fn reap_finished(handles: &mut Vec<JoinHandle<parley_core::Result<ActivationReport>>>) -> bool {
    let mut crashed = false;
    let mut i = 0;
    while i < handles.len() {
        if !handles[i].is_finished() {
            i += 1;
            continue;
        }
        if let Err(e) = handles.swap_remove(i).await {
            error!(error = %e, "Activation task panicked");
            crashed = true;
        }
    }
    crashed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SYSTEM_PARTICIPANT;
    use crate::testing::{EchoTool, ScriptedVendor};
    use parley_channels::LocalPlatform;
    use parley_core::{ChatMessage, ContentBlock, Event, LlmCompletion};
    use parley_memory::InMemoryStore;

    const BOT: &str = "bot";

    struct Rig {
        platform: Arc<LocalPlatform>,
        vendor: Arc<ScriptedVendor>,
        store: Arc<InMemoryStore>,
        echo: Arc<EchoTool>,
        pipeline: Pipeline,
    }

    fn rig_with(config: BotConfig, script: Vec<LlmCompletion>) -> Rig {
        let platform = Arc::new(LocalPlatform::new(BOT, "Parley"));
        let vendor = Arc::new(ScriptedVendor::new(script));
        let store = Arc::new(InMemoryStore::new());
        let echo = Arc::new(EchoTool::default());
        let mut tools = ToolRegistry::new();
        tools.register(echo.clone());
        let pipeline = Pipeline::new(BOT, config, platform.clone(), vendor.clone(), store.clone())
            .with_tools(tools)
            .with_sampler(Arc::new(|| 0.99));
        Rig {
            platform,
            vendor,
            store,
            echo,
            pipeline,
        }
    }

    fn rig(script: Vec<LlmCompletion>) -> Rig {
        let mut config = BotConfig::default();
        config.retry.platform_initial_backoff_ms = 1;
        config.retry.platform_max_backoff_ms = 2;
        rig_with(config, script)
    }

    fn mention(rig: &Rig, author: &str, text: &str) -> ChatMessage {
        let id = format!("u-{}", rig.platform.history("ch").len());
        let mut m = ChatMessage::new(id, "ch", author, author, text);
        m.mentions.push(BOT.into());
        rig.platform.insert(m.clone());
        rig.pipeline.queue().push(Event::message(m.clone()));
        m
    }

    async fn tick_and_wait(rig: &Rig) -> Vec<parley_core::Result<ActivationReport>> {
        let outcome = rig.pipeline.tick().await;
        let mut results = Vec::new();
        for handle in outcome.spawned {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn mention_gets_a_reply() {
        let r = rig(vec![LlmCompletion::text("Hi alice!")]);
        let trigger = mention(&r, "alice", "hello bot");

        let results = tick_and_wait(&r).await;
        let report = results[0].as_ref().unwrap();
        assert_eq!(report.trigger, TriggerKind::Mention);

        let sent = r.platform.sent_by_bot("ch");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "Hi alice!");
        assert_eq!(sent[0].reply_to.as_deref(), Some(trigger.id.as_str()));
        assert!(!r.platform.is_typing("ch"));

        let key = ChannelKey::new(BOT, "ch");
        let state = r.pipeline.channels().state(&key).unwrap();
        assert_eq!(state.messages_since_roll, 1);
        assert_eq!(state.newest_seen_message_id.as_deref(), Some(trigger.id.as_str()));
        assert_eq!(state.last_cache_marker.as_deref(), Some(trigger.id.as_str()));
        assert!(r.pipeline.channels().is_bot_message(&sent[0].id));

        let activations = r.store.all_activations(&key).await;
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].completions[0].sent_message_ids, vec![sent[0].id.clone()]);
    }

    #[tokio::test]
    async fn request_carries_context_and_stops() {
        let r = rig(vec![LlmCompletion::text("ok")]);
        mention(&r, "alice", "first");
        tick_and_wait(&r).await;

        let request = &r.vendor.requests()[0];
        assert_eq!(request.bot_name, "Parley");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].participant, "alice");
        assert!(request.stop_sequences.contains(&"\nalice:".to_string()));
        assert_eq!(request.tools.len(), 1);
    }

    #[tokio::test]
    async fn busy_channel_drops_batch() {
        let r = rig(vec![LlmCompletion::text("never")]);
        let key = ChannelKey::new(BOT, "ch");
        let lease = r.pipeline.channels().try_acquire(&key).unwrap();

        mention(&r, "alice", "anyone?");
        let outcome = r.pipeline.tick().await;
        assert_eq!(outcome.events, 1);
        assert!(outcome.spawned.is_empty());
        assert!(r.pipeline.queue().is_empty());
        drop(lease);
        assert!(r.vendor.requests().is_empty());
    }

    #[tokio::test]
    async fn unaddressed_batch_takes_no_lock() {
        let r = rig(vec![]);
        let m = ChatMessage::new("x", "ch", "alice", "alice", "chatter");
        r.pipeline.queue().push(Event::message(m));
        let outcome = r.pipeline.tick().await;
        assert!(outcome.spawned.is_empty());
        assert_eq!(r.pipeline.channels().busy_count(), 0);
    }

    #[tokio::test]
    async fn failed_activation_leaves_state_untouched() {
        // Empty script: every vendor call fails.
        let r = rig(vec![]);
        mention(&r, "alice", "hello");
        let results = tick_and_wait(&r).await;
        assert!(matches!(results[0], Err(Error::Vendor(_))));

        assert!(r.platform.sent_by_bot("ch").is_empty());
        assert!(!r.platform.is_typing("ch"));
        let key = ChannelKey::new(BOT, "ch");
        let state = r.pipeline.channels().state(&key).unwrap();
        assert_eq!(state.messages_since_roll, 0);
        assert!(state.last_cache_marker.is_none());
        assert!(!r.pipeline.channels().is_busy(&key));
        // Retried the configured number of times.
        assert_eq!(r.vendor.requests().len(), 3);
    }

    #[tokio::test]
    async fn command_is_deleted_and_excluded() {
        let r = rig(vec![LlmCompletion::text("done")]);
        r.platform.post("ch", "alice", "alice", "some context");
        let command = r.platform.post("ch", "bob", "bob", "!parley summarize");
        r.pipeline.queue().push(Event::message(command.clone()));

        let results = tick_and_wait(&r).await;
        assert_eq!(results[0].as_ref().unwrap().trigger, TriggerKind::Command);
        assert_eq!(r.platform.deleted(), vec![command.id.clone()]);
        let request = &r.vendor.requests()[0];
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].text_content(), "some context");
    }

    #[tokio::test]
    async fn tool_calls_persist_and_reappear_next_time() {
        let r = rig(vec![
            LlmCompletion::text(r#"<echo>{"text": "42"}</echo>"#),
            LlmCompletion::text("The answer is 42."),
            LlmCompletion::text("Still 42."),
        ]);
        let first = mention(&r, "alice", "what is it?");
        tick_and_wait(&r).await;
        assert_eq!(r.echo.count(), 1);

        mention(&r, "alice", "again?");
        tick_and_wait(&r).await;

        let third = &r.vendor.requests()[2];
        let participants: Vec<&str> = third.messages.iter().map(|m| m.participant.as_str()).collect();
        assert_eq!(participants, vec!["alice", "Parley", "System", "Parley", "alice"]);
        assert_eq!(third.messages[0].source_message_id.as_deref(), Some(first.id.as_str()));
        assert!(matches!(
            &third.messages[2].content[0],
            ContentBlock::ToolResult { content, .. } if content == "42"
        ));
    }

    #[tokio::test]
    async fn tool_cache_drops_records_outside_window() {
        let r = rig(vec![
            LlmCompletion::text(r#"<echo>{"text": "42"}</echo>"#),
            LlmCompletion::text("The answer is 42."),
            LlmCompletion::text("Fresh start."),
        ]);
        let first = mention(&r, "alice", "what is it?");
        tick_and_wait(&r).await;
        let key = ChannelKey::new(BOT, "ch");
        assert_eq!(r.pipeline.channels().state(&key).unwrap().tool_cache.len(), 1);

        r.platform.delete_message("ch", &first.id).await.unwrap();
        mention(&r, "alice", "new topic");
        tick_and_wait(&r).await;

        assert!(r.pipeline.channels().state(&key).unwrap().tool_cache.is_empty());
        let last = r.vendor.requests().pop().unwrap();
        assert!(last.messages.iter().all(|m| m.participant != SYSTEM_PARTICIPANT));
    }

    #[tokio::test]
    async fn panicked_activation_is_reaped_as_crash() {
        async fn explode() -> parley_core::Result<ActivationReport> {
            panic!("activation blew up")
        }
        let mut handles = vec![tokio::spawn(explode())];
        while !handles[0].is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(reap_finished(&mut handles).await);
        assert!(handles.is_empty());
    }

    #[tokio::test]
    async fn reply_to_bot_triggers() {
        let r = rig(vec![LlmCompletion::text("first"), LlmCompletion::text("second")]);
        mention(&r, "alice", "hi");
        tick_and_wait(&r).await;
        let bot_msg = r.platform.sent_by_bot("ch")[0].id.clone();

        let mut reply = ChatMessage::new("u-reply", "ch", "bob", "bob", "really?");
        reply.reply_to = Some(bot_msg);
        r.platform.insert(reply.clone());
        r.pipeline.queue().push(Event::message(reply));
        let results = tick_and_wait(&r).await;
        assert_eq!(results[0].as_ref().unwrap().trigger, TriggerKind::Reply);
    }

    #[tokio::test]
    async fn truncation_resets_counter_and_anchors_window() {
        let mut config = BotConfig::default();
        config.context.recency_window_messages = 3;
        config.context.rolling_threshold = 4;
        let r = rig_with(config, vec![LlmCompletion::text("ok")]);
        for i in 0..5 {
            r.platform.post("ch", "alice", "alice", &format!("msg {i}"));
        }
        mention(&r, "bob", "summarize");

        let results = tick_and_wait(&r).await;
        assert!(results[0].as_ref().unwrap().did_truncate);
        let key = ChannelKey::new(BOT, "ch");
        let state = r.pipeline.channels().state(&key).unwrap();
        assert_eq!(state.messages_since_roll, 0);

        let request = &r.vendor.requests()[0];
        assert_eq!(request.messages.len(), 3);
        assert_eq!(
            state.oldest_message_id,
            request.messages[0].source_message_id
        );
    }

    #[tokio::test]
    async fn run_loop_answers_and_stops() {
        let r = rig(vec![LlmCompletion::text("looped")]);
        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn(r.pipeline.clone().run(rx));

        mention(&r, "alice", "hey");
        tokio::time::timeout(Duration::from_secs(5), async {
            while r.platform.sent_by_bot("ch").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.platform.sent_by_bot("ch")[0].content, "looped");
    }
}
