//! Local platform — an in-process chat service.
//!
//! Holds channel history in memory. Messages from people are posted with
//! [`LocalPlatform::post`]; the bot's sends land in the same history so
//! later fetches see them. With echo enabled, everything the bot sends is
//! also printed to stdout, which is how `parley chat` talks to a terminal.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::error::PlatformError;
use parley_core::platform::Attachment;
use parley_core::{ChatMessage, FetchRequest, FetchedContext, FetchedImage, Platform};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Messages longer than this are split into several sends.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Default)]
struct ChannelData {
    messages: Vec<ChatMessage>,
    images: HashMap<String, FetchedImage>,
    pinned_config: Vec<String>,
}

/// A file uploaded through [`Platform::send_attachment`].
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub message_id: String,
    pub filename: String,
    pub content: Vec<u8>,
}

/// In-memory platform.
pub struct LocalPlatform {
    bot_id: String,
    bot_name: String,
    guild_id: Option<String>,
    echo: bool,
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, ChannelData>>,
    uploads: Mutex<Vec<UploadedFile>>,
    deleted: Mutex<Vec<String>>,
    typing: Mutex<HashMap<String, bool>>,
}

impl LocalPlatform {
    pub fn new(bot_id: impl Into<String>, bot_name: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            bot_name: bot_name.into(),
            guild_id: None,
            echo: false,
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            typing: Mutex::new(HashMap::new()),
        }
    }

    /// Print the bot's sends to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    fn allocate_id(&self) -> String {
        format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Post a message from a person. Returns the stored message.
    pub fn post(
        &self,
        channel_id: &str,
        author_id: &str,
        author_name: &str,
        content: &str,
    ) -> ChatMessage {
        self.post_mentioning(channel_id, author_id, author_name, content, Vec::new())
    }

    /// Post a message that mentions the given user IDs.
    pub fn post_mentioning(
        &self,
        channel_id: &str,
        author_id: &str,
        author_name: &str,
        content: &str,
        mentions: Vec<String>,
    ) -> ChatMessage {
        let mut message =
            ChatMessage::new(self.allocate_id(), channel_id, author_id, author_name, content);
        message.mentions = mentions;
        self.insert(message.clone());
        message
    }

    /// Store a fully-built message as-is (mentions, replies, reactions).
    pub fn insert(&self, message: ChatMessage) {
        let mut channels = self.channels.lock();
        channels
            .entry(message.channel_id.clone())
            .or_default()
            .messages
            .push(message);
    }

    /// Attach image bytes to an existing message.
    pub fn attach_image(&self, channel_id: &str, message_id: &str, media_type: &str, data: Vec<u8>) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(channel_id.to_string()).or_default();
        if let Some(message) = channel.messages.iter_mut().find(|m| m.id == message_id) {
            message.attachments.push(Attachment {
                id: format!("{message_id}-img{}", message.attachments.len()),
                filename: "image".into(),
                media_type: Some(media_type.to_string()),
                url: None,
                size_bytes: Some(data.len() as u64),
            });
        }
        channel.images.insert(
            message_id.to_string(),
            FetchedImage {
                message_id: message_id.to_string(),
                media_type: media_type.to_string(),
                data,
            },
        );
    }

    /// Add a reaction to a stored message.
    pub fn react(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<(), PlatformError> {
        let mut channels = self.channels.lock();
        let message = channels
            .get_mut(channel_id)
            .and_then(|c| c.messages.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| PlatformError::NotFound(message_id.to_string()))?;
        message.reactions.push(emoji.to_string());
        Ok(())
    }

    /// Pin a config fragment in a channel.
    pub fn pin_config(&self, channel_id: &str, fragment: impl Into<String>) {
        self.channels
            .lock()
            .entry(channel_id.to_string())
            .or_default()
            .pinned_config
            .push(fragment.into());
    }

    /// Snapshot of a channel's history.
    pub fn history(&self, channel_id: &str) -> Vec<ChatMessage> {
        self.channels
            .lock()
            .get(channel_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Messages sent by the bot in a channel, oldest first.
    pub fn sent_by_bot(&self, channel_id: &str) -> Vec<ChatMessage> {
        self.history(channel_id)
            .into_iter()
            .filter(|m| m.author_id == self.bot_id)
            .collect()
    }

    pub fn uploads(&self) -> Vec<UploadedFile> {
        self.uploads.lock().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn is_typing(&self, channel_id: &str) -> bool {
        self.typing.lock().get(channel_id).copied().unwrap_or(false)
    }

    fn append_from(&self, channel_id: &str, author_id: &str, author_name: &str, text: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            if self.echo {
                println!("{author_name}: {chunk}");
            }
            let message = ChatMessage::new(self.allocate_id(), channel_id, author_id, author_name, chunk);
            ids.push(message.id.clone());
            self.insert(message);
        }
        ids
    }
}

#[async_trait]
impl Platform for LocalPlatform {
    fn name(&self) -> &str {
        "local"
    }

    async fn fetch_context(
        &self,
        channel_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedContext, PlatformError> {
        let channels = self.channels.lock();
        let Some(channel) = channels.get(channel_id) else {
            return Ok(FetchedContext {
                guild_id: self.guild_id.clone(),
                ..FetchedContext::default()
            });
        };

        let visible: Vec<&ChatMessage> = channel
            .messages
            .iter()
            .filter(|m| !request.exclude.contains(&m.id))
            .collect();

        let default_start = visible.len().saturating_sub(request.depth);
        let start = request
            .oldest_anchor
            .as_ref()
            .and_then(|anchor| visible.iter().position(|m| &m.id == anchor))
            .filter(|&pos| visible.len() - pos <= request.depth.saturating_mul(2))
            .unwrap_or(default_start);

        let messages: Vec<ChatMessage> = visible[start..].iter().map(|m| (*m).clone()).collect();
        let images = messages
            .iter()
            .filter_map(|m| channel.images.get(&m.id).cloned())
            .collect();

        debug!(channel_id, count = messages.len(), "Fetched local history");
        Ok(FetchedContext {
            messages,
            images,
            pinned_config: channel.pinned_config.clone(),
            guild_id: self.guild_id.clone(),
        })
    }

    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Vec<String>, PlatformError> {
        let ids = self.append_from(channel_id, &self.bot_id, &self.bot_name, text);
        if let (Some(reply_to), Some(first)) = (reply_to, ids.first()) {
            let mut channels = self.channels.lock();
            if let Some(message) = channels
                .get_mut(channel_id)
                .and_then(|c| c.messages.iter_mut().find(|m| &m.id == first))
            {
                message.reply_to = Some(reply_to.to_string());
            }
        }
        Ok(ids)
    }

    async fn send_attachment(
        &self,
        channel_id: &str,
        filename: &str,
        content: &[u8],
        caption: Option<&str>,
    ) -> Result<Vec<String>, PlatformError> {
        let id = self.allocate_id();
        let mut message = ChatMessage::new(
            id.clone(),
            channel_id,
            &self.bot_id,
            &self.bot_name,
            caption.unwrap_or_default(),
        );
        message.attachments.push(Attachment {
            id: format!("{id}-file"),
            filename: filename.to_string(),
            media_type: Some("text/plain".into()),
            url: None,
            size_bytes: Some(content.len() as u64),
        });
        if self.echo {
            println!("{}: [{filename}, {} bytes] {}", self.bot_name, content.len(), caption.unwrap_or_default());
        }
        self.insert(message);
        self.uploads.lock().push(UploadedFile {
            message_id: id.clone(),
            filename: filename.to_string(),
            content: content.to_vec(),
        });
        Ok(vec![id])
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), PlatformError> {
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(channel_id)
            .ok_or_else(|| PlatformError::NotFound(message_id.to_string()))?;
        let before = channel.messages.len();
        channel.messages.retain(|m| m.id != message_id);
        if channel.messages.len() == before {
            return Err(PlatformError::NotFound(message_id.to_string()));
        }
        channel.images.remove(message_id);
        self.deleted.lock().push(message_id.to_string());
        Ok(())
    }

    async fn start_typing(&self, channel_id: &str) -> Result<(), PlatformError> {
        self.typing.lock().insert(channel_id.to_string(), true);
        Ok(())
    }

    async fn stop_typing(&self, channel_id: &str) -> Result<(), PlatformError> {
        self.typing.lock().insert(channel_id.to_string(), false);
        Ok(())
    }

    async fn send_webhook(
        &self,
        channel_id: &str,
        text: &str,
        display_name: &str,
    ) -> Result<Vec<String>, PlatformError> {
        Ok(self.append_from(channel_id, &format!("webhook:{display_name}"), display_name, text))
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring a
/// newline in the second half of the window, then a space.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset of the char boundary after `max_chars` characters.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());

        let end = if limit == remaining.len() {
            limit
        } else {
            let window = &remaining[..limit];
            match window.rfind('\n') {
                Some(pos) if pos >= limit / 2 => pos + 1,
                _ => window.rfind(' ').map(|pos| pos + 1).filter(|&p| p > 0).unwrap_or(limit),
            }
        };

        chunks.push(remaining[..end].to_string());
        remaining = &remaining[end..];
    }

    chunks
}
