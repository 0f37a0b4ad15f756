//! JSON-lines activation store.
//!
//! One directory per (bot, channel) holding two append-only logs:
//!
//! ```text
//! {root}/{bot_id}/{channel_id}/tools.jsonl
//! {root}/{bot_id}/{channel_id}/activations.jsonl
//! ```
//!
//! Every record is a single JSON line appended and flushed before the call
//! returns. Unreadable lines are logged and skipped on read.

use async_trait::async_trait;
use parley_core::error::StoreError;
use parley_core::store::{activation_is_live, tool_record_is_live};
use parley_core::{Activation, ActivationStore, ChannelKey, ToolRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TOOLS_FILE: &str = "tools.jsonl";
const ACTIVATIONS_FILE: &str = "activations.jsonl";

/// File-backed append-only store.
pub struct JsonlStore {
    root: PathBuf,
    /// Serializes appends so concurrent writers never interleave lines.
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default location: `~/.parley/activations`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".parley").join("activations")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, key: &ChannelKey) -> PathBuf {
        self.root
            .join(sanitize_component(&key.bot_id))
            .join(sanitize_component(&key.channel_id))
    }

    async fn append<T: Serialize>(&self, key: &ChannelKey, file: &str, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize record: {e}")))?;
        line.push('\n');

        let dir = self.channel_dir(key);
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to create {}: {e}", dir.display())))?;

        let path = dir.join(file);
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open {}: {e}", path.display())))?;

        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to append to {}: {e}", path.display())))?;
        handle
            .sync_data()
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to sync {}: {e}", path.display())))?;

        debug!(key = %key, file, "Record appended");
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, key: &ChannelKey, file: &str) -> Result<Vec<T>, StoreError> {
        let path = self.channel_dir(key).join(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<T>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %path.display(), line = n + 1, error = %e, "Skipping corrupted record");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl ActivationStore for JsonlStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn record_tool_call(&self, key: &ChannelKey, record: &ToolRecord) -> Result<(), StoreError> {
        self.append(key, TOOLS_FILE, record).await
    }

    async fn record_activation(&self, key: &ChannelKey, activation: &Activation) -> Result<(), StoreError> {
        self.append(key, ACTIVATIONS_FILE, activation).await
    }

    async fn tool_history(
        &self,
        key: &ChannelKey,
        live_message_ids: &HashSet<String>,
    ) -> Result<Vec<ToolRecord>, StoreError> {
        let records: Vec<ToolRecord> = self.read_all(key, TOOLS_FILE).await?;
        Ok(records
            .into_iter()
            .filter(|r| tool_record_is_live(r, live_message_ids))
            .collect())
    }

    async fn activations(
        &self,
        key: &ChannelKey,
        live_message_ids: &HashSet<String>,
    ) -> Result<Vec<Activation>, StoreError> {
        let activations: Vec<Activation> = self.read_all(key, ACTIVATIONS_FILE).await?;
        Ok(activations
            .into_iter()
            .filter(|a| activation_is_live(a, live_message_ids))
            .collect())
    }
}

/// Keep a key component usable as a single path segment.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".into(),
        _ => cleaned,
    }
}
