//! Configuration loading, validation, and management for Parley.
//!
//! Loads the bot configuration from `~/.parley/config.toml` with environment
//! variable overrides, validates it at startup, and layers per-channel TOML
//! fragments (pinned in the channel) over it at activation time.

mod source;

pub use source::{ConfigSource, StaticConfigSource};

use parley_core::TransformMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// The bot's display name; also its participant name in transcripts
    #[serde(default = "default_name")]
    pub name: String,

    /// Model requested from the vendor router
    #[serde(default = "default_model")]
    pub model: String,

    /// Wire layout: continuation-style prefill or role-based chat
    #[serde(default)]
    pub mode: TransformMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Fallback API key for vendors without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub activation: ActivationConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub thinking: ThinkingConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Vendor catalogue, keyed by vendor name. When model patterns overlap,
    /// vendors are consulted in alphabetical order of name, not file order.
    #[serde(default)]
    pub vendors: BTreeMap<String, VendorConfig>,
}

fn default_name() -> String {
    "Parley".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    1.0
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("mode", &self.mode)
            .field("system_prompt", &self.system_prompt)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("api_key", &redact(&self.api_key))
            .field("activation", &self.activation)
            .field("context", &self.context)
            .field("tools", &self.tools)
            .field("thinking", &self.thinking)
            .field("chat", &self.chat)
            .field("retry", &self.retry)
            .field("vendors", &self.vendors)
            .finish()
    }
}

/// When the bot decides to respond.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Prefix for explicit commands (`!Parley do this`)
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Respond to roughly one in N batches at random; 0 disables
    #[serde(default)]
    pub reply_on_random: u32,
}

fn default_command_prefix() -> String {
    "!".into()
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            reply_on_random: 0,
        }
    }
}

/// Context window bounds and filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Normal message-count limit once a roll is due
    #[serde(default = "default_recency_window_messages")]
    pub recency_window_messages: usize,

    /// Normal character limit once a roll is due
    #[serde(default = "default_recency_window_characters")]
    pub recency_window_characters: usize,

    /// Payload ceiling that forces a roll regardless of the counter
    #[serde(default = "default_hard_max_characters")]
    pub hard_max_characters: usize,

    /// New messages tolerated before limits are enforced again
    #[serde(default = "default_rolling_threshold")]
    pub rolling_threshold: usize,

    /// Extra messages fetched beyond the recency window
    #[serde(default = "default_fetch_buffer")]
    pub fetch_buffer: usize,

    #[serde(default = "default_max_images")]
    pub max_images: usize,

    #[serde(default = "default_max_total_image_bytes")]
    pub max_total_image_bytes: usize,

    /// Hard per-image cap; larger images are recompressed or dropped
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Leading sentinel marking a message as hidden from context
    #[serde(default = "default_hidden_prefix")]
    pub hidden_prefix: String,

    /// Reaction that hides a message from context
    #[serde(default = "default_hide_reaction")]
    pub hide_reaction: String,

    /// How many recent participants become stop sequences
    #[serde(default = "default_participant_stop_count")]
    pub participant_stop_count: usize,

    /// User-configured stop sequences (lowest priority)
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

fn default_recency_window_messages() -> usize {
    400
}
fn default_recency_window_characters() -> usize {
    100_000
}
fn default_hard_max_characters() -> usize {
    500_000
}
fn default_rolling_threshold() -> usize {
    50
}
fn default_fetch_buffer() -> usize {
    50
}
fn default_max_images() -> usize {
    5
}
fn default_max_total_image_bytes() -> usize {
    3_000_000
}
fn default_max_image_bytes() -> usize {
    1_000_000
}
fn default_hidden_prefix() -> String {
    ".".into()
}
fn default_hide_reaction() -> String {
    "🫥".into()
}
fn default_participant_stop_count() -> usize {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recency_window_messages: default_recency_window_messages(),
            recency_window_characters: default_recency_window_characters(),
            hard_max_characters: default_hard_max_characters(),
            rolling_threshold: default_rolling_threshold(),
            fetch_buffer: default_fetch_buffer(),
            max_images: default_max_images(),
            max_total_image_bytes: default_max_total_image_bytes(),
            max_image_bytes: default_max_image_bytes(),
            hidden_prefix: default_hidden_prefix(),
            hide_reaction: default_hide_reaction(),
            participant_stop_count: default_participant_stop_count(),
            stop_sequences: Vec::new(),
        }
    }
}

impl ContextConfig {
    /// History depth requested from the platform.
    pub fn fetch_depth(&self) -> usize {
        self.recency_window_messages + self.fetch_buffer
    }
}

/// Tool loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Execution rounds before the loop returns a cap-reached completion
    #[serde(default = "default_max_tool_depth")]
    pub max_tool_depth: usize,

    /// Continuation requests allowed per model turn (prefill only)
    #[serde(default = "default_max_continuations")]
    pub max_continuations: usize,

    /// Deliver narrative text preceding a tool call before executing it
    #[serde(default = "default_true")]
    pub show_preamble: bool,

    /// Post each call and result as a hidden side message
    #[serde(default)]
    pub mirror_tool_calls: bool,
}

fn default_max_tool_depth() -> usize {
    8
}
fn default_max_continuations() -> usize {
    3
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tool_depth: default_max_tool_depth(),
            max_continuations: default_max_continuations(),
            show_preamble: true,
            mirror_tool_calls: false,
        }
    }
}

/// Reasoning ("thinking") handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    /// Replay the model's full past output into later contexts
    #[serde(default)]
    pub preserve_context: bool,

    /// Seed prefill completions with an opening thinking tag
    #[serde(default)]
    pub prefill: bool,

    /// Surface thinking as a side message
    #[serde(default)]
    pub show: bool,

    /// Above this many characters thinking is sent as an attachment
    #[serde(default = "default_attachment_threshold")]
    pub attachment_threshold: usize,
}

fn default_attachment_threshold() -> usize {
    1500
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self {
            preserve_context: false,
            prefill: false,
            show: false,
            attachment_threshold: default_attachment_threshold(),
        }
    }
}

/// Chat-mode extras.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_priming: Option<String>,

    #[serde(default)]
    pub respond_as_primer: bool,
}

/// Retry policy for vendor and platform calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fixed attempts per LLM call, no backoff
    #[serde(default = "default_llm_attempts")]
    pub llm_attempts: u32,

    #[serde(default = "default_platform_attempts")]
    pub platform_attempts: u32,

    #[serde(default = "default_platform_initial_backoff_ms")]
    pub platform_initial_backoff_ms: u64,

    #[serde(default = "default_platform_max_backoff_ms")]
    pub platform_max_backoff_ms: u64,
}

fn default_llm_attempts() -> u32 {
    3
}
fn default_platform_attempts() -> u32 {
    5
}
fn default_platform_initial_backoff_ms() -> u64 {
    500
}
fn default_platform_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            llm_attempts: default_llm_attempts(),
            platform_attempts: default_platform_attempts(),
            platform_initial_backoff_ms: default_platform_initial_backoff_ms(),
            platform_max_backoff_ms: default_platform_max_backoff_ms(),
        }
    }
}

/// Which wire format a vendor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorKind {
    Anthropic,
    OpenaiCompat,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    pub kind: VendorKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Glob patterns of model names this vendor serves
    #[serde(default)]
    pub models: Vec<String>,
}

impl std::fmt::Debug for VendorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("models", &self.models)
            .finish()
    }
}

impl BotConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment overrides:
    /// - `PARLEY_MODEL` replaces `model`
    /// - `PARLEY_API_KEY` fills `api_key` when unset
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str::<Self>(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("PARLEY_MODEL") {
            self.model = model;
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("PARLEY_API_KEY").ok();
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Directory holding the activation and tool logs.
    pub fn data_dir() -> PathBuf {
        Self::config_dir().join("logs")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError("name must not be empty".into()));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let ctx = &self.context;
        if ctx.rolling_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "context.rolling_threshold must be > 0".into(),
            ));
        }
        if ctx.hard_max_characters < ctx.recency_window_characters {
            return Err(ConfigError::ValidationError(
                "context.hard_max_characters must be >= context.recency_window_characters".into(),
            ));
        }
        if ctx.max_images > 0 && (ctx.max_total_image_bytes == 0 || ctx.max_image_bytes == 0) {
            return Err(ConfigError::ValidationError(
                "image byte budgets must be > 0 when context.max_images > 0".into(),
            ));
        }

        if self.tools.max_tool_depth > 64 {
            return Err(ConfigError::ValidationError(
                "tools.max_tool_depth must be <= 64".into(),
            ));
        }

        if self.retry.llm_attempts == 0 || self.retry.platform_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry attempts must be >= 1".into(),
            ));
        }

        for (name, vendor) in &self.vendors {
            if vendor.models.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "vendor '{name}' must list at least one model pattern"
                )));
            }
        }

        Ok(())
    }

    /// Layer per-channel TOML fragments over this config, in order.
    ///
    /// Each fragment is deep-merged (tables merge, everything else replaces)
    /// and the result re-validated. A fragment that fails to parse or
    /// validate is logged and skipped; earlier fragments still apply.
    pub fn with_overrides(&self, fragments: &[String]) -> Self {
        if fragments.is_empty() {
            return self.clone();
        }

        let mut current = self.clone();
        for (i, fragment) in fragments.iter().enumerate() {
            match current.merged_with(fragment) {
                Ok(next) => current = next,
                Err(e) => {
                    tracing::warn!(fragment = i, error = %e, "Skipping invalid config override");
                }
            }
        }
        current
    }

    fn merged_with(&self, fragment: &str) -> Result<Self, ConfigError> {
        let overlay: toml::Table = fragment
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::OverrideError(e.to_string()))?;
        let toml::Value::Table(base) =
            toml::Value::try_from(self).map_err(|e| ConfigError::OverrideError(e.to_string()))?
        else {
            return Err(ConfigError::OverrideError("config is not a table".into()));
        };

        let merged = merge_tables(base, overlay);
        let config: Self = toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::OverrideError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn merge_tables(mut base: toml::Table, overlay: toml::Table) -> toml::Table {
    for (key, value) in overlay {
        let merged = match (base.remove(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => {
                toml::Value::Table(merge_tables(b, o))
            }
            (_, v) => v,
        };
        base.insert(key, merged);
    }
    base
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            model: default_model(),
            mode: TransformMode::default(),
            system_prompt: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            api_key: None,
            activation: ActivationConfig::default(),
            context: ContextConfig::default(),
            tools: ToolsConfig::default(),
            thinking: ThinkingConfig::default(),
            chat: ChatConfig::default(),
            retry: RetryConfig::default(),
            vendors: BTreeMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid config override: {0}")]
    OverrideError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.name, "Parley");
        assert_eq!(config.mode, TransformMode::Prefill);
        assert_eq!(config.context.max_total_image_bytes, 3_000_000);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = BotConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: BotConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(
            parsed.context.rolling_threshold,
            config.context.rolling_threshold
        );
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = BotConfig {
            temperature: 5.0,
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hard_max_below_window_rejected() {
        let mut config = BotConfig::default();
        config.context.hard_max_characters = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hard_max_characters"));
    }

    #[test]
    fn vendor_without_models_rejected() {
        let toml_str = r#"
[vendors.anthropic]
kind = "anthropic"
"#;
        let config: BotConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = BotConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.name, "Parley");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name = "Ada"
mode = "chat"

[activation]
reply_on_random = 20

[tools]
max_tool_depth = 3

[vendors.anthropic]
kind = "anthropic"
models = ["claude-*"]
"#
        )
        .unwrap();

        let config = BotConfig::load_from(file.path()).unwrap();
        assert_eq!(config.name, "Ada");
        assert_eq!(config.mode, TransformMode::Chat);
        assert_eq!(config.activation.reply_on_random, 20);
        assert_eq!(config.tools.max_tool_depth, 3);
        assert_eq!(config.vendors["anthropic"].kind, VendorKind::Anthropic);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = [").unwrap();
        let err = BotConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn overrides_deep_merge_in_order() {
        let base = BotConfig::default();
        let merged = base.with_overrides(&[
            "[context]\nrolling_threshold = 10\nmax_images = 2".into(),
            "[context]\nmax_images = 1".into(),
        ]);
        assert_eq!(merged.context.rolling_threshold, 10);
        assert_eq!(merged.context.max_images, 1);
        // Untouched fields in a merged table survive.
        assert_eq!(merged.context.recency_window_characters, 100_000);
    }

    #[test]
    fn invalid_override_is_skipped() {
        let base = BotConfig::default();
        let merged = base.with_overrides(&[
            "temperature = 9.0".into(),
            "not toml at all [".into(),
            "name = \"Override\"".into(),
        ]);
        assert_eq!(merged.temperature, 1.0);
        assert_eq!(merged.name, "Override");
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = BotConfig {
            api_key: Some("sk-secret".into()),
            ..BotConfig::default()
        };
        config.vendors.insert(
            "openai".into(),
            VendorConfig {
                kind: VendorKind::OpenaiCompat,
                api_key: Some("sk-other".into()),
                api_url: None,
                models: vec!["gpt-*".into()],
            },
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("sk-other"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = BotConfig::default_toml();
        assert!(toml_str.contains("rolling_threshold"));
        assert!(toml_str.contains("prefill"));
    }
}
