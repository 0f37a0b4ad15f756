//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Vendor errors ---
    #[error("Vendor error: {0}")]
    Vendor(#[from] VendorError),

    // --- Platform errors ---
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum VendorError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by vendor, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("No vendor registered for model: {0}")]
    NoVendorForModel(String),

    #[error("Vendor '{vendor}' does not support {mode} mode")]
    UnsupportedMode { vendor: String, mode: String },

    #[error("Invalid vendor response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("Failed to fetch context for {channel}: {reason}")]
    FetchFailed { channel: String, reason: String },

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Platform connection lost: {0}")]
    ConnectionLost(String),
}

impl PlatformError {
    /// Whether retrying the same operation could succeed.
    ///
    /// A missing message stays missing; everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted record in {path}: {reason}")]
    Corrupted { path: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool server '{server}' failed: {reason}")]
    Protocol { server: String, reason: String },
}
