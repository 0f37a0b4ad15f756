//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley chat-agent runtime.
//! This crate performs **no I/O** — it defines the domain model that the
//! pipeline, the vendors, the platform connectors and the stores implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`Platform`] — the chat platform connector (fetch / send / delete / typing)
//! - [`Vendor`] — an LLM vendor speaking one wire format
//! - [`Tool`] — a capability the model may invoke (plugin or remote tool server)
//! - [`ActivationStore`] — append-only log of activations and tool calls
//!
//! Implementations live in their respective crates, which keeps the
//! dependency graph pointing inward and makes every seam mockable in tests.

pub mod activation;
pub mod error;
pub mod event;
pub mod message;
pub mod platform;
pub mod store;
pub mod tool;
pub mod vendor;

// Re-export key types at crate root for ergonomics
pub use activation::{Activation, Completion, TriggerKind};
pub use error::{Error, Result};
pub use event::{Event, EventCategory, EventKind};
pub use message::{ContentBlock, ParticipantMessage};
pub use platform::{ChatMessage, FetchRequest, FetchedContext, FetchedImage, Platform};
pub use store::{ActivationStore, ChannelKey, ToolRecord};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolRegistry, ToolResult};
pub use vendor::{LlmCompletion, LlmRequest, StopReason, TransformMode, Usage, Vendor};
