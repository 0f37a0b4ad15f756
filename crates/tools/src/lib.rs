//! Tools for Parley.
//!
//! In-process plugins and remote tool-server tools both implement
//! `parley_core::Tool` and live in the same registry.

pub mod builtin;
pub mod protocol;

use parley_core::tool::ToolRegistry;
use std::sync::Arc;

pub use protocol::{RemoteOutput, RemoteTool, ToolProtocolClient, register_remote_tools};

/// Create a registry with the built-in plugins.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(builtin::ClockTool));
    registry
}
