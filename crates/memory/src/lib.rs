//! Activation and tool-call persistence for Parley.
//!
//! Both stores implement `parley_core::ActivationStore`: append-only logs
//! keyed by (bot, channel), read back filtered to messages still present.

pub mod in_memory;
pub mod jsonl;

pub use in_memory::InMemoryStore;
pub use jsonl::JsonlStore;
