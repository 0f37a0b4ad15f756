//! The activation pipeline — the heart of Parley.
//!
//! Events arrive on the [`EventQueue`]; the [`Pipeline`] decides which
//! channels respond and runs one activation per channel at a time:
//!
//! 1. **Decide** whether a batch addresses the bot (command, mention, reply,
//!    or a random draw)
//! 2. **Fetch** bounded history and **build** the context window
//! 3. **Loop** through model turns and tool calls
//! 4. **Deliver** the reply and **update** channel state
//!
//! A failed activation sends nothing more and leaves channel state as it was.

pub mod context;
pub mod deliver;
pub mod pipeline;
pub mod queue;
pub mod state;
pub mod tool_loop;
pub mod tool_parse;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use context::{BuiltContext, ContextBuilder, ContextInput};
pub use pipeline::{ActivationReport, Pipeline, Sampler, TickOutcome};
pub use queue::EventQueue;
pub use state::{ChannelLease, ChannelState, ChannelStore};
pub use tool_loop::{LoopOutcome, ToolLoop};
pub use trigger::{Decider, Decision};
