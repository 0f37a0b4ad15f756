//! LLM vendor implementations for Parley.
//!
//! All vendors implement the `parley_core::Vendor` trait. The router picks
//! a vendor by model name; [`transform`] lays a normalized request out as
//! turns before each vendor serializes it.

pub mod anthropic;
pub mod openai_compat;
pub mod retry;
pub mod router;
pub mod transform;

pub use anthropic::AnthropicVendor;
pub use openai_compat::OpenAiCompatVendor;
pub use retry::RetryingVendor;
pub use router::{VendorRouter, build_from_config};
pub use transform::{WireConversation, WirePart, WireRole, WireTurn, transform};
