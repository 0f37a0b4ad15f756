//! Platform connectors for Parley.
//!
//! - **Local** — in-process chat history, used by `parley chat` and tests
//! - **Backoff** — exponential-backoff wrapper around any platform

pub mod backoff;
pub mod local;

pub use backoff::{BackoffPolicy, RetryingPlatform};
pub use local::{LocalPlatform, UploadedFile, split_message};
