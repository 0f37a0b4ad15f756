//! Context assembly: channel history in, bounded conversation out.
//!
//! | Module | Step |
//! |--------|------|
//! | `builder` | Merge, filter, normalize, interleave tool calls, cache marker |
//! | `images` | Newest-first image selection under count and byte budgets |
//! | `replay` | Restore stored model output (reasoning, phantoms) |
//! | `bound` | Rolling truncation against character and message limits |
//! | `stop_sequences` | Participant-derived stop sequences |

pub mod builder;
pub mod images;

mod bound;
mod replay;
mod stop_sequences;

pub use builder::{BuiltContext, ContextBuilder, ContextInput, SYSTEM_PARTICIPANT, UNCACHED_TAIL_MESSAGES};
pub use images::{ImageBudget, fit_image, select_images};
