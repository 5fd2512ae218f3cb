//! Request layer: turns store records into self-contained inference tasks
//! and defines the result records the reasoning service sends back.

mod builder;
pub mod prompt;
mod task;
mod truncate;

pub use builder::{BuildOutput, Eligibility, RequestBuilder, TruncationBudgets};
pub use task::{InferenceResult, InferenceTask, Message, ResultOutput, TruncationNote};
pub use truncate::{truncate_field, truncate_history, TRUNCATION_MARKER};
