//! roleplay-forge: role-play training data from annotated book dialogue.
//!
//! The pipeline ingests novels into a record store, layers inner thought,
//! plans and enriched character settings onto dialogue turns through an
//! external reasoning service, expands conversations into per-turn training
//! samples and allocates them into training splits.

pub mod allocate;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod expand;
pub mod merge;
pub mod pipeline;
pub mod repair;
pub mod request;
pub mod store;
pub mod tags;

// Re-export commonly used error types
pub use error::{AllocationError, ServiceError, StoreError, TagParseError};
pub use pipeline::ConfigError;
