//! Stage plumbing shared by every command.
//!
//! Each stage is a function from one on-disk record set to another. A stage
//! output is written atomically together with a [`StageManifest`] naming the
//! SHA-256 of its input and of its configuration, so an unchanged stage can
//! be skipped on re-run.
//!
//! - **Config**: [`PipelineConfig`], environment driven with builder overrides
//! - **Stage**: end-of-stage summaries, shared counters and manifests

pub mod config;
pub mod stage;

pub use config::{ConfigError, PipelineConfig};
pub use stage::{up_to_date, StageCounters, StageManifest, StageSummary};
