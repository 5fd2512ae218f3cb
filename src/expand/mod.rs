//! Turn expansion into self-contained training samples.

mod expander;
mod sample;

pub use expander::{ExpandOutput, TurnExpander};
pub use sample::{HistoryTurn, SystemContext, TargetTurn, TrainingSample};
