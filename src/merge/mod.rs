//! Result merging and the per-stage failure ledger.

mod ledger;
mod merger;

pub use ledger::{ledger_keys, ledger_path, FailureEntry};
pub use merger::{MergeOutcome, ResultMerger};
