//! Failure ledger: keys a merge pass could not annotate.
//!
//! The ledger separates attempted-and-failed keys from keys that were never
//! attempted, so a later run can retarget only true failures.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{read_jsonl_if_exists, IdentityKey, Stage};

/// One key without a validated annotation after merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub key: IdentityKey,
    pub stage: Stage,
    /// Highest attempt number seen for the key.
    pub attempts: u32,
    pub last_error: String,
    /// The attempt budget is spent.
    pub exhausted: bool,
}

/// `<dir>/<stage>.failed.jsonl`
pub fn ledger_path(dir: &Path, stage: Stage) -> PathBuf {
    dir.join(format!("{}.failed.jsonl", stage))
}

/// Keys listed in a ledger file. With `exhausted_only`, keys that may still
/// be retried by the dispatcher are left out.
pub async fn ledger_keys(
    path: &Path,
    exhausted_only: bool,
) -> Result<BTreeSet<IdentityKey>, StoreError> {
    let read = read_jsonl_if_exists::<FailureEntry>(path).await?;
    Ok(read
        .items
        .into_iter()
        .filter(|entry| !exhausted_only || entry.exhausted)
        .map(|entry| entry.key)
        .collect())
}
