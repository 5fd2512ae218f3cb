//! Stage bookkeeping: end-of-stage summaries, shared counters for
//! concurrent stages, and manifests that version a stage output by the
//! content hash of its input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::StoreError;
use crate::store::jsonl::write_atomic;

/// Counts reported at the end of every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub processed: usize,
    pub merged: usize,
    pub repaired: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Stage-specific counters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, usize>,
}

impl StageSummary {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    /// Increments a stage-specific counter.
    pub fn bump(&mut self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &str, n: usize) {
        *self.extra.entry(name.to_string()).or_insert(0) += n;
    }

    pub fn extra(&self, name: &str) -> usize {
        self.extra.get(name).copied().unwrap_or(0)
    }

    pub fn log(&self) {
        info!(
            stage = %self.stage,
            processed = self.processed,
            merged = self.merged,
            repaired = self.repaired,
            failed = self.failed,
            skipped = self.skipped,
            extra = ?self.extra,
            "Stage complete"
        );
    }
}

/// Shared atomic counters for stages that run work concurrently.
///
/// Cloned into worker futures and incremented with `fetch_add`.
#[derive(Debug, Clone, Default)]
pub struct StageCounters {
    pub processed: Arc<AtomicUsize>,
    pub merged: Arc<AtomicUsize>,
    pub repaired: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub skipped: Arc<AtomicUsize>,
    pub retried: Arc<AtomicUsize>,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values as a summary.
    pub fn snapshot(&self, stage: &str) -> StageSummary {
        let mut summary = StageSummary::new(stage);
        summary.processed = self.processed.load(Ordering::Relaxed);
        summary.merged = self.merged.load(Ordering::Relaxed);
        summary.repaired = self.repaired.load(Ordering::Relaxed);
        summary.failed = self.failed.load(Ordering::Relaxed);
        summary.skipped = self.skipped.load(Ordering::Relaxed);
        summary.add("retried", self.retried.load(Ordering::Relaxed));
        summary
    }
}

/// Side file recording which input produced a stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: String,
    /// SHA-256 of the stage input(s).
    pub input_digest: String,
    /// SHA-256 of the stage configuration.
    pub config_digest: String,
    pub output: PathBuf,
    pub summary: StageSummary,
    pub generated_at: DateTime<Utc>,
}

impl StageManifest {
    pub fn new(
        summary: StageSummary,
        input_digest: impl Into<String>,
        config_digest: impl Into<String>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage: summary.stage.clone(),
            input_digest: input_digest.into(),
            config_digest: config_digest.into(),
            output: output.into(),
            summary,
            generated_at: Utc::now(),
        }
    }

    /// `<output>.manifest.json` next to the output.
    pub fn path_for(output: &Path) -> PathBuf {
        let mut name = output
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".manifest.json");
        output.with_file_name(name)
    }

    pub async fn load(output: &Path) -> Result<Option<Self>, StoreError> {
        let path = Self::path_for(output);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content).ok())
    }

    pub async fn write(&self) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(self)?;
        write_atomic(&Self::path_for(&self.output), body.as_bytes()).await
    }

    /// Whether this manifest was produced from the same input and
    /// configuration, and its output still exists.
    pub fn is_current(&self, input_digest: &str, config_digest: &str) -> bool {
        self.input_digest == input_digest
            && self.config_digest == config_digest
            && self.output.exists()
    }
}

/// Returns the manifest when `output` is already up to date for the given
/// digests, so the caller can skip the stage.
pub async fn up_to_date(
    output: &Path,
    input_digest: &str,
    config_digest: &str,
) -> Result<Option<StageManifest>, StoreError> {
    Ok(StageManifest::load(output)
        .await?
        .filter(|m| m.is_current(input_digest, config_digest)))
}
