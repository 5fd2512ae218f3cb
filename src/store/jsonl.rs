//! Line-delimited JSON files.
//!
//! Readers are lenient: a malformed line is logged and counted, never fatal.
//! Writers replace the target atomically by writing a sibling temporary file
//! and renaming it over the destination.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::StoreError;

/// Items read from a JSONL source plus the number of lines that were skipped.
#[derive(Debug)]
pub struct JsonlRead<T> {
    pub items: Vec<T>,
    pub skipped: usize,
}

impl<T> Default for JsonlRead<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            skipped: 0,
        }
    }
}

/// Parses JSONL content, skipping blank lines and counting malformed ones.
pub fn parse_jsonl<T: DeserializeOwned>(content: &str, origin: &str) -> JsonlRead<T> {
    let mut read = JsonlRead::default();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => read.items.push(item),
            Err(e) => {
                warn!(path = origin, line = idx + 1, error = %e, "Skipping malformed line");
                read.skipped += 1;
            }
        }
    }
    read
}

/// Reads a JSONL file.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<JsonlRead<T>, StoreError> {
    let content = fs::read_to_string(path).await?;
    Ok(parse_jsonl(&content, &path.display().to_string()))
}

/// Reads a JSONL file, returning an empty result when it does not exist yet.
pub async fn read_jsonl_if_exists<T: DeserializeOwned>(
    path: &Path,
) -> Result<JsonlRead<T>, StoreError> {
    if fs::try_exists(path).await? {
        read_jsonl(path).await
    } else {
        Ok(JsonlRead::default())
    }
}

/// Lists the `*.jsonl` files under `path` in lexical order.
///
/// A plain file is returned as-is, so callers can accept either a single
/// results file or a directory of result shards.
pub fn jsonl_sources(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    files.sort();
    files
}

/// Reads every JSONL source under `path` (file or directory) in lexical order.
pub async fn read_jsonl_sources<T: DeserializeOwned>(
    path: &Path,
) -> Result<JsonlRead<T>, StoreError> {
    let mut all = JsonlRead::default();
    for source in jsonl_sources(path) {
        let read = read_jsonl::<T>(&source).await?;
        all.items.extend(read.items);
        all.skipped += read.skipped;
    }
    Ok(all)
}

/// Serializes items to JSONL text, one compact object per line.
pub fn to_jsonl<T: Serialize>(items: &[T]) -> Result<String, StoreError> {
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    Ok(out)
}

/// Atomically replaces `path` with `contents`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Persist {
            path: path.display().to_string(),
            reason: "path has no file name".to_string(),
        })?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let persisted = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = persisted {
        // The write error is reported, not a failed cleanup.
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::Persist {
            path: path.display().to_string(),
            reason: e.to_string(),
        });
    }
    Ok(())
}

/// Atomically writes items as JSONL. Returns the number of lines written.
pub async fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<usize, StoreError> {
    let body = to_jsonl(items)?;
    write_atomic(path, body.as_bytes()).await?;
    Ok(items.len())
}

/// Appends items to a JSONL file, creating it when missing.
pub async fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let body = to_jsonl(items)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Hex SHA-256 of a byte slice.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 over every JSONL source under `path`, in lexical order.
pub async fn digest_sources(path: &Path) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();
    for source in jsonl_sources(path) {
        let bytes = fs::read(&source).await?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}
