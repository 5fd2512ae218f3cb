//! Error types for roleplay-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Record store access (line-delimited files, identity resolution)
//! - Tag parsing of annotated turn text
//! - Split allocation planning
//! - Calls to the external reasoning service

use thiserror::Error;

/// Errors that can occur while reading or writing record files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate identity key '{0}'")]
    DuplicateKey(String),

    #[error("Corpus file '{path}' could not be ingested: {reason}")]
    Ingest { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist '{path}': {reason}")]
    Persist { path: String, reason: String },
}

/// Structural errors raised by the tag parser.
///
/// Offsets are byte offsets into the parsed text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagParseError {
    #[error("Unknown marker '<{name}>' at offset {offset}")]
    UnknownMarker { name: String, offset: usize },

    #[error("Marker '<{inner}>' at offset {offset} opened inside '<{outer}>'")]
    NestedMarker {
        outer: String,
        inner: String,
        offset: usize,
    },

    #[error("Closing marker '</{found}>' at offset {offset} does not match '{expected}'")]
    MismatchedClose {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("Segment '<{name}>' opened at offset {offset} is never closed")]
    Unterminated { name: String, offset: usize },

    #[error("Text contains no segments")]
    Empty,
}

/// Errors that make a split plan impossible to satisfy.
///
/// These are raised before any split file is written.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Carve-out '{split}' requests {requested} samples but only {available} are eligible")]
    CarveOutTooLarge {
        split: String,
        requested: usize,
        available: usize,
    },

    #[error("Carve-out '{split}' requests {requested} '{category}' samples but the bucket holds {available}")]
    QuotaTooLarge {
        split: String,
        category: String,
        requested: usize,
        available: usize,
    },

    #[error("Carve-out '{split}' needs {requested} '{category}' samples but conversation claims left {taken}")]
    CarveOutShort {
        split: String,
        category: String,
        requested: usize,
        taken: usize,
    },

    #[error("Shares for category '{category}' sum to {total:.4}, expected 1.0")]
    SharesDoNotSumToOne { category: String, total: f64 },

    #[error("Split '{0}' is referenced but not declared")]
    UnknownSplit(String),

    #[error("Split '{0}' is declared more than once")]
    DuplicateSplit(String),

    #[error("Sample '{0}' appears more than once in the pool")]
    DuplicateSample(String),

    #[error("Invalid split plan: {0}")]
    InvalidPlan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by a reasoning service call.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Service returned no content")]
    EmptyResponse,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ServiceError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServiceError::Configuration(_))
    }
}
