//! Pipeline configuration shared by every stage command.
//!
//! Values come from defaults, then `ROLEFORGE_*` environment variables, then
//! command-line flags applied through the `with_*` builders.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::request::TruncationBudgets;
use crate::store::digest_bytes;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Paths
    /// Directory holding the raw book files.
    pub corpus_root: PathBuf,
    /// Directory for stage outputs, manifests and ledgers.
    pub work_dir: PathBuf,

    // Request building
    pub budgets: TruncationBudgets,
    /// Participants that narrate; never targets of a task or sample.
    pub narrators: Vec<String>,
    /// Also rebuild tasks for keys whose annotation is unstructured.
    pub retarget_unstructured: bool,

    // Dispatch
    pub max_attempts: u32,
    pub concurrency: usize,
    pub retry_backoff: Duration,
    pub model: String,
    /// Base URL of the OpenAI-compatible endpoint.
    pub api_base: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,

    // Allocation
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            corpus_root: PathBuf::from("./corpus"),
            work_dir: PathBuf::from("./work"),

            budgets: TruncationBudgets::default(),
            narrators: vec!["Environment".to_string()],
            retarget_unstructured: false,

            max_attempts: 3,
            concurrency: 16,
            retry_backoff: Duration::from_secs(2),
            model: "reasoning".to_string(),
            api_base: String::new(),
            api_key: None,
            request_timeout: Duration::from_secs(300),

            seed: 42,
        }
    }
}

/// Settings that change what a stage produces. Hashed into manifests.
#[derive(Serialize)]
struct DigestedSettings<'a> {
    stage: &'a str,
    budgets: &'a TruncationBudgets,
    narrators: &'a [String],
    retarget_unstructured: bool,
    max_attempts: u32,
    seed: u64,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ROLEFORGE_CORPUS_ROOT`: Raw corpus directory (default: ./corpus)
    /// - `ROLEFORGE_WORK_DIR`: Stage output directory (default: ./work)
    /// - `ROLEFORGE_PROFILE_BUDGET`: Characters of the acting profile (default: 1500)
    /// - `ROLEFORGE_OTHER_PROFILE_BUDGET`: Characters per other profile (default: 500)
    /// - `ROLEFORGE_EXCERPT_BUDGET`: Characters of source excerpt (default: 6000)
    /// - `ROLEFORGE_HISTORY_BUDGET`: Characters of history (default: 8000)
    /// - `ROLEFORGE_NARRATORS`: Comma-separated narrator names (default: Environment)
    /// - `ROLEFORGE_RETARGET_UNSTRUCTURED`: Rebuild unstructured keys (default: false)
    /// - `ROLEFORGE_MAX_ATTEMPTS`: Attempts per task (default: 3)
    /// - `ROLEFORGE_CONCURRENCY`: Tasks in flight (default: 16)
    /// - `ROLEFORGE_RETRY_BACKOFF_SECS`: Base retry delay (default: 2)
    /// - `ROLEFORGE_MODEL`: Model name sent to the service (default: reasoning)
    /// - `ROLEFORGE_API_BASE`: Service base URL (required for dispatch)
    /// - `ROLEFORGE_API_KEY`: Bearer token (optional)
    /// - `ROLEFORGE_REQUEST_TIMEOUT_SECS`: Per-request timeout (default: 300)
    /// - `ROLEFORGE_SEED`: Allocation seed (default: 42)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ROLEFORGE_CORPUS_ROOT") {
            config.corpus_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ROLEFORGE_WORK_DIR") {
            config.work_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ROLEFORGE_PROFILE_BUDGET") {
            config.budgets.profile_chars = parse_env_value(&val, "ROLEFORGE_PROFILE_BUDGET")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_OTHER_PROFILE_BUDGET") {
            config.budgets.other_profile_chars =
                parse_env_value(&val, "ROLEFORGE_OTHER_PROFILE_BUDGET")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_EXCERPT_BUDGET") {
            config.budgets.excerpt_chars = parse_env_value(&val, "ROLEFORGE_EXCERPT_BUDGET")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_HISTORY_BUDGET") {
            config.budgets.history_chars = parse_env_value(&val, "ROLEFORGE_HISTORY_BUDGET")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_NARRATORS") {
            config.narrators = parse_list(&val);
        }

        if let Ok(val) = std::env::var("ROLEFORGE_RETARGET_UNSTRUCTURED") {
            config.retarget_unstructured = parse_env_bool(&val, "ROLEFORGE_RETARGET_UNSTRUCTURED")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "ROLEFORGE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "ROLEFORGE_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_RETRY_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "ROLEFORGE_RETRY_BACKOFF_SECS")?;
            config.retry_backoff = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ROLEFORGE_MODEL") {
            config.model = val;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_API_BASE") {
            config.api_base = val;
        }

        if let Ok(val) = std::env::var("ROLEFORGE_API_KEY") {
            config.api_key = Some(val).filter(|k| !k.is_empty());
        }

        if let Ok(val) = std::env::var("ROLEFORGE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ROLEFORGE_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ROLEFORGE_SEED") {
            config.seed = parse_env_value(&val, "ROLEFORGE_SEED")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budgets = [
            ("profile budget", self.budgets.profile_chars),
            ("other profile budget", self.budgets.other_profile_chars),
            ("excerpt budget", self.budgets.excerpt_chars),
            ("history budget", self.budgets.history_chars),
        ];
        for (name, value) in budgets {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model cannot be empty".to_string(),
            ));
        }

        if self.narrators.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "narrator names cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks the settings only dispatch needs.
    pub fn require_service(&self) -> Result<(), ConfigError> {
        if self.api_base.is_empty() {
            return Err(ConfigError::MissingEnvVar("ROLEFORGE_API_BASE".to_string()));
        }
        Ok(())
    }

    /// SHA-256 over the settings that shape `stage`'s output.
    pub fn digest_for(&self, stage: &str) -> String {
        let settings = DigestedSettings {
            stage,
            budgets: &self.budgets,
            narrators: &self.narrators,
            retarget_unstructured: self.retarget_unstructured,
            max_attempts: self.max_attempts,
            seed: self.seed,
        };
        // Plain data; serialization cannot fail.
        let body = serde_json::to_vec(&settings).unwrap_or_default();
        digest_bytes(&body)
    }

    pub fn with_corpus_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.corpus_root = path.into();
        self
    }

    pub fn with_work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_dir = path.into();
        self
    }

    pub fn with_budgets(mut self, budgets: TruncationBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_narrators(mut self, narrators: Vec<String>) -> Self {
        self.narrators = narrators;
        self
    }

    pub fn with_retarget_unstructured(mut self, enabled: bool) -> Self {
        self.retarget_unstructured = enabled;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Comma-separated list, blanks dropped.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
