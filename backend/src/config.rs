//! Configuration for the briefcase manager.

use briefcase_engine::ConcurrencyPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of pull-and-retry attempts after the first push.
pub const DEFAULT_PUSH_RETRIES: u32 = 5;
/// Default pause between push attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Briefcase manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the briefcase and changeset cache
    pub cache_dir: PathBuf,
    /// Retries after a transient push conflict
    pub push_retries: u32,
    /// Pause between push attempts
    pub retry_delay: Duration,
    /// Timeout applied to `open` calls that do not set their own
    pub open_timeout: Option<Duration>,
    /// Policy every newly opened database starts with
    pub default_policy: ConcurrencyPolicy,
}

impl Config {
    /// Configuration with defaults rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            push_retries: DEFAULT_PUSH_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            open_timeout: None,
            default_policy: ConcurrencyPolicy::optimistic(),
        }
    }

    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let cache_dir = env::var("BRIEFCASE_CACHE_DIR").map_err(|_| ConfigError::MissingCacheDir)?;
        let mut config = Self::new(cache_dir);

        if let Ok(value) = env::var("BRIEFCASE_PUSH_RETRIES") {
            config.push_retries = parse_count("BRIEFCASE_PUSH_RETRIES", &value)?;
        }
        if let Ok(value) = env::var("BRIEFCASE_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(parse_number("BRIEFCASE_RETRY_DELAY_MS", &value)?);
        }
        if let Ok(value) = env::var("BRIEFCASE_OPEN_TIMEOUT_MS") {
            config.open_timeout = Some(Duration::from_millis(parse_number(
                "BRIEFCASE_OPEN_TIMEOUT_MS",
                &value,
            )?));
        }
        if let Ok(value) = env::var("BRIEFCASE_CONCURRENCY") {
            config.default_policy = parse_policy(&value)?;
        }

        Ok(config)
    }

    pub fn with_push_retries(mut self, retries: u32) -> Self {
        self.push_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Directory holding everything cached for one iModel.
    pub fn imodel_dir(&self, imodel_id: &str) -> PathBuf {
        self.cache_dir.join(imodel_id)
    }

    /// Cached changeset file, named by its content id.
    pub fn changeset_path(&self, imodel_id: &str, changeset_id: &str) -> PathBuf {
        self.imodel_dir(imodel_id)
            .join("changesets")
            .join(format!("{}.cs", changeset_id))
    }

    /// Briefcase file inside a named briefcase directory.
    pub fn briefcase_path(&self, imodel_id: &str, dir_name: &str) -> PathBuf {
        self.imodel_dir(imodel_id).join(dir_name).join(BRIEFCASE_FILE_NAME)
    }
}

/// File name of every briefcase inside its directory.
pub const BRIEFCASE_FILE_NAME: &str = "bc.json";

/// Directory name of a fixed-version briefcase pinned to `changeset_id`.
pub fn fixed_version_dir(changeset_id: &str) -> String {
    if changeset_id.is_empty() {
        "fixed-seed".to_string()
    } else {
        format!("fixed-{}", changeset_id)
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

fn parse_count(name: &'static str, value: &str) -> Result<u32, ConfigError> {
    u32::try_from(parse_number(name, value)?).map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

fn parse_policy(value: &str) -> Result<ConcurrencyPolicy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "optimistic" => Ok(ConcurrencyPolicy::optimistic()),
        "pessimistic" => Ok(ConcurrencyPolicy::Pessimistic),
        other => Err(ConfigError::InvalidPolicy(other.to_string())),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("BRIEFCASE_CACHE_DIR environment variable is required")]
    MissingCacheDir,

    #[error("Invalid {name} value: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("Invalid concurrency policy: {0} (expected optimistic or pessimistic)")]
    InvalidPolicy(String),
}
