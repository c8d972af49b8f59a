//! Unified configuration for fundhist.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (fundhist.toml)
//! ```toml
//! [hasher]
//! identity_fields = ["url"]
//! checksum_fields = ["title", "url", "description"]
//!
//! [reconcile]
//! valid_from_policy = "preserve-original"
//! content_change_policy = "track"
//!
//! [store]
//! backend = "rocksdb"
//! data_dir = "/var/lib/fundhist"
//! ```
//!
//! Environment variables use the `FUNDHIST_` prefix with `__` between sections,
//! e.g. `FUNDHIST_STORE__DATA_DIR=/tmp/history`.

mod defaults;

pub use defaults::*;

use crate::hasher::IdentityHasher;
use crate::reconcile::{ReconcileConfig, ValidFromPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FundhistConfig {
    /// Identity and checksum field lists
    pub hasher: HasherConfig,
    /// Engine policies
    pub reconcile: ReconcileConfig,
    /// History store location
    pub store: StoreConfig,
    /// Retry contract shared with snapshot ingestors
    pub ingest: RetryPolicy,
}

impl FundhistConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(FundhistConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("FUNDHIST_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hasher.identity_fields.is_empty() {
            return Err(ConfigError::new("hasher.identity_fields must not be empty"));
        }
        for (name, value) in [
            ("ingest.backoff_factor", self.ingest.backoff_factor),
            ("ingest.max_jitter_secs", self.ingest.max_jitter_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::new(format!(
                    "{name} must be a finite, non-negative number of seconds"
                )));
            }
        }
        Ok(())
    }

    /// Build the identity hasher described by `[hasher]`.
    pub fn identity_hasher(&self) -> Result<IdentityHasher, ConfigError> {
        IdentityHasher::new(
            self.hasher.identity_fields.clone(),
            self.hasher.checksum_fields.clone(),
        )
        .map_err(|err| ConfigError::new(err.to_string()))
    }
}

/// Field subsets fed to the identity hasher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HasherConfig {
    pub identity_fields: Vec<String>,
    pub checksum_fields: Vec<String>,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            identity_fields: default_identity_fields(),
            checksum_fields: default_checksum_fields(),
        }
    }
}

/// Which history store implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// RocksDB directory under `data_dir`
    #[default]
    Rocksdb,
    /// In-memory only; history is lost at exit
    Memory,
}

/// History store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Data directory for the RocksDB store
    pub data_dir: PathBuf,
    /// Run repair on open
    pub repair: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            repair: false,
        }
    }
}

/// Retry contract for snapshot ingestors: exponential backoff with random jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds
    pub backoff_factor: f64,
    /// Upper bound of the random jitter, in seconds
    pub max_jitter_secs: f64,
    pub request_timeout_secs: u64,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_jitter_secs: DEFAULT_MAX_JITTER_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Whether a response status should be retried
    pub fn should_retry(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before retry number `attempt` (1-based): `factor * 2^attempt + jitter`.
    ///
    /// `jitter_fraction` in `[0, 1]` is scaled by `max_jitter_secs`; callers draw it at random.
    pub fn backoff_delay(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let exponential = self.backoff_factor * 2f64.powi(attempt.min(30) as i32);
        let jitter = jitter_fraction.clamp(0.0, 1.0) * self.max_jitter_secs;
        Duration::try_from_secs_f64(exponential + jitter).unwrap_or(Duration::MAX)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<StoreBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from_policy: Option<ValidFromPolicy>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
