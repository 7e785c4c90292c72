/*!
 * Configuration types for stage storage clients
 */

use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of retries per logical operation
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Default minimum backoff in milliseconds
pub const DEFAULT_RETRY_BACKOFF_MIN_MS: u64 = 1000;

/// Default backoff exponent cap (16x the minimum)
pub const DEFAULT_RETRY_BACKOFF_MAX_EXPONENT: u32 = 4;

/// Default number of credential renewals allowed per operation
pub const DEFAULT_MAX_RENEWALS: u32 = 3;

/// Default multipart part size (8 MiB)
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Default size above which uploads go multipart (16 MiB)
pub const DEFAULT_MULTIPART_THRESHOLD: usize = 16 * 1024 * 1024;

/// Default ranged download chunk (8 MiB)
pub const DEFAULT_RANGE_SIZE: usize = 8 * 1024 * 1024;

/// Default in-memory limit before stream sources spill to disk (128 MiB)
pub const DEFAULT_SPILL_THRESHOLD: usize = 128 * 1024 * 1024;

/// Largest exponent accepted; keeps `2^exponent` inside a u32
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry/backoff configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum backoff in milliseconds
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Cap on the backoff exponent
    #[serde(default = "default_max_exponent")]
    pub backoff_max_exponent: u32,

    /// Randomly shorten each backoff to avoid synchronized retries across parts
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Credential renewals allowed per operation
    #[serde(default = "default_max_renewals")]
    pub max_renewals: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_min_ms: DEFAULT_RETRY_BACKOFF_MIN_MS,
            backoff_max_exponent: DEFAULT_RETRY_BACKOFF_MAX_EXPONENT,
            jitter: true,
            max_renewals: DEFAULT_MAX_RENEWALS,
        }
    }
}

impl RetryConfig {
    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }
}

/// Chunking and buffering configuration for transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Multipart part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Payloads strictly larger than this are uploaded multipart
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: usize,

    /// Ranged download chunk size in bytes
    #[serde(default = "default_range_size")]
    pub range_size: usize,

    /// Bytes a [`crate::source::FileBackedStream`] keeps in memory before spilling
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            range_size: DEFAULT_RANGE_SIZE,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
        }
    }
}

/// Client-side encryption material for a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Base64 encoded stage master key; never written back out
    #[serde(skip_serializing)]
    pub master_key: SecretString,

    /// Key size in bits (128, 192 or 256); must match the master key length
    #[serde(default = "default_key_size")]
    pub key_size: u32,

    /// Query id recorded in the material descriptor
    #[serde(default)]
    pub query_id: Option<String>,

    /// Stage master key id recorded in the material descriptor
    #[serde(default)]
    pub smk_id: Option<u64>,
}

impl EncryptionConfig {
    pub fn new(master_key: &[u8]) -> Self {
        Self {
            master_key: SecretString::new(
                base64::engine::general_purpose::STANDARD
                    .encode(master_key)
                    .into_boxed_str(),
            ),
            key_size: (master_key.len() * 8) as u32,
            query_id: None,
            smk_id: None,
        }
    }

    /// Decode the master key bytes
    pub fn master_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.master_key.expose_secret().trim())
            .map_err(|e| ConfigError::Invalid(format!("master key is not valid base64: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.key_size, 128 | 192 | 256) {
            return Err(ConfigError::Invalid(format!(
                "unsupported encryption key size {} (expected 128, 192 or 256)",
                self.key_size
            )));
        }
        let key = self.master_key_bytes()?;
        if key.len() * 8 != self.key_size as usize {
            return Err(ConfigError::Invalid(format!(
                "master key is {} bits but key size is {}",
                key.len() * 8,
                self.key_size
            )));
        }
        Ok(())
    }
}

/// Which provider backs the stage and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Amazon S3 or an S3-compatible service
    S3 {
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },

    /// Azure Blob Storage
    Azure {
        account: String,
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// Google Cloud Storage
    Gcs {
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// In-process store for tests and local development
    #[default]
    Memory,
}

/// Log level setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug output
    Debug,

    /// Everything
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout); file output is JSON
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Complete configuration of a [`crate::StorageClient`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.backoff_max_exponent > MAX_BACKOFF_EXPONENT {
            return Err(ConfigError::Invalid(format!(
                "backoff_max_exponent {} exceeds {}",
                self.retry.backoff_max_exponent, MAX_BACKOFF_EXPONENT
            )));
        }
        if self.transfer.part_size == 0 {
            return Err(ConfigError::Invalid("part_size must be positive".to_string()));
        }
        if self.transfer.range_size == 0 {
            return Err(ConfigError::Invalid("range_size must be positive".to_string()));
        }
        if let ProviderConfig::Azure { account, .. } = &self.provider {
            if account.is_empty() {
                return Err(ConfigError::Invalid(
                    "azure storage account cannot be empty".to_string(),
                ));
            }
        }
        if let Some(encryption) = &self.encryption {
            encryption.validate()?;
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.config.provider = provider;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn retry_backoff_min(mut self, min: Duration) -> Self {
        self.config.retry.backoff_min_ms = min.as_millis() as u64;
        self
    }

    pub fn retry_backoff_max_exponent(mut self, exponent: u32) -> Self {
        self.config.retry.backoff_max_exponent = exponent;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    pub fn max_renewals(mut self, max_renewals: u32) -> Self {
        self.config.retry.max_renewals = max_renewals;
        self
    }

    pub fn part_size(mut self, part_size: usize) -> Self {
        self.config.transfer.part_size = part_size;
        self
    }

    pub fn multipart_threshold(mut self, threshold: usize) -> Self {
        self.config.transfer.multipart_threshold = threshold;
        self
    }

    pub fn range_size(mut self, range_size: usize) -> Self {
        self.config.transfer.range_size = range_size;
        self
    }

    pub fn spill_threshold(mut self, threshold: usize) -> Self {
        self.config.transfer.spill_threshold = threshold;
        self
    }

    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.config.encryption = Some(encryption);
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_min_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MIN_MS
}

fn default_max_exponent() -> u32 {
    DEFAULT_RETRY_BACKOFF_MAX_EXPONENT
}

fn default_max_renewals() -> u32 {
    DEFAULT_MAX_RENEWALS
}

fn default_part_size() -> usize {
    DEFAULT_PART_SIZE
}

fn default_multipart_threshold() -> usize {
    DEFAULT_MULTIPART_THRESHOLD
}

fn default_range_size() -> usize {
    DEFAULT_RANGE_SIZE
}

fn default_spill_threshold() -> usize {
    DEFAULT_SPILL_THRESHOLD
}

fn default_key_size() -> u32 {
    128
}
