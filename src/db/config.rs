use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::journal::JournalOptions;
use crate::primitives::pager::{check_page_size, PagerOptions};
use crate::types::page::DEFAULT_PAGE_SIZE;

/// Settings for opening a store.
///
/// Every section is optional in TOML; missing keys take the defaults below.
///
/// ```toml
/// page_size = 4096
/// cache_pages = 2048
///
/// [journal]
/// sync_on_commit = true
/// max_file_bytes = 10485760
///
/// [pool]
/// min_brokers = 1
/// max_brokers = 15
///
/// [locks]
/// timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Page size used when a new page file is created.
    pub page_size: u32,
    /// Pages kept in the page cache.
    pub cache_pages: usize,
    /// Journal settings.
    pub journal: JournalConfig,
    /// Broker pool settings.
    pub pool: PoolConfig,
    /// Lock manager settings.
    pub locks: LockConfig,
}

/// Journal section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalConfig {
    /// Bytes buffered before entries are written to the file.
    pub buffer_bytes: usize,
    /// A checkpoint may switch to a new file once the current one is this big.
    pub min_file_bytes: u64,
    /// Past this size the journal asks for a checkpoint.
    pub max_file_bytes: u64,
    /// Whether commits wait for an fsync of the journal.
    pub sync_on_commit: bool,
}

/// Broker pool section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Slots created when the pool opens.
    pub min_brokers: usize,
    /// Upper bound on slots.
    pub max_brokers: usize,
    /// How long `shutdown` waits for outstanding brokers.
    pub shutdown_timeout_ms: u64,
    /// How long a write waits for the single writer latch.
    pub writer_timeout_ms: u64,
}

/// Lock manager section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Default lock wait.
    pub timeout_ms: u64,
    /// Write-lock every ancestor of a collection being written.
    pub single_writer_collections: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            journal: JournalConfig::default(),
            pool: PoolConfig::default(),
            locks: LockConfig::default(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        let options = JournalOptions::default();
        Self {
            buffer_bytes: options.buffer_size,
            min_file_bytes: options.min_size,
            max_file_bytes: options.max_size,
            sync_on_commit: options.sync_on_commit,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_brokers: 1,
            max_brokers: 15,
            shutdown_timeout_ms: 5_000,
            writer_timeout_ms: 10_000,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            single_writer_collections: true,
        }
    }
}

impl StoreConfig {
    /// Small cache and short timeouts for tests.
    pub fn testing() -> Self {
        Self {
            page_size: 1024,
            cache_pages: 128,
            journal: JournalConfig {
                min_file_bytes: 64 * 1024,
                max_file_bytes: 1024 * 1024,
                ..JournalConfig::default()
            },
            pool: PoolConfig {
                min_brokers: 1,
                max_brokers: 4,
                shutdown_timeout_ms: 500,
                writer_timeout_ms: 2_000,
            },
            locks: LockConfig {
                timeout_ms: 500,
                single_writer_collections: true,
            },
        }
    }

    /// Commits return once the journal is written, without waiting for fsync.
    pub fn relaxed() -> Self {
        Self {
            journal: JournalConfig {
                sync_on_commit: false,
                ..JournalConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_page_size(self.page_size).map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.cache_pages < 8 {
            return Err(ConfigError::Invalid("cache_pages must be at least 8".into()));
        }
        if self.pool.max_brokers == 0 || self.pool.min_brokers > self.pool.max_brokers {
            return Err(ConfigError::Invalid(format!(
                "pool needs 0 <= min_brokers ({}) <= max_brokers ({}) and max_brokers > 0",
                self.pool.min_brokers, self.pool.max_brokers
            )));
        }
        if self.journal.min_file_bytes > self.journal.max_file_bytes {
            return Err(ConfigError::Invalid(
                "journal.min_file_bytes exceeds journal.max_file_bytes".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            cache_pages: self.cache_pages,
        }
    }

    pub(crate) fn journal_options(&self) -> JournalOptions {
        JournalOptions {
            buffer_size: self.journal.buffer_bytes,
            min_size: self.journal.min_file_bytes,
            max_size: self.journal.max_file_bytes,
            sync_on_commit: self.journal.sync_on_commit,
        }
    }
}

impl PoolConfig {
    /// `shutdown_timeout_ms` as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// `writer_timeout_ms` as a duration.
    pub fn writer_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_timeout_ms)
    }
}

impl LockConfig {
    /// `timeout_ms` as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The TOML did not match the schema.
    #[error("failed to parse config{}: {source}", describe_path(.path))]
    Parse {
        /// File that failed, if any.
        path: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// The configuration could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        #[source]
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn describe_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" {}", p.display()))
        .unwrap_or_default()
}
