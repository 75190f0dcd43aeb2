//! Lodestone configuration management.
//!
//! Loads the daemon configuration from a TOML file; every field has a
//! default so an empty file (or no file at all) yields a runnable local
//! setup. Values are validated after loading, before anything touches the
//! storage root.

mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Root configuration for the Lodestone daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LodestoneConfig {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Cache configuration
    pub cache: CacheConfig,

    /// Conversion worker configuration
    pub worker: WorkerConfig,

    /// Version-control host configuration
    pub gitserver: GitserverConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Where dump databases, uploads, and scratch files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root directory
    pub root: PathBuf,

    /// Reject uploads larger than this many bytes
    pub max_upload_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("lsif-storage"),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Capacity of the two shared query caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of idle open dump database handles
    pub connection_capacity: u64,

    /// Byte budget for idle decoded document payloads
    pub document_cache_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connection_capacity: 100,
            document_cache_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Conversion worker pool and job queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent conversion workers
    pub count: usize,

    /// Seconds between queue polls when idle
    pub poll_interval_secs: u64,

    /// Retry budget per convert job
    pub max_job_attempts: u32,

    /// Job records and stale files older than this are removed
    pub job_max_age_secs: u64,

    /// Seconds between cleanup job runs
    pub clean_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            poll_interval_secs: 1,
            max_job_attempts: 3,
            job_max_age_secs: 24 * 60 * 60,
            clean_interval_secs: 60 * 60,
        }
    }
}

/// Addresses of the gitserver shards answering commit ancestry requests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GitserverConfig {
    pub addresses: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "lodestone_core=debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl LodestoneConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::read_file(path, source))?;
        let config: Self =
            toml::from_str(&content).map_err(|source| ConfigError::parse_toml(path, source))?;
        config.validate()?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Check cross-field constraints after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.root must not be empty".to_string(),
            ));
        }
        if self.storage.max_upload_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.max_upload_bytes must be at least 1".to_string(),
            ));
        }
        if self.cache.connection_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache.connection_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.document_cache_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "cache.document_cache_bytes must be at least 1".to_string(),
            ));
        }
        if self.worker.count == 0 {
            return Err(ConfigError::ValidationError(
                "worker.count must be at least 1".to_string(),
            ));
        }
        if self.worker.max_job_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "worker.max_job_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = LodestoneConfig::default();
        config.validate().unwrap();
        assert_eq!(config.worker.count, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[storage]
root = "/var/lib/lodestone"

[worker]
count = 8

[gitserver]
addresses = ["http://gitserver-0:3178"]
"#
        )
        .unwrap();

        let config = LodestoneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/lodestone"));
        assert_eq!(config.worker.count, 8);
        assert_eq!(config.gitserver.addresses.len(), 1);
        // Untouched sections fall back to defaults.
        assert_eq!(config.cache.connection_capacity, 100);
        assert_eq!(config.worker.max_job_attempts, 3);
    }

    #[test]
    fn test_zero_worker_count_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\ncount = 0").unwrap();

        let err = LodestoneConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("worker.count"));
    }

    #[test]
    fn test_malformed_toml_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "storage = nope").unwrap();

        let err = LodestoneConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
    }
}
