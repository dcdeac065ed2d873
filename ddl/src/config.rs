use crate::retry::RetryPolicy;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ddl config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ddl config: {0}")]
    Invalid(String),
}

/// Tunables for one node's DDL engine. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DdlConfig {
    /// How long an owner lease lasts without renewal.
    pub owner_lease_ms: u64,
    /// How long a node may serve its cached schema without reloading.
    pub schema_lease_ms: u64,
    pub schema_poll_interval_ms: u64,
    /// Escalating retry intervals; the last entry repeats once exhausted.
    pub retry_intervals_ms: Vec<u64>,
    pub backfill_batch_size: usize,
    pub delete_range_batch_size: usize,
    pub schema_sync_timeout_ms: u64,
    /// How long the reorg worker waits on a backfill before re-checking the job.
    pub reorg_wait_timeout_ms: u64,
    pub job_poll_interval_ms: u64,
    /// Most jobs enqueued in one meta transaction.
    pub submit_batch_size: usize,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            owner_lease_ms: 10_000,
            schema_lease_ms: 10_000,
            schema_poll_interval_ms: 200,
            retry_intervals_ms: vec![100, 200, 500, 1_000, 2_000],
            backfill_batch_size: 256,
            delete_range_batch_size: 128,
            schema_sync_timeout_ms: 20_000,
            reorg_wait_timeout_ms: 5_000,
            job_poll_interval_ms: 1_000,
            submit_batch_size: 64,
        }
    }
}

impl DdlConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_intervals_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "retry_intervals_ms must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("backfill_batch_size", self.backfill_batch_size),
            ("delete_range_batch_size", self.delete_range_batch_size),
            ("submit_batch_size", self.submit_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("owner_lease_ms", self.owner_lease_ms),
            ("schema_lease_ms", self.schema_lease_ms),
            ("schema_poll_interval_ms", self.schema_poll_interval_ms),
            ("job_poll_interval_ms", self.job_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.schema_poll_interval_ms >= self.schema_lease_ms {
            return Err(ConfigError::Invalid(
                "schema_poll_interval_ms must be shorter than schema_lease_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.retry_intervals_ms)
    }

    pub fn owner_lease(&self) -> Duration {
        Duration::from_millis(self.owner_lease_ms)
    }

    pub fn schema_lease(&self) -> Duration {
        Duration::from_millis(self.schema_lease_ms)
    }

    pub fn schema_poll_interval(&self) -> Duration {
        Duration::from_millis(self.schema_poll_interval_ms)
    }

    pub fn schema_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.schema_sync_timeout_ms)
    }

    pub fn reorg_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.reorg_wait_timeout_ms)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}
