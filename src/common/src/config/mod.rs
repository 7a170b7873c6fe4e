use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Name of the setting that gates TTL deletion work cluster-wide.
pub const TTL_JOB_ENABLED_SETTING: &str = "ttl.job.enabled";

/// Row-level TTL execution settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Cluster-wide switch checked before every select batch.
    ///
    /// Env: ROWTTL__TTL__ENABLED
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum number of expired keys fetched per historical select.
    ///
    /// Env: ROWTTL__TTL__SELECT_BATCH_SIZE
    pub select_batch_size: usize,

    /// Maximum number of keys removed per delete transaction.
    ///
    /// Env: ROWTTL__TTL__DELETE_BATCH_SIZE
    pub delete_batch_size: usize,

    /// Rows per second allowed through the delete rate limiter. Zero means unlimited.
    ///
    /// Env: ROWTTL__TTL__DELETE_RATE_LIMIT
    #[serde(default)]
    pub delete_rate_limit: u64,

    /// How far in the past the historical select reads.
    ///
    /// Env: ROWTTL__TTL__SELECT_AS_OF
    #[serde(with = "humantime_serde")]
    pub select_as_of: Duration,

    /// Upper bound on workers per processor, applied on top of available parallelism.
    ///
    /// Env: ROWTTL__TTL__WORKER_CONCURRENCY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_concurrency: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            select_batch_size: 500,
            delete_batch_size: 100,
            delete_rate_limit: 0,
            select_as_of: Duration::from_secs(30),
            worker_concurrency: None,
        }
    }
}

impl TtlConfig {
    /// Validate the TTL configuration.
    ///
    /// Batch sizes and the as-of staleness must be positive; the worker
    /// concurrency cap, when present, must be at least one.
    pub fn validate(&self) -> Result<(), TtlConfigError> {
        if self.select_batch_size == 0 {
            return Err(TtlConfigError::InvalidBatchSize {
                name: "select_batch_size",
            });
        }
        if self.delete_batch_size == 0 {
            return Err(TtlConfigError::InvalidBatchSize {
                name: "delete_batch_size",
            });
        }
        if self.select_as_of.is_zero() {
            return Err(TtlConfigError::InvalidAsOf(self.select_as_of));
        }
        if self.worker_concurrency == Some(0) {
            return Err(TtlConfigError::InvalidConcurrency);
        }
        Ok(())
    }

    /// Delete rate with the "zero means unlimited" convention resolved.
    pub fn effective_delete_rate_limit(&self) -> u64 {
        if self.delete_rate_limit == 0 {
            u64::MAX
        } else {
            self.delete_rate_limit
        }
    }
}

/// Errors that can occur during TTL configuration validation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TtlConfigError {
    /// A batch size was zero.
    #[error("Invalid {name}: must be positive")]
    InvalidBatchSize { name: &'static str },

    /// The as-of staleness was zero, which would make the select a current-time read.
    #[error("Invalid select_as_of: {0:?} must be positive")]
    InvalidAsOf(Duration),

    /// The worker concurrency cap was zero.
    #[error("Invalid worker_concurrency: must be at least 1")]
    InvalidConcurrency,
}

/// Where durable job progress records live.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Directory holding one progress file per job.
    pub registry_dir: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            registry_dir: ".data/ttl-jobs".to_string(),
        }
    }
}

/// Identity of the node running processors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub sql_instance_id: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { sql_instance_id: 1 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// TTL execution settings
    #[serde(default)]
    pub ttl: TtlConfig,
    /// Job registry settings
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Node identity
    #[serde(default)]
    pub node: NodeConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("rowttl.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path))
    }

    fn figment(file: figment::providers::Data<Toml>) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("ROWTTL__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
