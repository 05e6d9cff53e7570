//! Configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use armada_observability::LogConfig;

use crate::jobs::JobExecutorConfig;
use crate::workflows::ReleaseConfig;

/// Process configuration. Every field has a default suitable for local
/// development.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub release: ReleaseSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `None` selects the in-memory stores.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub lease_secs: u64,
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 16,
            lease_secs: 300,
            name: "armada-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn executor(&self) -> JobExecutorConfig {
        JobExecutorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            lease: Duration::from_secs(self.lease_secs),
            name: self.name.clone(),
        }
    }
}

/// Timing of the release-device workflow, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseSettings {
    pub initial_delay_secs: u64,
    pub retry_delay_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: 30,
            retry_delay_secs: 30,
            max_wait_secs: 15 * 60,
        }
    }
}

impl ReleaseSettings {
    pub fn release_config(&self) -> ReleaseConfig {
        ReleaseConfig {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_wait: Duration::from_secs(self.max_wait_secs),
        }
    }
}

impl Config {
    /// Load configuration from `ARMADA_*` environment variables.
    ///
    /// | Env Var                              | Default          |
    /// |--------------------------------------|------------------|
    /// | `ARMADA_DATABASE_URL`                | unset (in-memory)|
    /// | `ARMADA_DATABASE_MAX_CONNECTIONS`    | `10`             |
    /// | `ARMADA_WORKER_POLL_INTERVAL_MS`     | `1000`           |
    /// | `ARMADA_WORKER_BATCH_SIZE`           | `16`             |
    /// | `ARMADA_WORKER_LEASE_SECS`           | `300`            |
    /// | `ARMADA_WORKER_NAME`                 | `armada-worker`  |
    /// | `ARMADA_RELEASE_INITIAL_DELAY_SECS`  | `30`             |
    /// | `ARMADA_RELEASE_RETRY_DELAY_SECS`    | `30`             |
    /// | `ARMADA_RELEASE_MAX_WAIT_SECS`       | `900`            |
    /// | `ARMADA_LOG_JSON`                    | `true`           |
    /// | `ARMADA_LOG_FILTER`                  | `info`           |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(url) = lookup("ARMADA_DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            config.database.url = Some(url);
        }
        set(&lookup, "ARMADA_DATABASE_MAX_CONNECTIONS", &mut config.database.max_connections)?;

        set(&lookup, "ARMADA_WORKER_POLL_INTERVAL_MS", &mut config.worker.poll_interval_ms)?;
        set(&lookup, "ARMADA_WORKER_BATCH_SIZE", &mut config.worker.batch_size)?;
        set(&lookup, "ARMADA_WORKER_LEASE_SECS", &mut config.worker.lease_secs)?;
        if let Some(name) = lookup("ARMADA_WORKER_NAME") {
            config.worker.name = name;
        }

        set(&lookup, "ARMADA_RELEASE_INITIAL_DELAY_SECS", &mut config.release.initial_delay_secs)?;
        set(&lookup, "ARMADA_RELEASE_RETRY_DELAY_SECS", &mut config.release.retry_delay_secs)?;
        set(&lookup, "ARMADA_RELEASE_MAX_WAIT_SECS", &mut config.release.max_wait_secs)?;

        set(&lookup, "ARMADA_LOG_JSON", &mut config.log.json)?;
        if let Some(filter) = lookup("ARMADA_LOG_FILTER") {
            config.log.default_filter = filter;
        }

        if config.worker.batch_size == 0 {
            anyhow::bail!("ARMADA_WORKER_BATCH_SIZE must be at least 1");
        }
        Ok(config)
    }

    /// Install the process-wide tracing subscriber for the `log` section.
    pub fn init_tracing(&self) {
        armada_observability::init_with(&self.log);
    }
}

fn set<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
    }
    Ok(())
}
