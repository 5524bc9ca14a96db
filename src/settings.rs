use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::ExponentialBackoff;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: ExponentialBackoff,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NodeConfig {
    /// Identity used for shard ownership; defaults to the hostname when unset.
    pub node_id: Option<String>,
}

/// Scheduler tuning, all durations in milliseconds.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub shard_duration_ms: u64,
    pub max_jobs_per_shard: usize,
    pub watcher_interval_ms: u64,
    pub lookahead_ms: u64,
    pub bucket_poll_interval_ms: u64,
    pub max_concurrent_deliveries: usize,
    /// Pause between overload checks while the node reports overload.
    pub overload_backoff_delay_ms: u64,
    /// Start below `max_concurrent_deliveries` and double every interval.
    pub concurrency_slow_start_enabled: bool,
    pub slow_start_initial_concurrency: usize,
    pub slow_start_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shard_duration_ms: 60_000,
            max_jobs_per_shard: 1_000,
            watcher_interval_ms: 60_000,
            lookahead_ms: 3_600_000,
            bucket_poll_interval_ms: 1_000,
            max_concurrent_deliveries: 64,
            overload_backoff_delay_ms: 1_000,
            concurrency_slow_start_enabled: false,
            slow_start_initial_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            slow_start_interval_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn shard_duration(&self) -> Duration {
        Duration::from_millis(self.shard_duration_ms)
    }
    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }
    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }
    pub fn bucket_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bucket_poll_interval_ms)
    }
    pub fn overload_backoff_delay(&self) -> Duration {
        Duration::from_millis(self.overload_backoff_delay_ms)
    }
    pub fn slow_start_interval(&self) -> Duration {
        Duration::from_millis(self.slow_start_interval_ms)
    }

    /// Delivery permits available before any slow-start ramp.
    pub fn initial_delivery_permits(&self) -> usize {
        let max = self.max_concurrent_deliveries.max(1);
        if self.concurrency_slow_start_enabled {
            self.slow_start_initial_concurrency.clamp(1, max)
        } else {
            max
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        // A shard must cover the whole minute of the family it is created for.
        if self.shard_duration_ms < 60_000 {
            return Err(SettingsError::Invalid(format!(
                "scheduler.shard_duration_ms must be at least 60000, got {}",
                self.shard_duration_ms
            )));
        }
        let positive = [
            ("scheduler.max_jobs_per_shard", self.max_jobs_per_shard as u64),
            ("scheduler.watcher_interval_ms", self.watcher_interval_ms),
            ("scheduler.bucket_poll_interval_ms", self.bucket_poll_interval_ms),
            (
                "scheduler.max_concurrent_deliveries",
                self.max_concurrent_deliveries as u64,
            ),
            ("scheduler.overload_backoff_delay_ms", self.overload_backoff_delay_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SettingsError::Invalid(format!("{name} must be positive")));
            }
        }
        // Only checked when the ramp is on; a disabled ramp ignores both.
        if self.concurrency_slow_start_enabled {
            if self.slow_start_initial_concurrency == 0 {
                return Err(SettingsError::Invalid(
                    "scheduler.slow_start_initial_concurrency must be positive".to_string(),
                ));
            }
            if self.slow_start_interval_ms == 0 {
                return Err(SettingsError::Invalid(
                    "scheduler.slow_start_interval_ms must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(SettingsError::Invalid(format!(
                "unknown log format {other:?}, expected \"text\" or \"json\""
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint, e.g. 127.0.0.1:9464. Disabled when unset.
    pub addr: Option<String>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.scheduler.validate()?;
        if self.retry.backoff_factor < 1.0 {
            return Err(SettingsError::Invalid(format!(
                "retry.backoff_factor must be at least 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.retry.initial_interval_ms < 0 {
            return Err(SettingsError::Invalid(
                "retry.initial_interval_ms must not be negative".to_string(),
            ));
        }
        if let Some(addr) = &self.metrics.addr {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                SettingsError::Invalid(format!("metrics.addr {addr:?} is not a socket address: {e}"))
            })?;
        }
        Ok(())
    }
}
