use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{Cli, LoggingConfig};
use crate::error::{Error, Result};
use crate::scheduler::TimeSlot;
use crate::worker::WorkerOptions;

/// Worker pool settings
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    /// Per-task wall clock guard in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Optional daily dispatch window, e.g. "22:00" to "06:00"
    pub time_slot_begin: Option<String>,
    pub time_slot_end: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            polling_interval_secs: default_polling_interval(),
            task_timeout_secs: default_task_timeout(),
            time_slot_begin: None,
            time_slot_end: None,
        }
    }
}

impl WorkerConfig {
    pub fn time_slot(&self) -> Result<Option<TimeSlot>> {
        match (&self.time_slot_begin, &self.time_slot_end) {
            (Some(begin), Some(end)) => {
                let slot = TimeSlot::parse(begin, end).map_err(Error::Config)?;
                Ok(Some(slot))
            }
            (None, None) => Ok(None),
            _ => Err(Error::Config(
                "time_slot_begin and time_slot_end must be configured together".into(),
            )),
        }
    }
}

/// Queue and retry settings
#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_priority")]
    pub default_priority: u8,
    #[serde(default = "default_urgent_priority")]
    pub urgent_priority: u8,
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
    /// How often a task with retriable failures is requeued before it is
    /// forced to FAILURE
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: default_priority(),
            urgent_priority: default_urgent_priority(),
            max_priority: default_max_priority(),
            max_task_retries: default_max_task_retries(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

/// Durable state settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Transfer behavior settings
#[derive(Debug, Deserialize, Default)]
pub struct TransferConfig {
    /// Modalities excluded from pseudonymized transfers
    #[serde(default)]
    pub exclude_modalities: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dimse: dimse::ConnectorConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load the configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read config file '{}': {}", path, e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config file '{}': {}", path, e)))?;
        config.dimse.validate().map_err(Error::Dimse)?;
        Ok(config)
    }

    /// Load the configuration from the path given on the command line.
    /// A missing file falls back to the built-in defaults.
    pub fn from_args() -> Result<Self> {
        let cli = Cli::from_args();
        if std::path::Path::new(&cli.config_path).is_file() {
            Self::load(&cli.config_path)
        } else {
            tracing::warn!(
                "Config file '{}' not found, using defaults",
                cli.config_path
            );
            Ok(Self::default())
        }
    }

    /// Derive the options of a single worker
    pub fn worker_options(&self) -> Result<WorkerOptions> {
        Ok(WorkerOptions {
            polling_interval: Duration::from_secs(self.worker.polling_interval_secs),
            task_timeout: Duration::from_secs(self.worker.task_timeout_secs),
            time_slot: self.worker.time_slot()?,
            max_task_retries: self.scheduler.max_task_retries,
            retry_backoff: Duration::from_secs(self.scheduler.retry_backoff_secs),
            max_priority: self.scheduler.max_priority,
        })
    }
}

// Default value functions
fn default_worker_count() -> usize {
    2
}

fn default_polling_interval() -> u64 {
    5
}

fn default_task_timeout() -> u64 {
    20 * 60
}

fn default_priority() -> u8 {
    4
}

fn default_urgent_priority() -> u8 {
    8
}

fn default_max_priority() -> u8 {
    10
}

fn default_max_task_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./convoy.redb")
}
