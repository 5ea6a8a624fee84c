mod logging_config;

pub mod config;

pub use config::{Config, SchedulerConfig, StoreConfig, WorkerConfig};
pub use logging_config::LoggingConfig;

/// Structure representing application startup arguments.
#[derive(Debug)]
pub struct Cli {
    /// Path to the configuration file.
    pub config_path: String,
}

impl Cli {
    /// Creates a new `Cli` instance with the provided configuration path.
    pub fn new(config_path: String) -> Self {
        Self { config_path }
    }

    /// Read the configuration path from the command line, falling back to
    /// `convoy.toml` in the working directory.
    pub fn from_args() -> Self {
        let config_path = std::env::args()
            .nth(1)
            .unwrap_or_else(|| "convoy.toml".to_string());
        Self::new(config_path)
    }
}
