pub mod archive;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod processors;
pub mod pseudonymizer;
pub mod sanitize;
pub mod scheduler;
pub mod store;
pub mod worker;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing_subscriber::{self, prelude::*};

use crate::config::Config;
use crate::notify::LogNotifier;
use crate::processors::{DimseClientFactory, ProcessorRegistry};
use crate::store::Store;
use crate::worker::{DicomWorker, DispatchLock, WorkerPool};

pub use error::{Error, Result};

/// Initialize logging and run the worker pool until shutdown
pub fn run(config: Config) -> Result<()> {
    // Initialize logging
    if config.logging.log_to_file {
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::fs::File::create(&config.logging.log_file_path)?);

        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .expect("Failed to initialize logging");
    } else {
        tracing_subscriber::fmt()
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    tracing::info!("🔧 Starting Convoy transfer engine");

    let store = Arc::new(Store::open(&config.store.path)?);

    let connector_factory = Arc::new(DimseClientFactory::new(config.dimse.clone()));
    let registry = Arc::new(ProcessorRegistry::production(
        connector_factory,
        config.transfer.exclude_modalities.clone(),
    ));

    let worker = DicomWorker::new(
        store,
        registry,
        Arc::new(LogNotifier),
        Arc::new(DispatchLock::new()),
        config.worker_options()?,
        Arc::new(AtomicBool::new(false)),
    );

    tracing::info!("🚀 Starting {} DICOM workers", config.worker.count);
    let pool = WorkerPool::start(worker, config.worker.count);
    pool.join();

    Ok(())
}
