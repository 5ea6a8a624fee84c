//! Task processors and the explicit job-kind dispatch table
//!
//! Processors do the actual work of a task. Which processor handles which
//! job kind is wired up in a [`ProcessorRegistry`] passed to the workers at
//! startup, there is no global registration.

pub mod query;
pub mod resolution;
pub mod transfer;

use std::collections::HashMap;
use std::sync::Arc;

use dimse::{ConnectorConfig, DimseClient, DimseConnector, LogEntry, LogLevel, ServerNode};

use crate::error::{Error, Result};
use crate::models::{DicomJob, DicomTask, JobKind, JobStatus, TaskStatus};
use crate::store::Store;

pub use query::QueryProcessor;
pub use transfer::TransferProcessor;

/// What a finished task reports back to the worker
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub status: TaskStatus,
    pub message: String,
    pub log: String,
}

impl ProcessingResult {
    /// Derive the final result from the collected log entries: any warning
    /// turns a successful task into WARNING, never silently into SUCCESS.
    pub fn from_logs(default_message: &str, logs: &[LogEntry]) -> Self {
        let mut status = TaskStatus::Success;
        let mut message = default_message.to_string();
        for entry in logs {
            if entry.level == LogLevel::Warning {
                status = TaskStatus::Warning;
                message = entry.title.clone();
            }
        }

        let log = logs
            .iter()
            .map(|entry| entry.message.clone())
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            status,
            message,
            log,
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: TaskStatus::Canceled,
            message: "Task was canceled.".into(),
            log: String::new(),
        }
    }
}

/// Cooperative cancellation: consulted before and after each unit of work
/// (each study within a task). In-flight DIMSE operations are allowed to
/// finish so the association is never left in an undefined state.
#[derive(Clone)]
pub struct CancelCheck {
    store: Arc<Store>,
    job_id: u64,
}

impl CancelCheck {
    pub fn new(store: Arc<Store>, job_id: u64) -> Self {
        Self { store, job_id }
    }

    pub fn canceling(&self) -> bool {
        self.store
            .job(self.job_id)
            .map(|job| job.status == JobStatus::Canceling)
            .unwrap_or(false)
    }
}

/// Shared services a processor may use during execution
pub struct ProcessContext {
    pub store: Arc<Store>,
    pub cancel: CancelCheck,
}

/// Does the actual work of processing one task
pub trait TaskProcessor: Send {
    fn process(
        &mut self,
        job: &DicomJob,
        task: &DicomTask,
        ctx: &ProcessContext,
    ) -> Result<ProcessingResult>;
}

/// Builds connectors for processors, swapped for a fake in tests
pub trait ConnectorFactory: Send + Sync {
    fn create_connector(&self, node: &ServerNode) -> Box<dyn DimseConnector>;
}

/// Production factory creating native protocol clients
pub struct DimseClientFactory {
    config: ConnectorConfig,
}

impl DimseClientFactory {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

impl ConnectorFactory for DimseClientFactory {
    fn create_connector(&self, node: &ServerNode) -> Box<dyn DimseConnector> {
        Box::new(DimseClient::new(self.config.clone(), node.clone()))
    }
}

pub type ProcessorFactory =
    Box<dyn Fn(&DicomJob, &DicomTask) -> Result<Box<dyn TaskProcessor>> + Send + Sync>;

/// Explicit mapping of job kind to processor factory
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: HashMap<JobKind, ProcessorFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, factory: ProcessorFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn processor_for(
        &self,
        job: &DicomJob,
        task: &DicomTask,
    ) -> Result<Box<dyn TaskProcessor>> {
        let factory = self.factories.get(&job.kind).ok_or_else(|| {
            Error::Config(format!("No processor registered for job kind {}", job.kind))
        })?;
        factory(job, task)
    }

    /// The production wiring: every transfer flavor runs through the
    /// transfer processor, query jobs through the query processor.
    pub fn production(
        connector_factory: Arc<dyn ConnectorFactory>,
        exclude_modalities: Vec<String>,
    ) -> Self {
        let mut registry = Self::new();

        for kind in [JobKind::Selective, JobKind::Batch, JobKind::Continuous] {
            let factory = connector_factory.clone();
            let excluded = exclude_modalities.clone();
            registry.register(
                kind,
                Box::new(move |_job, _task| {
                    Ok(Box::new(TransferProcessor::new(
                        factory.clone(),
                        excluded.clone(),
                    )))
                }),
            );
        }

        let factory = connector_factory.clone();
        registry.register(
            JobKind::Query,
            Box::new(move |_job, _task| Ok(Box::new(QueryProcessor::new(factory.clone())))),
        );

        registry
    }
}
