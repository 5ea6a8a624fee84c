//! The worker loop dispatching queued tasks to processors
//!
//! Each worker pulls at most one task at a time so priority ordering is
//! respected across the whole pool, not per worker. The select step runs
//! under a shared dispatch lock; the lock is released before the task is
//! executed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::{DicomTask, JobStatus, QueuedEntry, TaskStatus};
use crate::notify::JobNotifier;
use crate::processors::{CancelCheck, ProcessContext, ProcessingResult, ProcessorRegistry};
use crate::scheduler::TimeSlot;
use crate::store::Store;

/// Mutual exclusion around the "select next eligible entry" step.
///
/// Within a single process a mutex is sufficient; deployments spreading
/// workers over several processes put a distributed lock behind the same
/// choke point.
#[derive(Default)]
pub struct DispatchLock {
    inner: Mutex<()>,
}

impl DispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Tunables of the worker loop
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub polling_interval: Duration,
    /// Per-task wall clock guard
    pub task_timeout: Duration,
    pub time_slot: Option<TimeSlot>,
    pub max_task_retries: u32,
    pub retry_backoff: Duration,
    pub max_priority: u8,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(5),
            task_timeout: Duration::from_secs(20 * 60),
            time_slot: None,
            max_task_retries: 3,
            retry_backoff: Duration::from_secs(60),
            max_priority: 10,
        }
    }
}

#[derive(Clone)]
pub struct DicomWorker {
    store: Arc<Store>,
    registry: Arc<ProcessorRegistry>,
    notifier: Arc<dyn JobNotifier>,
    lock: Arc<DispatchLock>,
    options: WorkerOptions,
    stop: Arc<AtomicBool>,
}

impl DicomWorker {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ProcessorRegistry>,
        notifier: Arc<dyn JobNotifier>,
        lock: Arc<DispatchLock>,
        options: WorkerOptions,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            lock,
            options,
            stop,
        }
    }

    /// Whether the configured time slot currently allows dispatching.
    /// Outside the slot the worker sleeps without selecting any entry.
    pub fn dispatch_allowed(&self) -> bool {
        match &self.options.time_slot {
            Some(slot) => slot.contains(Local::now().time()),
            None => true,
        }
    }

    /// Run until the stop flag is set
    pub fn run(&self) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            if !self.dispatch_allowed() {
                thread::sleep(self.options.polling_interval);
                continue;
            }

            match self.check_and_process_next_task() {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.options.polling_interval),
                Err(err) => {
                    error!("Worker iteration failed: {}", err);
                    thread::sleep(self.options.polling_interval);
                }
            }
        }
    }

    /// Check for a queued task and process it if found.
    ///
    /// Returns true if a task was processed, false otherwise.
    pub fn check_and_process_next_task(&self) -> Result<bool> {
        let Some(entry) = self.fetch_queued_entry()? else {
            return Ok(false);
        };
        self.process_entry(entry)?;
        Ok(true)
    }

    /// Select and lock the next eligible entry under the dispatch lock
    fn fetch_queued_entry(&self) -> Result<Option<QueuedEntry>> {
        let _guard = self.lock.acquire();

        let mut eligible = self.store.eligible_entries(Utc::now())?;
        if eligible.is_empty() {
            return Ok(None);
        }
        let mut entry = eligible.remove(0);

        // lock it so no other worker picks it up
        entry.locked = true;
        self.store.update_entry(&entry)?;
        debug!("Next queued entry being processed: [{}]", entry.id);
        Ok(Some(entry))
    }

    fn process_entry(&self, entry: QueuedEntry) -> Result<()> {
        let mut task = self.store.task(entry.task_id)?;

        if task.status == TaskStatus::Canceled {
            self.store.delete_entry(entry.id)?;
            self.finish_job(task.job_id)?;
            return Ok(());
        }
        if task.status != TaskStatus::Pending {
            warn!("Skipping queued {} in status {}", task, task.status);
            self.store.delete_entry(entry.id)?;
            return Ok(());
        }

        // the first started task moves the whole job to IN_PROGRESS
        let mut job = self.store.job(task.job_id)?;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::InProgress;
            job.start = Some(Utc::now());
            self.store.update_job(&job)?;
            info!("Processing of {} started.", job);
        }

        task.status = TaskStatus::InProgress;
        task.start = Some(Utc::now());
        self.store.update_task(&task)?;
        info!("Processing of {} started.", task);

        let result = self.execute_with_timeout(&job, &task);

        match result {
            Ok(processing) => {
                task.status = processing.status;
                task.message = processing.message;
                if !processing.log.is_empty() {
                    task.push_log(&processing.log);
                }
                self.store.delete_entry(entry.id)?;
            }
            Err(err) if err.is_retriable() && task.attempts < self.options.max_task_retries => {
                let backoff_secs = self.options.retry_backoff.as_secs();
                warn!(
                    "Retriable error during {}: {}. Retrying in {} seconds.",
                    task, err, backoff_secs
                );

                task.attempts += 1;
                task.status = TaskStatus::Pending;
                task.message = format!(
                    "Task failed, but will be retried in {} seconds.",
                    backoff_secs
                );
                task.push_log(&err.to_string());

                let mut entry = entry;
                entry.eta = Some(Utc::now() + ChronoDuration::seconds(backoff_secs as i64));
                // raise the priority slightly so the retry happens soon
                if entry.priority < self.options.max_priority {
                    entry.priority += 1;
                }
                entry.locked = false;
                self.store.update_entry(&entry)?;
            }
            Err(err) => {
                if err.is_retriable() {
                    error!("No more retries for finally failed {}: {}", task, err);
                } else {
                    error!("Error during {}: {}", task, err);
                }
                task.status = TaskStatus::Failure;
                task.message = err.to_string();
                self.store.delete_entry(entry.id)?;
            }
        }

        task.end = Some(Utc::now());
        self.store.update_task(&task)?;
        info!("Processing of {} ended.", task);

        self.finish_job(task.job_id)?;

        // unlock the entry if it still exists (the retry path already did)
        if let Some(mut remaining) = self.store.entry_for_task(task.id)? {
            if remaining.locked {
                remaining.locked = false;
                self.store.update_entry(&remaining)?;
            }
        }

        Ok(())
    }

    /// Post-process the job under the dispatch lock so sibling tasks
    /// finishing concurrently cannot race on the aggregation.
    fn finish_job(&self, job_id: u64) -> Result<()> {
        let outcome = {
            let _guard = self.lock.acquire();
            self.store.post_process_job(job_id)?
        };

        if outcome.should_notify {
            self.notifier.notify_job_finished(&outcome.job);
        }
        if outcome.finished {
            info!("Processing of {} ended.", outcome.job);
        }
        Ok(())
    }

    /// Run the processor on its own thread, bounded by the per-task wall
    /// clock guard. A timed out processor thread is detached; its blocking
    /// association runs into the DIMSE timeouts on its own.
    fn execute_with_timeout(
        &self,
        job: &crate::models::DicomJob,
        task: &DicomTask,
    ) -> Result<ProcessingResult> {
        let mut processor = self.registry.processor_for(job, task)?;

        let ctx = ProcessContext {
            store: self.store.clone(),
            cancel: CancelCheck::new(self.store.clone(), job.id),
        };
        let job = job.clone();
        let task = task.clone();

        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let result = processor.process(&job, &task, &ctx);
            let _ = sender.send(result);
        });

        match receiver.recv_timeout(self.options.task_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Dimse(dimse::DimseError::Timeout(
                format!(
                    "Task was aborted due to timeout after {} seconds.",
                    self.options.task_timeout.as_secs()
                ),
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::task("Task processor terminated unexpectedly."))
            }
        }
    }
}

/// A fixed pool of worker threads sharing one dispatch lock
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers cloned from the given template
    pub fn start(worker: DicomWorker, count: usize) -> Self {
        let stop = worker.stop.clone();
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let worker = worker.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("dicom-worker-{}", index))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread"),
            );
        }
        info!("Started {} DICOM workers", count);
        Self { stop, handles }
    }

    /// Signal all workers to stop after their current task
    pub fn shutdown(&self) {
        info!("Shutting down DICOM workers...");
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for all workers to exit
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
