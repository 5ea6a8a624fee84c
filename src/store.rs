//! Durable state of the engine: job/task rows and the dispatch queue
//!
//! All read-modify-write cycles happen inside one write transaction, which
//! gives the row-level isolation concurrent workers rely on when they touch
//! sibling tasks of the same job.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    evaluate_post_process, DicomJob, DicomTask, JobStatus, QueryResult, QueuedEntry, TaskStatus,
};
use crate::pseudonymizer::{generate_pseudonym, DEFAULT_PSEUDONYM_LENGTH};

const JOBS: TableDefinition<u64, &str> = TableDefinition::new("jobs");
const TASKS: TableDefinition<u64, &str> = TableDefinition::new("tasks");
const QUEUE: TableDefinition<u64, &str> = TableDefinition::new("queue");
const QUERY_RESULTS: TableDefinition<u64, &str> = TableDefinition::new("query_results");
// key: "<job id>:<patient id>"
const PSEUDONYMS: TableDefinition<&str, &str> = TableDefinition::new("pseudonyms");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Outcome of [`Store::post_process_job`]
#[derive(Debug, Clone)]
pub struct PostProcessOutcome {
    pub job: DicomJob,
    /// All tasks are terminal and a final status was derived
    pub finished: bool,
    /// The notifier must be called (first terminal transition of a job
    /// with mail delivery enabled)
    pub should_notify: bool,
}

fn storage_err<E: std::fmt::Display>(err: E) -> Error {
    Error::Storage(err.to_string())
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the database and make sure all tables exist
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("🗄️  Opening job store at {}", path.display());
        let db = Database::create(path).map_err(storage_err)?;

        let txn = db.begin_write().map_err(storage_err)?;
        {
            txn.open_table(JOBS).map_err(storage_err)?;
            txn.open_table(TASKS).map_err(storage_err)?;
            txn.open_table(QUEUE).map_err(storage_err)?;
            txn.open_table(QUERY_RESULTS).map_err(storage_err)?;
            txn.open_table(PSEUDONYMS).map_err(storage_err)?;
            txn.open_table(COUNTERS).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        Ok(Self { db })
    }

    fn next_id(txn: &redb::WriteTransaction, counter: &str) -> Result<u64> {
        let mut counters = txn.open_table(COUNTERS).map_err(storage_err)?;
        let current = counters
            .get(counter)
            .map_err(storage_err)?
            .map(|v| v.value())
            .unwrap_or(0);
        let next = current + 1;
        counters.insert(counter, next).map_err(storage_err)?;
        Ok(next)
    }

    // --- jobs ---

    pub fn create_job(&self, mut job: DicomJob) -> Result<DicomJob> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            job.id = Self::next_id(&txn, "jobs")?;
            job.created = Utc::now();
            let mut jobs = txn.open_table(JOBS).map_err(storage_err)?;
            let json = serde_json::to_string(&job)?;
            jobs.insert(job.id, json.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        debug!("Created {}", job);
        Ok(job)
    }

    pub fn job(&self, id: u64) -> Result<DicomJob> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let jobs = txn.open_table(JOBS).map_err(storage_err)?;
        let value = jobs
            .get(id)
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("DicomJob [{}]", id)))?;
        Ok(serde_json::from_str(value.value())?)
    }

    pub fn update_job(&self, job: &DicomJob) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut jobs = txn.open_table(JOBS).map_err(storage_err)?;
            if jobs.get(job.id).map_err(storage_err)?.is_none() {
                return Err(Error::NotFound(format!("DicomJob [{}]", job.id)));
            }
            let json = serde_json::to_string(job)?;
            jobs.insert(job.id, json.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn jobs(&self) -> Result<Vec<DicomJob>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let jobs = txn.open_table(JOBS).map_err(storage_err)?;
        let mut result = Vec::new();
        for item in jobs.iter().map_err(storage_err)? {
            let (_, value) = item.map_err(storage_err)?;
            result.push(serde_json::from_str(value.value())?);
        }
        Ok(result)
    }

    /// Delete a job and everything hanging off it. Only allowed while the
    /// job is unverified or pending with no started tasks.
    pub fn delete_job(&self, id: u64) -> Result<()> {
        let job = self.job(id)?;
        let tasks = self.tasks_of_job(id)?;
        let statuses: Vec<TaskStatus> = tasks.iter().map(|t| t.status).collect();
        if !job.is_deletable(&statuses) {
            return Err(Error::InvalidState(format!(
                "{} is not deletable in status {}",
                job, job.status
            )));
        }

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut jobs = txn.open_table(JOBS).map_err(storage_err)?;
            jobs.remove(id).map_err(storage_err)?;

            let mut task_table = txn.open_table(TASKS).map_err(storage_err)?;
            let mut queue = txn.open_table(QUEUE).map_err(storage_err)?;
            for task in &tasks {
                task_table.remove(task.id).map_err(storage_err)?;
                let entry_ids: Vec<u64> = collect_queue(&queue)?
                    .into_iter()
                    .filter(|e| e.task_id == task.id)
                    .map(|e| e.id)
                    .collect();
                for entry_id in entry_ids {
                    queue.remove(entry_id).map_err(storage_err)?;
                }
            }

            let mut pseudonyms = txn.open_table(PSEUDONYMS).map_err(storage_err)?;
            let prefix = format!("{}:", id);
            let stale: Vec<String> = {
                let mut keys = Vec::new();
                for item in pseudonyms.iter().map_err(storage_err)? {
                    let (key, _) = item.map_err(storage_err)?;
                    if key.value().starts_with(&prefix) {
                        keys.push(key.value().to_string());
                    }
                }
                keys
            };
            for key in stale {
                pseudonyms.remove(key.as_str()).map_err(storage_err)?;
            }
        }
        txn.commit().map_err(storage_err)?;
        info!("Deleted {}", job);
        Ok(())
    }

    // --- job lifecycle operations ---

    /// Move an unverified job to PENDING
    pub fn verify_job(&self, id: u64) -> Result<DicomJob> {
        let mut job = self.job(id)?;
        if job.status != JobStatus::Unverified {
            return Err(Error::InvalidState(format!("{} is already verified", job)));
        }
        job.status = JobStatus::Pending;
        self.update_job(&job)?;
        Ok(job)
    }

    /// Request cancellation. Pending tasks are canceled right away and
    /// their queue entries removed; in-progress tasks stop cooperatively.
    pub fn cancel_job(&self, id: u64) -> Result<DicomJob> {
        let mut job = self.job(id)?;
        if !job.is_cancelable() {
            return Err(Error::InvalidState(format!(
                "{} is not cancelable in status {}",
                job, job.status
            )));
        }

        job.status = JobStatus::Canceling;
        self.update_job(&job)?;

        for mut task in self.tasks_of_job(id)? {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Canceled;
                task.end = Some(Utc::now());
                self.update_task(&task)?;
                if let Some(entry) = self.entry_for_task(task.id)? {
                    self.delete_entry(entry.id)?;
                }
            }
        }

        Ok(job)
    }

    /// Resume a canceled job by resetting its canceled tasks
    pub fn resume_job(&self, id: u64) -> Result<DicomJob> {
        let mut job = self.job(id)?;
        if !job.is_resumable() {
            return Err(Error::InvalidState(format!(
                "{} is not resumable in status {}",
                job, job.status
            )));
        }

        for mut task in self.tasks_of_job(id)? {
            if task.status == TaskStatus::Canceled {
                task.reset();
                self.update_task(&task)?;
            }
        }

        job.status = JobStatus::Pending;
        job.end = None;
        self.update_job(&job)?;
        Ok(job)
    }

    /// Retry a failed job: only its failed tasks run again
    pub fn retry_job(&self, id: u64) -> Result<DicomJob> {
        let job = self.job(id)?;
        if !job.is_retriable() {
            return Err(Error::InvalidState(format!(
                "{} is not retriable in status {}",
                job, job.status
            )));
        }
        self.reset_tasks(id, true)
    }

    /// Restart a finished job from scratch
    pub fn restart_job(&self, id: u64) -> Result<DicomJob> {
        let job = self.job(id)?;
        if !job.is_restartable() {
            return Err(Error::InvalidState(format!(
                "{} is not restartable in status {}",
                job, job.status
            )));
        }
        self.reset_tasks(id, false)
    }

    fn reset_tasks(&self, job_id: u64, only_failed: bool) -> Result<DicomJob> {
        for mut task in self.tasks_of_job(job_id)? {
            let applies = if only_failed {
                task.status == TaskStatus::Failure
            } else {
                task.is_resettable()
            };
            if applies {
                task.reset();
                self.update_task(&task)?;
            }
        }

        let mut job = self.job(job_id)?;
        job.status = JobStatus::Pending;
        job.message.clear();
        job.end = None;
        job.finished_mail_sent = false;
        self.update_job(&job)?;
        Ok(job)
    }

    // --- tasks ---

    pub fn create_task(&self, mut task: DicomTask) -> Result<DicomTask> {
        if let Err(message) = task.spec.validate() {
            return Err(Error::Config(message));
        }

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            task.id = Self::next_id(&txn, "tasks")?;
            task.created = Utc::now();
            let mut tasks = txn.open_table(TASKS).map_err(storage_err)?;
            let json = serde_json::to_string(&task)?;
            tasks.insert(task.id, json.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(task)
    }

    pub fn task(&self, id: u64) -> Result<DicomTask> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let tasks = txn.open_table(TASKS).map_err(storage_err)?;
        let value = tasks
            .get(id)
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("DicomTask [{}]", id)))?;
        Ok(serde_json::from_str(value.value())?)
    }

    pub fn update_task(&self, task: &DicomTask) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut tasks = txn.open_table(TASKS).map_err(storage_err)?;
            if tasks.get(task.id).map_err(storage_err)?.is_none() {
                return Err(Error::NotFound(format!("DicomTask [{}]", task.id)));
            }
            let json = serde_json::to_string(task)?;
            tasks.insert(task.id, json.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn tasks_of_job(&self, job_id: u64) -> Result<Vec<DicomTask>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let tasks = txn.open_table(TASKS).map_err(storage_err)?;
        let mut result: Vec<DicomTask> = Vec::new();
        for item in tasks.iter().map_err(storage_err)? {
            let (_, value) = item.map_err(storage_err)?;
            let task: DicomTask = serde_json::from_str(value.value())?;
            if task.job_id == job_id {
                result.push(task);
            }
        }
        result.sort_by_key(|t| t.id);
        Ok(result)
    }

    pub fn delete_task(&self, id: u64) -> Result<()> {
        let task = self.task(id)?;
        if !task.is_deletable() {
            return Err(Error::InvalidState(format!(
                "{} is not deletable in status {}",
                task, task.status
            )));
        }

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut tasks = txn.open_table(TASKS).map_err(storage_err)?;
            tasks.remove(id).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        if let Some(entry) = self.entry_for_task(id)? {
            self.delete_entry(entry.id)?;
        }
        Ok(())
    }

    // --- queue ---

    /// Enqueue one task. Refuses a second unconsumed entry for the same
    /// task, there must be at most one in flight.
    pub fn enqueue_task(&self, task_id: u64, priority: u8) -> Result<QueuedEntry> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        let entry = {
            let mut queue = txn.open_table(QUEUE).map_err(storage_err)?;
            let existing = collect_queue(&queue)?
                .into_iter()
                .any(|e| e.task_id == task_id);
            if existing {
                return Err(Error::TaskAlreadyQueued(task_id));
            }

            let mut entry = QueuedEntry::new(task_id, priority);
            entry.id = Self::next_id(&txn, "queue")?;
            entry.created = Utc::now();
            let json = serde_json::to_string(&entry)?;
            queue.insert(entry.id, json.as_str()).map_err(storage_err)?;
            entry
        };
        txn.commit().map_err(storage_err)?;
        Ok(entry)
    }

    pub fn queued_entries(&self) -> Result<Vec<QueuedEntry>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let queue = txn.open_table(QUEUE).map_err(storage_err)?;
        collect_queue(&queue)
    }

    pub fn entry_for_task(&self, task_id: u64) -> Result<Option<QueuedEntry>> {
        Ok(self
            .queued_entries()?
            .into_iter()
            .find(|e| e.task_id == task_id))
    }

    /// All entries a worker may pick up now, ordered by priority
    /// descending, then creation time ascending.
    pub fn eligible_entries(&self, now: DateTime<Utc>) -> Result<Vec<QueuedEntry>> {
        let mut entries: Vec<QueuedEntry> = self
            .queued_entries()?
            .into_iter()
            .filter(|e| e.is_eligible(now))
            .collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created.cmp(&b.created))
                .then(a.id.cmp(&b.id))
        });
        Ok(entries)
    }

    pub fn update_entry(&self, entry: &QueuedEntry) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut queue = txn.open_table(QUEUE).map_err(storage_err)?;
            if queue.get(entry.id).map_err(storage_err)?.is_none() {
                return Err(Error::NotFound(format!("QueuedEntry [{}]", entry.id)));
            }
            let json = serde_json::to_string(entry)?;
            queue.insert(entry.id, json.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn delete_entry(&self, id: u64) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut queue = txn.open_table(QUEUE).map_err(storage_err)?;
            queue.remove(id).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Enqueue every pending task of a pending job with the priority
    /// derived from its urgency.
    pub fn queue_pending_tasks(
        &self,
        job_id: u64,
        default_priority: u8,
        urgent_priority: u8,
    ) -> Result<usize> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Pending {
            return Err(Error::InvalidState(format!(
                "{} must be pending to queue its tasks",
                job
            )));
        }

        let priority = if job.urgent {
            urgent_priority
        } else {
            default_priority
        };

        let mut queued = 0;
        for task in self.tasks_of_job(job_id)? {
            if task.status == TaskStatus::Pending && self.entry_for_task(task.id)?.is_none() {
                self.enqueue_task(task.id, priority)?;
                queued += 1;
            }
        }
        Ok(queued)
    }

    // --- post processing ---

    /// Evaluate all tasks of the job and persist the derived job state.
    ///
    /// Idempotent: re-running it without an intervening task change yields
    /// the same status and never re-notifies.
    pub fn post_process_job(&self, job_id: u64) -> Result<PostProcessOutcome> {
        let mut job = self.job(job_id)?;
        let statuses: Vec<TaskStatus> = self
            .tasks_of_job(job_id)?
            .iter()
            .map(|t| t.status)
            .collect();

        let outcome = evaluate_post_process(&job, &statuses);

        let mut should_notify = false;
        if job.status != outcome.status || outcome.finished {
            job.status = outcome.status;
            if let Some(message) = &outcome.message {
                job.message = message.clone();
            }
            if (outcome.finished || outcome.status == JobStatus::Canceled) && job.end.is_none() {
                job.end = Some(Utc::now());
            }
            if outcome.finished && job.send_finished_mail && !job.finished_mail_sent {
                job.finished_mail_sent = true;
                should_notify = true;
            }
            self.update_job(&job)?;
        }

        Ok(PostProcessOutcome {
            job,
            finished: outcome.finished,
            should_notify,
        })
    }

    // --- pseudonyms ---

    /// Return the stable pseudonym for a patient within a job, generating
    /// a fresh one unique across all jobs on first request.
    pub fn pseudonym_for(&self, job_id: u64, patient_id: &str) -> Result<String> {
        let key = format!("{}:{}", job_id, patient_id);

        let txn = self.db.begin_write().map_err(storage_err)?;
        let pseudonym = {
            let mut pseudonyms = txn.open_table(PSEUDONYMS).map_err(storage_err)?;

            let existing = pseudonyms
                .get(key.as_str())
                .map_err(storage_err)?
                .map(|g| g.value().to_string());
            if let Some(existing) = existing {
                existing
            } else {
                let issued: std::collections::HashSet<String> = {
                    let mut values = std::collections::HashSet::new();
                    for item in pseudonyms.iter().map_err(storage_err)? {
                        let (_, value) = item.map_err(storage_err)?;
                        values.insert(value.value().to_string());
                    }
                    values
                };
                let fresh = generate_pseudonym(DEFAULT_PSEUDONYM_LENGTH, &issued);
                pseudonyms
                    .insert(key.as_str(), fresh.as_str())
                    .map_err(storage_err)?;
                fresh
            }
        };
        txn.commit().map_err(storage_err)?;
        Ok(pseudonym)
    }

    // --- query results ---

    pub fn add_query_results(&self, results: Vec<QueryResult>) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(QUERY_RESULTS).map_err(storage_err)?;
            for mut result in results {
                result.id = Self::next_id(&txn, "query_results")?;
                let json = serde_json::to_string(&result)?;
                table
                    .insert(result.id, json.as_str())
                    .map_err(storage_err)?;
            }
        }
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn query_results_of_job(&self, job_id: u64) -> Result<Vec<QueryResult>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(QUERY_RESULTS).map_err(storage_err)?;
        let mut results = Vec::new();
        for item in table.iter().map_err(storage_err)? {
            let (_, value) = item.map_err(storage_err)?;
            let result: QueryResult = serde_json::from_str(value.value())?;
            if result.job_id == job_id {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.id);
        Ok(results)
    }
}

fn collect_queue<T>(table: &T) -> Result<Vec<QueuedEntry>>
where
    T: ReadableTable<u64, &'static str>,
{
    let mut entries = Vec::new();
    for item in table.iter().map_err(storage_err)? {
        let (_, value) = item.map_err(storage_err)?;
        entries.push(serde_json::from_str(value.value())?);
    }
    Ok(entries)
}
