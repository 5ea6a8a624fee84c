//! Jobs and the job status aggregation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Lifecycle states of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unverified,
    Pending,
    InProgress,
    Canceling,
    Canceled,
    Success,
    Warning,
    Failure,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Unverified => "Unverified",
            JobStatus::Pending => "Pending",
            JobStatus::InProgress => "In Progress",
            JobStatus::Canceling => "Canceling",
            JobStatus::Canceled => "Canceled",
            JobStatus::Success => "Success",
            JobStatus::Warning => "Warning",
            JobStatus::Failure => "Failure",
        };
        write!(f, "{}", name)
    }
}

/// The front-end workflow a job was created by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Selective,
    Batch,
    Continuous,
    Query,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobKind::Selective => "selective_transfer",
            JobKind::Batch => "batch_transfer",
            JobKind::Continuous => "continuous_transfer",
            JobKind::Query => "batch_query",
        };
        write!(f, "{}", name)
    }
}

/// A transfer or query job owning one task per identifiable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DicomJob {
    pub id: u64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub urgent: bool,
    pub owner: String,
    pub message: String,
    pub send_finished_mail: bool,
    /// Guards the at-most-once notification on the terminal transition
    pub finished_mail_sent: bool,
    /// Pseudonymize transferred datasets even when a task carries no
    /// explicit pseudonym (one is then generated per patient and job)
    pub pseudonymize: bool,
    pub project_name: Option<String>,
    pub trial_protocol_id: Option<String>,
    pub trial_protocol_name: Option<String>,
    pub archive_password: Option<String>,
    pub created: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DicomJob {
    pub fn new(kind: JobKind, owner: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            status: JobStatus::Unverified,
            urgent: false,
            owner: owner.into(),
            message: String::new(),
            send_finished_mail: false,
            finished_mail_sent: false,
            pseudonymize: false,
            project_name: None,
            trial_protocol_id: None,
            trial_protocol_name: None,
            archive_password: None,
            created: Utc::now(),
            start: None,
            end: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status != JobStatus::Unverified
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::InProgress)
    }

    pub fn is_resumable(&self) -> bool {
        self.status == JobStatus::Canceled
    }

    pub fn is_retriable(&self) -> bool {
        self.status == JobStatus::Failure
    }

    pub fn is_restartable(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Canceled | JobStatus::Success | JobStatus::Warning | JobStatus::Failure
        )
    }

    /// A job may only be deleted before any of its tasks started
    pub fn is_deletable(&self, task_statuses: &[TaskStatus]) -> bool {
        matches!(self.status, JobStatus::Unverified | JobStatus::Pending)
            && task_statuses.iter().all(|s| *s == TaskStatus::Pending)
    }
}

impl std::fmt::Display for DicomJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DicomJob [{}]", self.id)
    }
}

/// Outcome of a post-processing evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcess {
    pub status: JobStatus,
    pub message: Option<String>,
    /// True when all tasks reached a terminal state and a final status
    /// was derived
    pub finished: bool,
}

/// Evaluate all tasks of a job and derive the job state.
///
/// Must be applied after every task-status change. The function is pure,
/// persisting the outcome (and stamping `end`) is up to the caller, which
/// has to do it under the same lock/transaction used for task updates so
/// sibling tasks of one job cannot race.
pub fn evaluate_post_process(job: &DicomJob, task_statuses: &[TaskStatus]) -> PostProcess {
    let canceling = job.status == JobStatus::Canceling;

    if task_statuses.iter().any(|s| *s == TaskStatus::Pending) {
        return PostProcess {
            status: if canceling {
                JobStatus::Canceling
            } else {
                JobStatus::Pending
            },
            message: None,
            finished: false,
        };
    }

    if task_statuses.iter().any(|s| *s == TaskStatus::InProgress) {
        return PostProcess {
            status: if canceling {
                JobStatus::Canceling
            } else {
                JobStatus::InProgress
            },
            message: None,
            finished: false,
        };
    }

    // All tasks are in a terminal state now. A canceling job always ends up
    // canceled, never in one of the other final states.
    if canceling {
        return PostProcess {
            status: JobStatus::Canceled,
            message: None,
            finished: false,
        };
    }

    let has_success = task_statuses.iter().any(|s| *s == TaskStatus::Success);
    let has_warning = task_statuses.iter().any(|s| *s == TaskStatus::Warning);
    let has_failure = task_statuses.iter().any(|s| *s == TaskStatus::Failure);

    let (status, message) = if has_success && !has_warning && !has_failure {
        (JobStatus::Success, "All tasks succeeded.")
    } else if (has_success && has_failure) || (has_warning && has_failure) {
        (JobStatus::Failure, "Some tasks failed.")
    } else if has_success && has_warning {
        (JobStatus::Warning, "Some tasks have warnings.")
    } else if has_warning {
        (JobStatus::Warning, "All tasks have warnings.")
    } else if has_failure {
        (JobStatus::Failure, "All tasks failed.")
    } else {
        // at least one of success, warning or failure must be present
        panic!("Invalid task status list of {}", job);
    };

    PostProcess {
        status,
        message: Some(message.to_string()),
        finished: true,
    }
}
