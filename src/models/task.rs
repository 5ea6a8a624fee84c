//! Tasks, the unit of work dispatched to workers

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::node::DicomNode;
use super::validate;

/// Lifecycle states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Canceled,
    Success,
    Warning,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::Success | TaskStatus::Warning | TaskStatus::Failure
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Canceled => "Canceled",
            TaskStatus::Success => "Success",
            TaskStatus::Warning => "Warning",
            TaskStatus::Failure => "Failure",
        };
        write!(f, "{}", name)
    }
}

/// What a task should resolve and transfer, one record per identifiable
/// unit (a batch file row or an interactively selected study).
///
/// Transfer tasks carry a patient and study selection; query tasks use the
/// same fields but only search. The fields arrive pre-parsed from the batch
/// file parser or the selection dialog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSpec {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub accession_number: Option<String>,
    pub study_uid: Option<String>,
    pub study_date_start: Option<NaiveDate>,
    pub study_date_end: Option<NaiveDate>,
    pub study_description: Option<String>,
    pub series_description: Option<String>,
    #[serde(default)]
    pub modalities: Vec<String>,
    #[serde(default)]
    pub series_uids: Vec<String>,
    #[serde(default)]
    pub series_numbers: Vec<i64>,
    pub pseudonym: Option<String>,
}

impl TransferSpec {
    /// Check the invariants of all identifying fields
    pub fn validate(&self) -> Result<(), String> {
        if let Some(patient_id) = &self.patient_id {
            validate::identifying_field("PatientID", patient_id)?;
        }
        if let Some(patient_name) = &self.patient_name {
            validate::no_backslashes("PatientName", patient_name)?;
            validate::no_control_chars("PatientName", patient_name)?;
        }
        if let Some(accession_number) = &self.accession_number {
            validate::identifying_field("AccessionNumber", accession_number)?;
        }
        if let Some(study_uid) = &self.study_uid {
            validate::valid_uid("StudyInstanceUID", study_uid)?;
        }
        for series_uid in &self.series_uids {
            validate::valid_uid("SeriesInstanceUID", series_uid)?;
        }
        if let Some(pseudonym) = &self.pseudonym {
            validate::no_backslashes("Pseudonym", pseudonym)?;
            validate::no_control_chars("Pseudonym", pseudonym)?;
        }
        Ok(())
    }
}

/// A single transfer or query task of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DicomTask {
    pub id: u64,
    pub job_id: u64,
    pub source: DicomNode,
    pub destination: Option<DicomNode>,
    pub spec: TransferSpec,
    pub status: TaskStatus,
    pub attempts: u32,
    pub message: String,
    pub log: String,
    pub created: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DicomTask {
    pub fn new(job_id: u64, source: DicomNode, destination: Option<DicomNode>) -> Self {
        Self {
            id: 0,
            job_id,
            source,
            destination,
            spec: TransferSpec::default(),
            status: TaskStatus::Pending,
            attempts: 0,
            message: String::new(),
            log: String::new(),
            created: Utc::now(),
            start: None,
            end: None,
        }
    }

    pub fn with_spec(mut self, spec: TransferSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn is_deletable(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// A task can only be put back to PENDING from a terminal state
    pub fn is_resettable(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_killable(&self) -> bool {
        self.status == TaskStatus::InProgress
    }

    /// Reset the task for another run (job retry or restart)
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.message.clear();
        self.log.clear();
        self.start = None;
        self.end = None;
    }

    /// Append a line to the task log
    pub fn push_log(&mut self, line: &str) {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(line);
    }
}

impl std::fmt::Display for DicomTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DicomTask [{}]", self.id)
    }
}
