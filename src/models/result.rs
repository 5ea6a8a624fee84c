//! Persisted results of query jobs

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// One study (or series) a query task found on the source server.
///
/// Rows of batch query jobs are later exported or turned into transfer
/// jobs by the front-end workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: u64,
    pub job_id: u64,
    pub task_id: u64,
    pub patient_id: String,
    pub patient_name: String,
    pub patient_birth_date: Option<NaiveDate>,
    pub study_uid: String,
    pub accession_number: String,
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<NaiveTime>,
    pub study_description: String,
    pub modalities: Vec<String>,
    pub image_count: Option<u64>,
    pub pseudonym: Option<String>,
    pub series_uid: Option<String>,
    pub series_description: Option<String>,
    pub series_number: Option<i64>,
}
