//! The query task processor: searches the source server and persists the
//! matching studies or series as query results.

use std::sync::Arc;

use dimse::{DimseConnector, LogEntry, ResultDataset};
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{DicomJob, DicomTask, QueryResult};
use crate::processors::{
    resolution, ConnectorFactory, ProcessContext, ProcessingResult, TaskProcessor,
};

pub struct QueryProcessor {
    factory: Arc<dyn ConnectorFactory>,
}

impl QueryProcessor {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        Self { factory }
    }

    fn study_result(job: &DicomJob, task: &DicomTask, study: &ResultDataset) -> QueryResult {
        QueryResult {
            id: 0,
            job_id: job.id,
            task_id: task.id,
            patient_id: study.patient_id(),
            patient_name: study.patient_name(),
            patient_birth_date: study.patient_birth_date(),
            study_uid: study.study_instance_uid(),
            accession_number: study.accession_number(),
            study_date: study.study_date(),
            study_time: study.study_time(),
            study_description: study.study_description(),
            modalities: study.modalities_in_study(),
            image_count: study.number_of_study_related_instances(),
            pseudonym: task.spec.pseudonym.clone(),
            series_uid: None,
            series_description: None,
            series_number: None,
        }
    }

    fn series_result(
        job: &DicomJob,
        task: &DicomTask,
        study: &ResultDataset,
        series: &ResultDataset,
    ) -> QueryResult {
        let mut result = Self::study_result(job, task, study);
        result.modalities = vec![series.modality()];
        result.series_uid = Some(series.series_instance_uid());
        result.series_description = Some(series.series_description());
        result.series_number = series.series_number();
        result
    }
}

impl TaskProcessor for QueryProcessor {
    fn process(
        &mut self,
        job: &DicomJob,
        task: &DicomTask,
        ctx: &ProcessContext,
    ) -> Result<ProcessingResult> {
        let spec = &task.spec;
        let source_node = task
            .source
            .as_server()
            .ok_or_else(|| Error::task("Queries require a DICOM server as source."))?
            .clone();

        let mut source = self.factory.create_connector(&source_node);
        let mut logs: Vec<LogEntry> = Vec::new();

        if ctx.cancel.canceling() {
            return Ok(ProcessingResult::canceled());
        }

        let patients = resolution::find_patients(&mut *source, spec)?;

        let is_series_query =
            !spec.series_numbers.is_empty() || spec.series_description.is_some();

        let mut results: Vec<QueryResult> = Vec::new();
        for patient in &patients {
            if ctx.cancel.canceling() {
                return Ok(ProcessingResult::canceled());
            }

            let patient_id = patient.patient_id();
            let studies = resolution::find_studies(&mut *source, spec, &patient_id)?;

            if !results.is_empty() && !studies.is_empty() {
                logs.push(LogEntry::warning(
                    "Indistinct patients",
                    "Studies of multiple patients were found for this query.",
                ));
            }

            for study in &studies {
                if is_series_query {
                    let series_list = resolution::find_series(
                        &mut *source,
                        spec,
                        &patient_id,
                        &study.study_instance_uid(),
                    )?;
                    for series in &series_list {
                        results.push(Self::series_result(job, task, study, series));
                    }
                } else {
                    results.push(Self::study_result(job, task, study));
                }
            }
        }

        let message = if is_series_query {
            format!("{} series found.", results.len())
        } else {
            format!(
                "{} stud{} found.",
                results.len(),
                if results.len() == 1 { "y" } else { "ies" }
            )
        };

        info!("{}: {}", task, message);
        let count = results.len();
        ctx.store.add_query_results(results)?;

        logs.extend(source.take_logs());
        let mut result = ProcessingResult::from_logs(&message, &logs);
        if count == 0 {
            // no match at all is reported as a warning, not a failure
            result.status = crate::models::TaskStatus::Warning;
            result.message = if is_series_query {
                "No series found.".into()
            } else {
                "No studies found.".into()
            };
        }
        Ok(result)
    }
}
