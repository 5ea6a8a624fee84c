//! The transfer task processor: resolves patients, studies and series on
//! the source server and moves the pixel data to the destination.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dimse::{DimseConnector, DimseError, LogEntry, QueryDataset, ResultDataset, ServerNode};
use tracing::{debug, info};

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::models::{DicomJob, DicomNode, DicomTask, TransferSpec};
use crate::processors::{
    resolution, CancelCheck, ConnectorFactory, ProcessContext, ProcessingResult, TaskProcessor,
};
use crate::pseudonymizer::Pseudonymizer;
use crate::sanitize::sanitize_filename;

enum Outcome {
    Done,
    Canceled,
}

pub struct TransferProcessor {
    factory: Arc<dyn ConnectorFactory>,
    /// Modalities never transferred when pseudonymizing (e.g. SR reports
    /// that may embed identifying free text)
    exclude_modalities: Vec<String>,
}

impl TransferProcessor {
    pub fn new(factory: Arc<dyn ConnectorFactory>, exclude_modalities: Vec<String>) -> Self {
        Self {
            factory,
            exclude_modalities,
        }
    }

    fn resolve_studies(
        &self,
        source: &mut dyn DimseConnector,
        spec: &TransferSpec,
        logs: &mut Vec<LogEntry>,
    ) -> Result<Vec<ResultDataset>> {
        if let Some(study_uid) = &spec.study_uid {
            let study = resolution::find_study_by_uid(source, spec, study_uid, logs)?;
            return Ok(vec![study]);
        }

        let patient = resolution::resolve_single_patient(source, spec)?;
        let patient_id = patient.patient_id();
        let studies = resolution::find_studies(source, spec, &patient_id)?;
        if studies.is_empty() {
            return Err(Error::task("No studies found for this query."));
        }
        Ok(studies)
    }

    /// Select the series to transfer, or `None` for the whole study
    fn select_series(
        &self,
        source: &mut dyn DimseConnector,
        spec: &TransferSpec,
        study: &ResultDataset,
    ) -> Result<Option<Vec<ResultDataset>>> {
        let patient_id = study.patient_id();
        let study_uid = study.study_instance_uid();

        if !spec.series_uids.is_empty() {
            let series =
                resolution::verify_series_uids(source, &patient_id, &study_uid, &spec.series_uids)?;
            return Ok(Some(series));
        }

        if !spec.series_numbers.is_empty() {
            let series = resolution::find_series(source, spec, &patient_id, &study_uid)?;
            if series.is_empty() {
                return Err(Error::task(
                    "No series found for the requested series numbers.",
                ));
            }
            return Ok(Some(series));
        }

        Ok(None)
    }

    /// Download one study (or its selected series) below `base`, streaming
    /// every instance through the pseudonymizing modifier. Returns the
    /// patient folder files were placed in.
    fn download_study(
        &self,
        source: &mut dyn DimseConnector,
        job: &DicomJob,
        spec: &TransferSpec,
        study: &ResultDataset,
        base: &Path,
        pseudonym: Option<&str>,
    ) -> Result<PathBuf> {
        let patient_id = study.patient_id();
        let study_uid = study.study_instance_uid();

        let folder_owner = pseudonym.map(str::to_string).unwrap_or_else(|| patient_id.clone());
        let patient_folder = base.join(sanitize_filename(&folder_owner));

        let mut selected = self.select_series(source, spec, study)?;
        if pseudonym.is_some() && !self.exclude_modalities.is_empty() {
            if let Some(series) = &mut selected {
                series.retain(|s| !self.exclude_modalities.contains(&s.modality()));
            }
        }

        let mut modalities: Vec<String> = match &selected {
            Some(series) => {
                let mut unique = Vec::new();
                for s in series {
                    let modality = s.modality();
                    if !modality.is_empty() && !unique.contains(&modality) {
                        unique.push(modality);
                    }
                }
                unique
            }
            None => study.modalities_in_study(),
        };
        if pseudonym.is_some() && !self.exclude_modalities.is_empty() {
            modalities.retain(|m| !self.exclude_modalities.contains(m));
        }

        let date = study
            .study_date()
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "00000000".into());
        let time = study
            .study_time()
            .map(|t| t.format("%H%M%S").to_string())
            .unwrap_or_else(|| "000000".into());
        let study_folder = patient_folder.join(sanitize_filename(&format!(
            "{}-{}-{}",
            date,
            time,
            modalities.join(",")
        )));
        std::fs::create_dir_all(&study_folder)?;

        let pseudonymizer = Pseudonymizer::new();
        let trial_id = job.trial_protocol_id.as_deref();
        let trial_name = job.trial_protocol_name.as_deref();
        let mut sink = |mut obj: InMemDicomObject| -> dimse::Result<()> {
            if let Some(pseudonym) = pseudonym {
                pseudonymizer.pseudonymize(&mut obj, pseudonym);
            }
            pseudonymizer.apply_trial_protocol(&mut obj, trial_id, trial_name);
            write_instance(obj, &study_folder)
        };

        match selected {
            Some(series_list) => {
                for series in &series_list {
                    let query = series_query(&patient_id, &study_uid, &series.series_instance_uid())?;
                    source.get_series(query, &mut sink)?;
                }
            }
            None if pseudonym.is_some() && !self.exclude_modalities.is_empty() => {
                // exclusion only works on the series level
                let all_series = resolution::find_series(
                    source,
                    &TransferSpec::default(),
                    &patient_id,
                    &study_uid,
                )?;
                for series in all_series {
                    if self.exclude_modalities.contains(&series.modality()) {
                        continue;
                    }
                    let query = series_query(&patient_id, &study_uid, &series.series_instance_uid())?;
                    source.get_series(query, &mut sink)?;
                }
            }
            None => {
                let query = study_query(&patient_id, &study_uid)?;
                source.get_study(query, &mut sink)?;
            }
        }

        debug!("Successfully downloaded study {}", study_uid);
        Ok(patient_folder)
    }

    fn transfer_to_server(
        &self,
        source: &mut dyn DimseConnector,
        dest_node: &ServerNode,
        job: &DicomJob,
        spec: &TransferSpec,
        studies: &[ResultDataset],
        pseudonym: Option<&str>,
        cancel: &CancelCheck,
        logs: &mut Vec<LogEntry>,
    ) -> Result<Outcome> {
        let source_caps = source.node().capabilities;

        if source_caps.supports_get() {
            let mut dest = self.factory.create_connector(dest_node);
            for study in studies {
                if cancel.canceling() {
                    logs.extend(dest.take_logs());
                    return Ok(Outcome::Canceled);
                }
                let tmpdir = tempfile::Builder::new().prefix("convoy_").tempdir()?;
                let patient_folder =
                    self.download_study(source, job, spec, study, tmpdir.path(), pseudonym)?;
                dest.store_folder(&patient_folder, None)?;
                // the temp copy is removed when tmpdir drops
            }
            logs.extend(dest.take_logs());
            return Ok(Outcome::Done);
        }

        if source_caps.supports_move() {
            // a direct move cannot run datasets through the modifier
            if pseudonym.is_some() {
                return Err(Error::task(
                    "Pseudonymized transfers require C-GET support on the source server.",
                ));
            }

            for study in studies {
                if cancel.canceling() {
                    return Ok(Outcome::Canceled);
                }
                let patient_id = study.patient_id();
                let study_uid = study.study_instance_uid();
                match self.select_series(source, spec, study)? {
                    Some(series_list) => {
                        for series in &series_list {
                            let query = series_query(
                                &patient_id,
                                &study_uid,
                                &series.series_instance_uid(),
                            )?;
                            source.move_series(query, &dest_node.ae_title)?;
                        }
                    }
                    None => {
                        let query = study_query(&patient_id, &study_uid)?;
                        source.move_study(query, &dest_node.ae_title)?;
                    }
                }
            }
            return Ok(Outcome::Done);
        }

        Err(Error::task(
            "Source server supports neither C-GET nor C-MOVE.",
        ))
    }

    fn transfer_to_folder(
        &self,
        source: &mut dyn DimseConnector,
        folder: &Path,
        job: &DicomJob,
        spec: &TransferSpec,
        studies: &[ResultDataset],
        pseudonym: Option<&str>,
        cancel: &CancelCheck,
    ) -> Result<Outcome> {
        let download_folder = folder.join(destination_name(job));
        for study in studies {
            if cancel.canceling() {
                return Ok(Outcome::Canceled);
            }
            self.download_study(source, job, spec, study, &download_folder, pseudonym)?;
        }
        Ok(Outcome::Done)
    }

    fn transfer_to_archive(
        &self,
        source: &mut dyn DimseConnector,
        folder: &Path,
        password: &str,
        job: &DicomJob,
        spec: &TransferSpec,
        studies: &[ResultDataset],
        pseudonym: Option<&str>,
        cancel: &CancelCheck,
    ) -> Result<Outcome> {
        let archive_path = folder.join(format!("{}.zip", destination_name(job)));
        let archive = Archive::open_or_create(&archive_path, password, &job.to_string())?;

        for study in studies {
            if cancel.canceling() {
                return Ok(Outcome::Canceled);
            }
            let tmpdir = tempfile::Builder::new().prefix("convoy_").tempdir()?;
            let patient_folder =
                self.download_study(source, job, spec, study, tmpdir.path(), pseudonym)?;
            archive.add_folder(&patient_folder)?;
        }
        Ok(Outcome::Done)
    }
}

impl TaskProcessor for TransferProcessor {
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
            .ok_or_else(|| Error::task("Transfers require a DICOM server as source."))?
            .clone();
        let destination = task
            .destination
            .as_ref()
            .ok_or_else(|| Error::task("Transfer task has no destination."))?
            .clone();

        let mut source = self.factory.create_connector(&source_node);
        let mut logs: Vec<LogEntry> = Vec::new();

        if ctx.cancel.canceling() {
            return Ok(ProcessingResult::canceled());
        }

        let studies = self.resolve_studies(&mut *source, spec, &mut logs)?;
        info!(
            "Resolved {} stud{} for {}",
            studies.len(),
            if studies.len() == 1 { "y" } else { "ies" },
            task
        );

        let pseudonym: Option<String> = match &spec.pseudonym {
            Some(pseudonym) => Some(pseudonym.clone()),
            None if job.pseudonymize => {
                let patient_id = studies[0].patient_id();
                Some(ctx.store.pseudonym_for(job.id, &patient_id)?)
            }
            None => None,
        };

        let outcome = match &destination {
            DicomNode::Server(dest_node) => self.transfer_to_server(
                &mut *source,
                dest_node,
                job,
                spec,
                &studies,
                pseudonym.as_deref(),
                &ctx.cancel,
                &mut logs,
            )?,
            DicomNode::Folder(dest_folder) => match &job.archive_password {
                Some(password) if !password.is_empty() => self.transfer_to_archive(
                    &mut *source,
                    &dest_folder.path,
                    password,
                    job,
                    spec,
                    &studies,
                    pseudonym.as_deref(),
                    &ctx.cancel,
                )?,
                _ => self.transfer_to_folder(
                    &mut *source,
                    &dest_folder.path,
                    job,
                    spec,
                    &studies,
                    pseudonym.as_deref(),
                    &ctx.cancel,
                )?,
            },
        };

        logs.extend(source.take_logs());

        match outcome {
            Outcome::Canceled => Ok(ProcessingResult::canceled()),
            Outcome::Done => Ok(ProcessingResult::from_logs(
                "Transfer task completed successfully.",
                &logs,
            )),
        }
    }
}

fn study_query(patient_id: &str, study_uid: &str) -> Result<QueryDataset> {
    Ok(QueryDataset::new()
        .patient_id(patient_id)
        .map_err(Error::Dimse)?
        .study_instance_uid(study_uid)
        .map_err(Error::Dimse)?)
}

fn series_query(patient_id: &str, study_uid: &str, series_uid: &str) -> Result<QueryDataset> {
    Ok(study_query(patient_id, study_uid)?
        .series_instance_uid(series_uid)
        .map_err(Error::Dimse)?)
}

/// Folder (and archive) name a job's downloads are collected under
fn destination_name(job: &DicomJob) -> String {
    sanitize_filename(&format!(
        "convoy_{}_{}_{}_{}",
        job.kind,
        job.id,
        job.created.format("%Y%m%d"),
        job.owner
    ))
}

/// Write a received instance as a Part 10 file below the study folder
fn write_instance(obj: InMemDicomObject, study_folder: &Path) -> dimse::Result<()> {
    let sop_instance = obj
        .get(tags::SOP_INSTANCE_UID)
        .and_then(|e| e.to_str().ok().map(|s| s.trim_end_matches('\0').trim().to_string()))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DimseError::Storage("Received instance without SOPInstanceUID".into()))?;
    let sop_class = obj
        .get(tags::SOP_CLASS_UID)
        .and_then(|e| e.to_str().ok().map(|s| s.trim_end_matches('\0').trim().to_string()))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DimseError::Storage("Received instance without SOPClassUID".into()))?;

    let path = study_folder.join(sanitize_filename(&format!("{}.dcm", sop_instance)));

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(sop_class)
                .media_storage_sop_instance_uid(sop_instance),
        )
        .map_err(|err| DimseError::Storage(format!("Failed to build file meta: {}", err)))?;
    file_obj.write_to_file(&path).map_err(|err| {
        DimseError::Storage(format!("Failed to save '{}': {}", path.display(), err))
    })?;
    Ok(())
}
