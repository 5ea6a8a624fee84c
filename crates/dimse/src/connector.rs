//! High level DIMSE connector bound to one peer server
//!
//! The connector exposes the Query/Retrieve and Storage operations the
//! transfer engine needs. It classifies every failure as retriable or fatal
//! through [`DimseError`] but never decides retry policy itself.

use std::path::Path;

use dicom_core::{Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{open_file, InMemDicomObject};
use regex::Regex;
use tracing::{debug, error, warn};

use crate::association::{Association, DimseService};
use crate::commands::{
    self, StatusCategory, SubOperations, C_GET_RSP, C_MOVE_RSP, C_STORE_RQ,
};
use crate::config::{ConnectorConfig, ServerNode};
use crate::dataset::{has_wildcards, LogEntry, QueryDataset, QueryLevel, ResultDataset};
use crate::{DimseError, Result};

/// Callback receiving each instance streamed back by a C-GET operation
pub type StoreSink<'a> = &'a mut dyn FnMut(InMemDicomObject) -> Result<()>;

/// Optional mutation applied to each dataset before it is sent via C-STORE
pub type Modifier<'a> = &'a dyn Fn(&mut InMemDicomObject);

/// Convert a DICOM wildcard pattern to a case-insensitive regex.
///
/// https://dicom.nema.org/medical/dicom/current/output/chtml/part04/sect_c.2.2.2.4.html
pub fn wildcard_to_regex(value: &str) -> Regex {
    let escaped = regex::escape(value)
        .replace("\\*", ".*")
        .replace("\\?", ".");
    // the pattern is derived from an already validated query value
    Regex::new(&format!("(?i){}", escaped)).expect("valid wildcard pattern")
}

/// The operations a DIMSE peer offers to the transfer engine.
///
/// There is one production implementation talking the actual protocol and a
/// fake one in the tests of the orchestration layer.
pub trait DimseConnector: Send {
    /// The peer this connector is bound to
    fn node(&self) -> &ServerNode;

    /// Find patients matching the query. When the peer has no patient root
    /// support the query is emulated on study root and patients are made
    /// unique programmatically.
    fn find_patients(
        &mut self,
        query: QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>>;

    /// Find studies matching the query
    fn find_studies(
        &mut self,
        query: QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>>;

    /// Find series below a concrete study
    fn find_series(
        &mut self,
        query: QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>>;

    /// Retrieve a whole study, streaming each received instance to `sink`
    fn get_study(&mut self, query: QueryDataset, sink: StoreSink) -> Result<()>;

    /// Retrieve a single series, streaming each received instance to `sink`
    fn get_series(&mut self, query: QueryDataset, sink: StoreSink) -> Result<()>;

    /// Ask the peer to push a whole study to another application entity
    fn move_study(&mut self, query: QueryDataset, destination_aet: &str) -> Result<()>;

    /// Ask the peer to push a single series to another application entity
    fn move_series(&mut self, query: QueryDataset, destination_aet: &str) -> Result<()>;

    /// Send datasets via C-STORE. All instances are attempted; a non-empty
    /// failure set raises a retriable error afterwards.
    fn store(
        &mut self,
        datasets: Vec<InMemDicomObject>,
        modifier: Option<Modifier>,
    ) -> Result<()>;

    /// Send every readable DICOM file below a folder via C-STORE
    fn store_folder(&mut self, folder: &Path, modifier: Option<Modifier>) -> Result<()>;

    /// Drain the warnings collected since the last call
    fn take_logs(&mut self) -> Vec<LogEntry>;
}

/// Production connector speaking DIMSE over the DICOM upper layer protocol
pub struct DimseClient {
    config: ConnectorConfig,
    node: ServerNode,
    logs: Vec<LogEntry>,
}

impl DimseClient {
    pub fn new(config: ConnectorConfig, node: ServerNode) -> Self {
        Self {
            config,
            node,
            logs: Vec::new(),
        }
    }

    /// Select the C-FIND information model for the query.
    ///
    /// Study root is preferred whenever the peer supports it and the query
    /// does not target the patient level. Patient root needs a concrete
    /// PatientID to be of any use. Absence of a usable model is a
    /// configuration problem and must not be retried.
    fn find_model(&self, query: &QueryDataset) -> Result<&'static str> {
        let level = query
            .level()
            .ok_or_else(|| DimseError::InvalidQuery("Missing QueryRetrieveLevel".into()))?;

        let caps = &self.node.capabilities;
        let patient_id = query.get(tags::PATIENT_ID).unwrap_or_default();
        let has_valid_patient_id = !patient_id.is_empty() && !has_wildcards(&patient_id);

        if caps.study_root_find && level != QueryLevel::Patient {
            Ok(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        } else if caps.patient_root_find
            && (level == QueryLevel::Patient || has_valid_patient_id)
        {
            Ok(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        } else {
            Err(DimseError::NoValidInformationModel("C-FIND".into()))
        }
    }

    /// Select the information model for C-GET or C-MOVE. Only one study at a
    /// time is ever retrieved, so a concrete StudyInstanceUID is required.
    fn retrieve_model(&self, query: &QueryDataset, service: DimseService) -> Result<&'static str> {
        let caps = &self.node.capabilities;
        let patient_id = query.get(tags::PATIENT_ID).unwrap_or_default();
        let has_patient_id = !patient_id.is_empty() && !has_wildcards(&patient_id);
        let study_uid = query.get(tags::STUDY_INSTANCE_UID).unwrap_or_default();
        let has_study_uid = !study_uid.is_empty() && !has_wildcards(&study_uid);

        let (study_root, patient_root, study_uid_model, patient_uid_model) = match service {
            DimseService::Get => (
                caps.study_root_get,
                caps.patient_root_get,
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            ),
            DimseService::Move => (
                caps.study_root_move,
                caps.patient_root_move,
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            ),
            _ => return Err(DimseError::config("Not a retrieve service")),
        };

        if study_root && has_study_uid {
            Ok(study_uid_model)
        } else if patient_root && has_patient_id && has_study_uid {
            Ok(patient_uid_model)
        } else {
            Err(DimseError::NoValidInformationModel(service.to_string()))
        }
    }

    /// Run a C-FIND request and collect the streamed pending responses.
    /// Reaching `limit` aborts the association instead of draining it.
    fn send_c_find(
        &mut self,
        query: &QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>> {
        let model = self.find_model(query)?;

        let assoc = Association::establish(&self.config, &self.node, DimseService::Find)?;
        let mut assoc = assoc;
        match Self::run_find(&mut assoc, model, query, limit) {
            Ok((results, limit_reached)) => {
                if limit_reached {
                    assoc.abort();
                } else {
                    assoc.release();
                }
                Ok(results)
            }
            Err(err) => {
                assoc.abort();
                Err(err)
            }
        }
    }

    fn run_find(
        assoc: &mut Association,
        model: &str,
        query: &QueryDataset,
        limit: Option<usize>,
    ) -> Result<(Vec<ResultDataset>, bool)> {
        let (pc_id, _ts) = assoc.presentation_context(model).ok_or_else(|| {
            DimseError::protocol(format!("Presentation context for {} not accepted", model))
        })?;

        assoc.send_command(pc_id, &commands::c_find_rq(model, 1))?;
        assoc.send_data(pc_id, query.object())?;

        let mut results = Vec::new();
        loop {
            let (_, command) = assoc.read_command()?;
            let status = commands::status_code(&command)
                .ok_or_else(|| DimseError::protocol("Status code missing in C-FIND response"))?;

            match StatusCategory::from_code(status) {
                StatusCategory::Success => {
                    debug!("C-FIND completed successfully");
                    return Ok((results, false));
                }
                StatusCategory::Pending => {
                    if !commands::has_data_set(&command) {
                        return Err(DimseError::protocol("Missing identifier for pending C-FIND"));
                    }
                    let (_, identifier) = assoc.read_data()?;
                    results.push(ResultDataset::new(identifier));

                    if let Some(limit) = limit {
                        if results.len() == limit {
                            return Ok((results, true));
                        }
                    }
                }
                category => {
                    error!("Unexpected C-FIND status {:#06x} [{}]", status, category);
                    return Err(DimseError::OperationFailed {
                        operation: "C-FIND".into(),
                        status,
                    });
                }
            }
        }
    }

    fn send_c_get(&mut self, query: &QueryDataset, sink: StoreSink) -> Result<()> {
        let model = self.retrieve_model(query, DimseService::Get)?;

        let mut assoc = Association::establish(&self.config, &self.node, DimseService::Get)?;
        match self.run_get(&mut assoc, model, query, sink) {
            Ok(()) => {
                assoc.release();
                Ok(())
            }
            Err(err) => {
                assoc.abort();
                Err(err)
            }
        }
    }

    fn run_get(
        &mut self,
        assoc: &mut Association,
        model: &str,
        query: &QueryDataset,
        sink: StoreSink,
    ) -> Result<()> {
        let (pc_id, _ts) = assoc.presentation_context(model).ok_or_else(|| {
            DimseError::protocol(format!("Presentation context for {} not accepted", model))
        })?;

        assoc.send_command(pc_id, &commands::c_get_rq(model, 1))?;
        assoc.send_data(pc_id, query.object())?;

        loop {
            let (cmd_pc, command) = assoc.read_command()?;
            match commands::command_field(&command) {
                Some(C_STORE_RQ) => {
                    // a sub-operation: the peer pushes an instance to us
                    let (_, dataset) = assoc.read_data()?;
                    match sink(dataset) {
                        Ok(()) => {
                            assoc.send_command(cmd_pc, &commands::c_store_rsp(&command, 0x0000))?;
                        }
                        Err(err) => {
                            // out of resources, then abort so the peer stops sending
                            let rsp = commands::c_store_rsp(&command, 0xA702);
                            let _ = assoc.send_command(cmd_pc, &rsp);
                            return Err(err);
                        }
                    }
                }
                Some(C_GET_RSP) => {
                    let status = commands::status_code(&command).ok_or_else(|| {
                        DimseError::protocol("Status code missing in C-GET response")
                    })?;
                    let category = StatusCategory::from_code(status);
                    debug!("Received C-GET status response [{}]", category);

                    if category == StatusCategory::Pending {
                        continue;
                    }

                    let identifier = if commands::has_data_set(&command) {
                        Some(assoc.read_data()?.1)
                    } else {
                        None
                    };
                    return self.evaluate_final_retrieve_status(
                        "C-GET",
                        status,
                        SubOperations::from_command(&command),
                        identifier,
                    );
                }
                other => {
                    return Err(DimseError::protocol(format!(
                        "Unexpected command during C-GET: {:?}",
                        other
                    )));
                }
            }
        }
    }

    fn send_c_move(&mut self, query: &QueryDataset, destination_aet: &str) -> Result<()> {
        let model = self.retrieve_model(query, DimseService::Move)?;

        let mut assoc = Association::establish(&self.config, &self.node, DimseService::Move)?;
        match self.run_move(&mut assoc, model, query, destination_aet) {
            Ok(()) => {
                assoc.release();
                Ok(())
            }
            Err(err) => {
                assoc.abort();
                Err(err)
            }
        }
    }

    fn run_move(
        &mut self,
        assoc: &mut Association,
        model: &str,
        query: &QueryDataset,
        destination_aet: &str,
    ) -> Result<()> {
        let (pc_id, _ts) = assoc.presentation_context(model).ok_or_else(|| {
            DimseError::protocol(format!("Presentation context for {} not accepted", model))
        })?;

        assoc.send_command(pc_id, &commands::c_move_rq(model, 1, destination_aet))?;
        assoc.send_data(pc_id, query.object())?;

        loop {
            let (_, command) = assoc.read_command()?;
            if commands::command_field(&command) != Some(C_MOVE_RSP) {
                return Err(DimseError::protocol("Unexpected command during C-MOVE"));
            }

            let status = commands::status_code(&command)
                .ok_or_else(|| DimseError::protocol("Status code missing in C-MOVE response"))?;
            let category = StatusCategory::from_code(status);
            debug!("Received C-MOVE status response [{}]", category);

            if category == StatusCategory::Pending {
                continue;
            }

            let identifier = if commands::has_data_set(&command) {
                Some(assoc.read_data()?.1)
            } else {
                None
            };
            return self.evaluate_final_retrieve_status(
                "C-MOVE",
                status,
                SubOperations::from_command(&command),
                identifier,
            );
        }
    }

    /// Evaluate the final status of a C-GET/C-MOVE including the
    /// sub-operation counters.
    ///
    /// Some PACS (GE, Synapse) report SUCCESS even when every single
    /// sub-operation failed, so the counters are authoritative, not the
    /// top-level status code.
    fn evaluate_final_retrieve_status(
        &mut self,
        operation: &str,
        status: u16,
        sub_ops: SubOperations,
        identifier: Option<InMemDicomObject>,
    ) -> Result<()> {
        let category = StatusCategory::from_code(status);

        if matches!(category, StatusCategory::Success | StatusCategory::Warning) {
            let completed = sub_ops.completed.unwrap_or(0);
            let failed = sub_ops.failed.unwrap_or(0);
            let warning = sub_ops.warning.unwrap_or(0);

            if failed > 0 || warning > 0 {
                if failed > 0 && completed == 0 {
                    return Err(DimseError::AllSubOperationsFailed { failed });
                }

                if failed > 0 {
                    let message = format!("{} sub-operations of {} failed.", failed, operation);
                    warn!("{}", message);
                    self.logs
                        .push(LogEntry::warning("Some failed sub-operations", message));
                }

                if warning > 0 {
                    let message = format!("{} sub-operations with warnings.", warning);
                    warn!("{}", message);
                    self.logs
                        .push(LogEntry::warning("Sub-operations with warnings", message));
                }
            } else if category == StatusCategory::Warning {
                let message = format!("Unknown warning during {} [{:#06x}].", operation, status);
                warn!("{}", message);
                self.logs
                    .push(LogEntry::warning("Unexpected warnings", message));
            }

            return Ok(());
        }

        if let Some(identifier) = identifier {
            let failed_uids: Vec<String> = identifier
                .get(tags::FAILED_SOP_INSTANCE_UID_LIST)
                .and_then(|e| e.to_str().ok().map(|s| s.to_string()))
                .map(|s| {
                    s.split('\\')
                        .map(|uid| uid.trim().to_string())
                        .filter(|uid| !uid.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if !failed_uids.is_empty() {
                error!(
                    "Erroneous images (SOPInstanceUID): {}",
                    failed_uids.join(", ")
                );
            }
        }

        Err(DimseError::OperationFailed {
            operation: operation.into(),
            status,
        })
    }

    fn send_c_store(
        &mut self,
        datasets: Vec<InMemDicomObject>,
        modifier: Option<Modifier>,
    ) -> Result<()> {
        if !self.node.capabilities.store_scp {
            return Err(DimseError::config(format!(
                "C-STORE operation not supported by {}",
                self.node
            )));
        }

        let mut assoc = Association::establish(&self.config, &self.node, DimseService::Store)?;
        let result = self.run_store(&mut assoc, datasets, modifier);
        match result {
            Ok(()) => {
                assoc.release();
                Ok(())
            }
            Err(err) => {
                assoc.abort();
                Err(err)
            }
        }
    }

    fn run_store(
        &mut self,
        assoc: &mut Association,
        datasets: Vec<InMemDicomObject>,
        modifier: Option<Modifier>,
    ) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        let mut message_id: u16 = 1;

        debug!("Sending C-STORE of {} datasets", datasets.len());

        for mut dataset in datasets {
            if let Some(modify) = modifier {
                modify(&mut dataset);
            }

            let sop_class = element_string(&dataset, tags::SOP_CLASS_UID);
            let sop_instance = element_string(&dataset, tags::SOP_INSTANCE_UID);
            let (sop_class, sop_instance) = match (sop_class, sop_instance) {
                (Some(class), Some(instance)) => (class, instance),
                _ => {
                    error!("Dataset without SOP identifiers cannot be sent via C-STORE");
                    failures.push("<unknown>".into());
                    continue;
                }
            };

            let Some((pc_id, _ts)) = assoc.presentation_context(&sop_class) else {
                error!(
                    "No accepted presentation context for SOP class {} of instance {}",
                    sop_class, sop_instance
                );
                failures.push(sop_instance);
                continue;
            };

            debug!("Sending C-STORE of SOP instance {}", sop_instance);
            assoc.send_command(
                pc_id,
                &commands::c_store_rq(&sop_class, &sop_instance, message_id),
            )?;
            assoc.send_data(pc_id, &dataset)?;
            message_id = message_id.wrapping_add(1);

            let (_, response) = assoc.read_command()?;
            let status = commands::status_code(&response)
                .ok_or_else(|| DimseError::protocol("Status code missing in C-STORE response"))?;

            match StatusCategory::from_code(status) {
                StatusCategory::Success => {}
                StatusCategory::Warning => {
                    let message =
                        format!("Warning during C-STORE of {} [{:#06x}].", sop_instance, status);
                    warn!("{}", message);
                    self.logs
                        .push(LogEntry::warning("C-STORE warning", message));
                }
                category => {
                    error!(
                        "Unexpected error during C-STORE of {} [{}]",
                        sop_instance, category
                    );
                    failures.push(sop_instance);
                }
            }
        }

        if !failures.is_empty() {
            return Err(DimseError::StoreFailed {
                failures: failures.len(),
            });
        }

        Ok(())
    }
}

impl DimseConnector for DimseClient {
    fn node(&self) -> &ServerNode {
        &self.node
    }

    fn find_patients(
        &mut self,
        query: QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>> {
        let caps = self.node.capabilities;
        if !caps.supports_find() {
            return Err(DimseError::NoValidInformationModel("C-FIND".into()));
        }

        // No patient root: emulate the query on study root and make the
        // returned patients unique afterwards.
        let level = if caps.patient_root_find {
            QueryLevel::Patient
        } else {
            QueryLevel::Study
        };

        let query = query.query_retrieve_level(level).ensure_elements(&[
            (tags::PATIENT_ID, VR::LO),
            (tags::PATIENT_NAME, VR::PN),
            (tags::PATIENT_BIRTH_DATE, VR::DA),
            (tags::PATIENT_SEX, VR::CS),
        ]);

        let results = self.send_c_find(&query, None)?;

        let birth_date_filter = query.get(tags::PATIENT_BIRTH_DATE);
        let name_filter = query
            .get(tags::PATIENT_NAME)
            .map(|name| wildcard_to_regex(&name));
        let sex_filter = query.get(tags::PATIENT_SEX);

        let mut seen = std::collections::HashSet::new();
        let mut patients = Vec::new();
        for result in results {
            if !seen.insert(result.patient_id()) {
                continue;
            }

            if let Some(birth_date) = &birth_date_filter {
                let result_birth_date = result
                    .patient_birth_date()
                    .map(crate::dataset::to_dicom_date)
                    .unwrap_or_default();
                if *birth_date != result_birth_date {
                    continue;
                }
            }

            if let Some(pattern) = &name_filter {
                if !pattern.is_match(&result.patient_name()) {
                    continue;
                }
            }

            if let Some(sex) = &sex_filter {
                if *sex != result.patient_sex() {
                    continue;
                }
            }

            patients.push(result);
            if let Some(limit) = limit {
                if patients.len() == limit {
                    break;
                }
            }
        }

        Ok(patients)
    }

    fn find_studies(
        &mut self,
        query: QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>> {
        let query = query
            .query_retrieve_level(QueryLevel::Study)
            .ensure_elements(&[
                (tags::PATIENT_ID, VR::LO),
                (tags::PATIENT_NAME, VR::PN),
                (tags::PATIENT_BIRTH_DATE, VR::DA),
                (tags::STUDY_INSTANCE_UID, VR::UI),
                (tags::ACCESSION_NUMBER, VR::SH),
                (tags::STUDY_DATE, VR::DA),
                (tags::STUDY_TIME, VR::TM),
                (tags::STUDY_DESCRIPTION, VR::LO),
                (tags::MODALITIES_IN_STUDY, VR::CS),
                (tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
            ]);

        let results = self.send_c_find(&query, limit)?;

        // Not every peer filters these attributes server side
        let description_filter = query
            .get(tags::STUDY_DESCRIPTION)
            .map(|desc| wildcard_to_regex(&desc));
        let modality_filter = query.get(tags::MODALITIES_IN_STUDY);

        let studies = results
            .into_iter()
            .filter(|study| {
                if let Some(pattern) = &description_filter {
                    if !pattern.is_match(&study.study_description()) {
                        return false;
                    }
                }
                if let Some(modality) = &modality_filter {
                    let modalities = study.modalities_in_study();
                    // it's ok if any of the study modalities matches
                    if !modalities.is_empty() && !modalities.iter().any(|m| m == modality) {
                        return false;
                    }
                }
                true
            })
            .collect();

        Ok(studies)
    }

    fn find_series(
        &mut self,
        query: QueryDataset,
        limit: Option<usize>,
    ) -> Result<Vec<ResultDataset>> {
        let study_uid = query.get(tags::STUDY_INSTANCE_UID).unwrap_or_default();
        if study_uid.is_empty() || has_wildcards(&study_uid) {
            return Err(DimseError::InvalidQuery(
                "A valid StudyInstanceUID is required for querying series".into(),
            ));
        }

        if !self.node.capabilities.study_root_find {
            let patient_id = query.get(tags::PATIENT_ID).unwrap_or_default();
            if patient_id.is_empty() || has_wildcards(&patient_id) {
                return Err(DimseError::InvalidQuery(
                    "PatientID is required for querying series with the \
                     Patient Root Query/Retrieve Information Model"
                        .into(),
                ));
            }
        }

        let query = query
            .query_retrieve_level(QueryLevel::Series)
            .ensure_elements(&[
                (tags::PATIENT_ID, VR::LO),
                (tags::STUDY_INSTANCE_UID, VR::UI),
                (tags::SERIES_INSTANCE_UID, VR::UI),
                (tags::SERIES_DESCRIPTION, VR::LO),
                (tags::SERIES_NUMBER, VR::IS),
                (tags::MODALITY, VR::CS),
            ]);

        let results = self.send_c_find(&query, limit)?;

        // SeriesNumber is an Integer String, "4" and "+04" are the same
        // number, so equality is checked numerically here.
        let series_number_filter = query
            .get(tags::SERIES_NUMBER)
            .and_then(|v| v.trim().trim_start_matches('+').parse::<i64>().ok());
        let modality_filter = query.get(tags::MODALITY);
        let description_filter = query
            .get(tags::SERIES_DESCRIPTION)
            .map(|desc| wildcard_to_regex(&desc));

        let series = results
            .into_iter()
            .filter(|series| {
                if let Some(number) = series_number_filter {
                    if series.series_number() != Some(number) {
                        return false;
                    }
                }
                if let Some(modality) = &modality_filter {
                    if series.modality() != *modality {
                        return false;
                    }
                }
                if let Some(pattern) = &description_filter {
                    if !pattern.is_match(&series.series_description()) {
                        return false;
                    }
                }
                true
            })
            .collect();

        Ok(series)
    }

    fn get_study(&mut self, query: QueryDataset, sink: StoreSink) -> Result<()> {
        let query = query.query_retrieve_level(QueryLevel::Study);
        self.send_c_get(&query, sink)
    }

    fn get_series(&mut self, query: QueryDataset, sink: StoreSink) -> Result<()> {
        let query = query.query_retrieve_level(QueryLevel::Series);
        self.send_c_get(&query, sink)
    }

    fn move_study(&mut self, query: QueryDataset, destination_aet: &str) -> Result<()> {
        let query = query.query_retrieve_level(QueryLevel::Study);
        self.send_c_move(&query, destination_aet)
    }

    fn move_series(&mut self, query: QueryDataset, destination_aet: &str) -> Result<()> {
        let query = query.query_retrieve_level(QueryLevel::Series);
        self.send_c_move(&query, destination_aet)
    }

    fn store(
        &mut self,
        datasets: Vec<InMemDicomObject>,
        modifier: Option<Modifier>,
    ) -> Result<()> {
        self.send_c_store(datasets, modifier)
    }

    fn store_folder(&mut self, folder: &Path, modifier: Option<Modifier>) -> Result<()> {
        if !folder.is_dir() {
            return Err(DimseError::config(format!(
                "Resource is not a valid folder: {}",
                folder.display()
            )));
        }

        debug!("Sending C-STORE of folder {}", folder.display());

        let mut datasets = Vec::new();
        let mut unreadable = 0usize;
        for entry in walkdir::WalkDir::new(folder)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            match open_file(entry.path()) {
                Ok(obj) => datasets.push(obj.into_inner()),
                Err(err) => {
                    error!("Failed to read DICOM file {}: {}", entry.path().display(), err);
                    // try to handle the rest of the images, raise afterwards
                    unreadable += 1;
                }
            }
        }

        let store_result = self.send_c_store(datasets, modifier);

        if unreadable > 0 {
            return Err(DimseError::UnreadableDicomFiles { count: unreadable });
        }

        store_result
    }

    fn take_logs(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs)
    }
}

fn element_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = obj
        .get(tag)?
        .to_str()
        .ok()?
        .trim_end_matches('\0')
        .trim()
        .to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
