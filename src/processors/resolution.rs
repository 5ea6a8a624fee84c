//! Patient, study and series resolution against the source server

use dimse::{DateRange, DimseConnector, LogEntry, QueryDataset, ResultDataset};

use crate::error::{Error, Result};
use crate::models::TransferSpec;

fn query_error(err: dimse::DimseError) -> Error {
    // invalid query values in a spec are a task problem, not a protocol one
    match err {
        dimse::DimseError::InvalidQuery(message) => Error::Task(message),
        other => Error::Dimse(other),
    }
}

/// Find the patients a spec refers to.
///
/// A PatientID takes priority; name and birth date given alongside it must
/// match the resolved patient exactly (wildcards are disallowed in batch
/// records, so plain equality is enough). Without an ID, name and birth
/// date are both required.
pub fn find_patients(
    connector: &mut dyn DimseConnector,
    spec: &TransferSpec,
) -> Result<Vec<ResultDataset>> {
    if let Some(patient_id) = &spec.patient_id {
        let query = QueryDataset::new()
            .patient_id(patient_id)
            .map_err(query_error)?;
        let patients = connector.find_patients(query, None)?;

        if patients.is_empty() {
            return Err(Error::task("No patient found with this PatientID."));
        }
        if patients.len() > 1 {
            return Err(Error::task(
                "Ambiguous patient: multiple patients found for this PatientID.",
            ));
        }

        let patient = &patients[0];
        if let Some(patient_name) = &spec.patient_name {
            if patient.patient_name() != *patient_name {
                return Err(Error::task(
                    "PatientName doesn't match the patient found by PatientID.",
                ));
            }
        }
        if let Some(birth_date) = &spec.patient_birth_date {
            if patient.patient_birth_date() != Some(*birth_date) {
                return Err(Error::task(
                    "PatientBirthDate doesn't match the patient found by PatientID.",
                ));
            }
        }

        return Ok(patients);
    }

    match (&spec.patient_name, &spec.patient_birth_date) {
        (Some(patient_name), Some(birth_date)) => {
            let query = QueryDataset::new()
                .patient_name(patient_name)
                .map_err(query_error)?
                .patient_birth_date(*birth_date);
            let patients = connector.find_patients(query, None)?;
            if patients.is_empty() {
                return Err(Error::task(
                    "No patient found with this PatientName and PatientBirthDate.",
                ));
            }
            Ok(patients)
        }
        _ => Err(Error::task(
            "PatientID or PatientName and PatientBirthDate are required.",
        )),
    }
}

/// Resolve the spec to exactly one patient. Several matches are never
/// silently reduced to one of them.
pub fn resolve_single_patient(
    connector: &mut dyn DimseConnector,
    spec: &TransferSpec,
) -> Result<ResultDataset> {
    let mut patients = find_patients(connector, spec)?;
    if patients.len() > 1 {
        return Err(Error::task(
            "Ambiguous patient: multiple patients found for this query.",
        ));
    }
    Ok(patients.remove(0))
}

fn base_study_query(spec: &TransferSpec, patient_id: &str) -> Result<QueryDataset> {
    let mut query = QueryDataset::new()
        .patient_id(patient_id)
        .map_err(query_error)?
        .study_date(DateRange::new(spec.study_date_start, spec.study_date_end));
    if let Some(accession_number) = &spec.accession_number {
        query = query.accession_number(accession_number).map_err(query_error)?;
    }
    if let Some(description) = &spec.study_description {
        query = query.study_description(description).map_err(query_error)?;
    }
    Ok(query)
}

/// Find the studies of a patient matching the spec filters.
///
/// ModalitiesInStudy cannot express an OR of modalities in one identifier,
/// so one query per requested modality is issued and the results are
/// deduplicated by StudyInstanceUID, then sorted by StudyDate ascending.
pub fn find_studies(
    connector: &mut dyn DimseConnector,
    spec: &TransferSpec,
    patient_id: &str,
) -> Result<Vec<ResultDataset>> {
    let mut studies: Vec<ResultDataset> = Vec::new();

    if spec.modalities.is_empty() {
        studies = connector.find_studies(base_study_query(spec, patient_id)?, None)?;
    } else {
        let mut seen = std::collections::HashSet::new();
        for modality in &spec.modalities {
            let query = base_study_query(spec, patient_id)?
                .modalities_in_study(modality)
                .map_err(query_error)?;
            for study in connector.find_studies(query, None)? {
                if seen.insert(study.study_instance_uid()) {
                    studies.push(study);
                }
            }
        }
    }

    // missing dates sort last
    studies.sort_by_key(|study| {
        let date = study.study_date();
        (date.is_none(), date)
    });
    Ok(studies)
}

/// Find the series of a study matching the spec filters, deduplicated by
/// SeriesInstanceUID and sorted by numeric SeriesNumber (missing or
/// non-numeric values last).
pub fn find_series(
    connector: &mut dyn DimseConnector,
    spec: &TransferSpec,
    patient_id: &str,
    study_uid: &str,
) -> Result<Vec<ResultDataset>> {
    let base_query = || -> Result<QueryDataset> {
        let mut query = QueryDataset::new()
            .patient_id(patient_id)
            .map_err(query_error)?
            .study_instance_uid(study_uid)
            .map_err(query_error)?;
        if let Some(description) = &spec.series_description {
            query = query.series_description(description).map_err(query_error)?;
        }
        Ok(query)
    };

    let mut series_list: Vec<ResultDataset> = Vec::new();

    if spec.series_numbers.is_empty() {
        series_list = connector.find_series(base_query()?, None)?;
    } else {
        let mut seen = std::collections::HashSet::new();
        for series_number in &spec.series_numbers {
            let query = base_query()?.series_number(*series_number);
            for series in connector.find_series(query, None)? {
                if seen.insert(series.series_instance_uid()) {
                    series_list.push(series);
                }
            }
        }
    }

    series_list.sort_by_key(|series| {
        let number = series.series_number();
        (number.is_none(), number)
    });
    Ok(series_list)
}

/// Check that every explicitly requested SeriesInstanceUID exists exactly
/// once below the study and return the series in request order.
pub fn verify_series_uids(
    connector: &mut dyn DimseConnector,
    patient_id: &str,
    study_uid: &str,
    series_uids: &[String],
) -> Result<Vec<ResultDataset>> {
    let query = QueryDataset::new()
        .patient_id(patient_id)
        .map_err(query_error)?
        .study_instance_uid(study_uid)
        .map_err(query_error)?;
    let all_series = connector.find_series(query, None)?;

    let mut verified = Vec::new();
    for series_uid in series_uids {
        let matching: Vec<&ResultDataset> = all_series
            .iter()
            .filter(|series| series.series_instance_uid() == *series_uid)
            .collect();
        match matching.len() {
            0 => {
                return Err(Error::Task(format!(
                    "No series found with Series Instance UID {}.",
                    series_uid
                )))
            }
            1 => verified.push(matching[0].clone()),
            _ => {
                return Err(Error::Task(format!(
                    "Multiple series found with Series Instance UID {}.",
                    series_uid
                )))
            }
        }
    }
    Ok(verified)
}

/// Resolve a study directly by its StudyInstanceUID.
///
/// Falls back to a lookup without the PatientID: the patient may have been
/// reassigned on the source since the task was created, which is recorded
/// as a warning instead of failing the transfer.
pub fn find_study_by_uid(
    connector: &mut dyn DimseConnector,
    spec: &TransferSpec,
    study_uid: &str,
    logs: &mut Vec<LogEntry>,
) -> Result<ResultDataset> {
    let patient_id = spec.patient_id.clone().unwrap_or_default();

    let mut studies = if patient_id.is_empty() {
        Vec::new()
    } else {
        let query = QueryDataset::new()
            .patient_id(&patient_id)
            .map_err(query_error)?
            .study_instance_uid(study_uid)
            .map_err(query_error)?;
        connector.find_studies(query, None)?
    };

    if studies.is_empty() {
        let query = QueryDataset::new()
            .study_instance_uid(study_uid)
            .map_err(query_error)?;
        studies = connector.find_studies(query, None)?;
    }

    if studies.is_empty() {
        return Err(Error::Task(format!(
            "No study found with Study Instance UID {}.",
            study_uid
        )));
    }
    if studies.len() > 1 {
        return Err(Error::Task(format!(
            "Multiple studies found with Study Instance UID {}.",
            study_uid
        )));
    }

    let study = studies.remove(0);
    if !patient_id.is_empty() && study.patient_id() != patient_id {
        logs.push(LogEntry::warning(
            "Mismatching PatientIDs",
            format!(
                "Mismatching PatientID in the transfer task ({}) and the found study ({}).",
                patient_id,
                study.patient_id()
            ),
        ));
    }

    Ok(study)
}
