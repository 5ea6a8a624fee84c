//! Typed wrappers around DICOM attribute sets used for queries and results

use chrono::{NaiveDate, NaiveTime};
use dicom_core::value::Value as DicomValue;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::{DimseError, Result};

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(DimseError::InvalidQuery(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}

/// Severity of a log entry collected during connector operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
}

/// A log entry produced while talking to a peer. These are collected per
/// operation and later attached to the task log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub title: String,
    pub message: String,
}

impl LogEntry {
    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Warning,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// An inclusive date range, rendered as a DICOM DA range string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Render the range the way C-FIND identifiers expect it. A single date
    /// is rendered without a dash, open ranges keep the dash on the open side.
    pub fn to_dicom(&self) -> String {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start == end => to_dicom_date(start),
            (Some(start), Some(end)) => format!("{}-{}", to_dicom_date(start), to_dicom_date(end)),
            (Some(start), None) => format!("{}-", to_dicom_date(start)),
            (None, Some(end)) => format!("-{}", to_dicom_date(end)),
            (None, None) => String::new(),
        }
    }
}

/// Checks if a string contains wildcards according to the DICOM standard.
///
/// https://dicom.nema.org/medical/dicom/current/output/chtml/part04/sect_c.2.2.2.4.html
pub fn has_wildcards(value: &str) -> bool {
    value.contains('*') || value.contains('?')
}

/// Format a date as DICOM DA
pub fn to_dicom_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Parse a DICOM DA string. Returns `None` on garbage, which does occur on
/// images from external sources even for mandatory attributes.
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim().trim_end_matches('\0');
    NaiveDate::parse_from_str(trimmed, "%Y%m%d").ok()
}

/// Parse a DICOM TM string, ignoring the fractional part.
pub fn parse_dicom_time(value: &str) -> Option<NaiveTime> {
    let trimmed = value.trim().trim_end_matches('\0');
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        2 => NaiveTime::parse_from_str(&digits, "%H").ok(),
        4 => NaiveTime::parse_from_str(&digits, "%H%M").ok(),
        l if l >= 6 => NaiveTime::parse_from_str(&digits[..6], "%H%M%S").ok(),
        _ => None,
    }
}

fn validate_no_backslash_or_control(keyword: &str, value: &str) -> Result<()> {
    if value.contains('\\') {
        return Err(DimseError::InvalidQuery(format!(
            "{} must not contain backslash characters",
            keyword
        )));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(DimseError::InvalidQuery(format!(
            "{} must not contain control characters",
            keyword
        )));
    }
    Ok(())
}

fn validate_identifying(keyword: &str, value: &str) -> Result<()> {
    validate_no_backslash_or_control(keyword, value)?;
    if has_wildcards(value) {
        return Err(DimseError::InvalidQuery(format!(
            "{} must not contain wildcard characters",
            keyword
        )));
    }
    Ok(())
}

fn validate_uid(keyword: &str, value: &str) -> Result<()> {
    if !value
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.')
    {
        return Err(DimseError::InvalidQuery(format!(
            "{} is not a valid UID: {}",
            keyword, value
        )));
    }
    Ok(())
}

/// A C-FIND/C-GET/C-MOVE identifier under construction.
///
/// Identifying fields (PatientID and instance UIDs) reject wildcards,
/// backslashes and control characters; descriptive fields keep DICOM
/// wildcard matching available for interactive searches.
#[derive(Debug, Clone)]
pub struct QueryDataset {
    obj: InMemDicomObject,
}

impl Default for QueryDataset {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryDataset {
    pub fn new() -> Self {
        Self {
            obj: InMemDicomObject::new_empty(),
        }
    }

    fn put_str(&mut self, tag: Tag, vr: VR, value: &str) {
        self.obj
            .put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    pub fn query_retrieve_level(mut self, level: QueryLevel) -> Self {
        self.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, &level.to_string());
        self
    }

    pub fn patient_id(mut self, value: &str) -> Result<Self> {
        validate_identifying("PatientID", value)?;
        self.put_str(tags::PATIENT_ID, VR::LO, value);
        Ok(self)
    }

    /// PatientName may carry wildcards for interactive searches.
    pub fn patient_name(mut self, value: &str) -> Result<Self> {
        validate_no_backslash_or_control("PatientName", value)?;
        self.put_str(tags::PATIENT_NAME, VR::PN, value);
        Ok(self)
    }

    pub fn patient_birth_date(mut self, date: NaiveDate) -> Self {
        self.put_str(tags::PATIENT_BIRTH_DATE, VR::DA, &to_dicom_date(date));
        self
    }

    pub fn study_instance_uid(mut self, value: &str) -> Result<Self> {
        validate_uid("StudyInstanceUID", value)?;
        self.put_str(tags::STUDY_INSTANCE_UID, VR::UI, value);
        Ok(self)
    }

    pub fn series_instance_uid(mut self, value: &str) -> Result<Self> {
        validate_uid("SeriesInstanceUID", value)?;
        self.put_str(tags::SERIES_INSTANCE_UID, VR::UI, value);
        Ok(self)
    }

    pub fn sop_instance_uid(mut self, value: &str) -> Result<Self> {
        validate_uid("SOPInstanceUID", value)?;
        self.put_str(tags::SOP_INSTANCE_UID, VR::UI, value);
        Ok(self)
    }

    pub fn accession_number(mut self, value: &str) -> Result<Self> {
        validate_no_backslash_or_control("AccessionNumber", value)?;
        self.put_str(tags::ACCESSION_NUMBER, VR::SH, value);
        Ok(self)
    }

    pub fn study_description(mut self, value: &str) -> Result<Self> {
        validate_no_backslash_or_control("StudyDescription", value)?;
        self.put_str(tags::STUDY_DESCRIPTION, VR::LO, value);
        Ok(self)
    }

    pub fn series_description(mut self, value: &str) -> Result<Self> {
        validate_no_backslash_or_control("SeriesDescription", value)?;
        self.put_str(tags::SERIES_DESCRIPTION, VR::LO, value);
        Ok(self)
    }

    pub fn study_date(mut self, range: DateRange) -> Self {
        if !range.is_empty() {
            self.put_str(tags::STUDY_DATE, VR::DA, &range.to_dicom());
        }
        self
    }

    /// Only a single modality can be queried at a time, the attribute does
    /// not support an OR of values in one identifier.
    pub fn modalities_in_study(mut self, modality: &str) -> Result<Self> {
        validate_no_backslash_or_control("ModalitiesInStudy", modality)?;
        self.put_str(tags::MODALITIES_IN_STUDY, VR::CS, modality);
        Ok(self)
    }

    pub fn modality(mut self, value: &str) -> Result<Self> {
        validate_no_backslash_or_control("Modality", value)?;
        self.put_str(tags::MODALITY, VR::CS, value);
        Ok(self)
    }

    pub fn series_number(mut self, value: i64) -> Self {
        self.put_str(tags::SERIES_NUMBER, VR::IS, &value.to_string());
        self
    }

    /// Ensure that specific elements are present (even if empty) so the peer
    /// returns them in its responses.
    pub fn ensure_elements(mut self, keys: &[(Tag, VR)]) -> Self {
        for &(tag, vr) in keys {
            if self.obj.get(tag).is_none() {
                self.obj
                    .put(DataElement::new(tag, vr, PrimitiveValue::Empty));
            }
        }
        self
    }

    /// Get an attribute as trimmed string, if present and non-empty
    pub fn get(&self, tag: Tag) -> Option<String> {
        element_str(&self.obj, tag)
    }

    /// Checks that the attribute exists and is not empty
    pub fn has(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    pub fn level(&self) -> Option<QueryLevel> {
        self.get(tags::QUERY_RETRIEVE_LEVEL)
            .and_then(|s| s.parse().ok())
    }

    pub fn object(&self) -> &InMemDicomObject {
        &self.obj
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.obj
    }
}

/// A read-only view over a dataset returned by C-FIND or received via
/// C-GET, with typed accessors for the attributes the transfer engine needs.
#[derive(Debug, Clone)]
pub struct ResultDataset {
    obj: InMemDicomObject,
}

impl ResultDataset {
    pub fn new(obj: InMemDicomObject) -> Self {
        Self { obj }
    }

    pub fn patient_id(&self) -> String {
        element_str(&self.obj, tags::PATIENT_ID).unwrap_or_default()
    }

    pub fn patient_name(&self) -> String {
        element_str(&self.obj, tags::PATIENT_NAME).unwrap_or_default()
    }

    /// Birth date can be absent or garbled on images from external sources
    /// even though the standard makes it mandatory.
    pub fn patient_birth_date(&self) -> Option<NaiveDate> {
        element_str(&self.obj, tags::PATIENT_BIRTH_DATE)
            .and_then(|v| parse_dicom_date(&v))
    }

    pub fn patient_sex(&self) -> String {
        element_str(&self.obj, tags::PATIENT_SEX).unwrap_or_default()
    }

    pub fn study_instance_uid(&self) -> String {
        element_str(&self.obj, tags::STUDY_INSTANCE_UID).unwrap_or_default()
    }

    pub fn accession_number(&self) -> String {
        element_str(&self.obj, tags::ACCESSION_NUMBER).unwrap_or_default()
    }

    pub fn study_date(&self) -> Option<NaiveDate> {
        element_str(&self.obj, tags::STUDY_DATE).and_then(|v| parse_dicom_date(&v))
    }

    pub fn study_time(&self) -> Option<NaiveTime> {
        element_str(&self.obj, tags::STUDY_TIME).and_then(|v| parse_dicom_time(&v))
    }

    pub fn study_description(&self) -> String {
        element_str(&self.obj, tags::STUDY_DESCRIPTION).unwrap_or_default()
    }

    pub fn modalities_in_study(&self) -> Vec<String> {
        element_strs(&self.obj, tags::MODALITIES_IN_STUDY)
    }

    pub fn number_of_study_related_instances(&self) -> Option<u64> {
        element_int(&self.obj, tags::NUMBER_OF_STUDY_RELATED_INSTANCES)
            .and_then(|v| u64::try_from(v).ok())
    }

    pub fn series_instance_uid(&self) -> String {
        element_str(&self.obj, tags::SERIES_INSTANCE_UID).unwrap_or_default()
    }

    pub fn series_description(&self) -> String {
        element_str(&self.obj, tags::SERIES_DESCRIPTION).unwrap_or_default()
    }

    /// SeriesNumber is an Integer String, peers occasionally send junk like
    /// "+4" or nothing at all. Junk is treated as absent.
    pub fn series_number(&self) -> Option<i64> {
        element_str(&self.obj, tags::SERIES_NUMBER)
            .and_then(|v| v.trim().trim_start_matches('+').parse().ok())
    }

    pub fn modality(&self) -> String {
        element_str(&self.obj, tags::MODALITY).unwrap_or_default()
    }

    pub fn sop_instance_uid(&self) -> String {
        element_str(&self.obj, tags::SOP_INSTANCE_UID).unwrap_or_default()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.obj.get(tag).is_some()
    }

    pub fn object(&self) -> &InMemDicomObject {
        &self.obj
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.obj
    }
}

fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = obj
        .get(tag)?
        .to_str()
        .ok()?
        .trim()
        .trim_end_matches('\0')
        .trim()
        .to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn element_strs(obj: &InMemDicomObject, tag: Tag) -> Vec<String> {
    match obj.get(tag).map(|e| e.value()) {
        Some(DicomValue::Primitive(v)) => v
            .to_multi_str()
            .iter()
            .map(|s| s.trim().trim_end_matches('\0').trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn element_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.get(tag)?.to_int().ok()
}
