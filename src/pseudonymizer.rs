//! Dataset pseudonymization and pseudonym generation

use std::collections::HashSet;

use dicom_core::header::Header;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use uuid::Uuid;

/// OtherPatientIDs, retired but still sent by some modalities
const OTHER_PATIENT_IDS: Tag = Tag(0x0010, 0x1000);
/// OtherPatientIDsSequence
const OTHER_PATIENT_IDS_SEQUENCE: Tag = Tag(0x0010, 0x1002);
/// ClinicalTrialProtocolID
const CLINICAL_TRIAL_PROTOCOL_ID: Tag = Tag(0x0012, 0x0020);
/// ClinicalTrialProtocolName
const CLINICAL_TRIAL_PROTOCOL_NAME: Tag = Tag(0x0012, 0x0021);

const ANONYMIZED_PERSON_NAME: &str = "ANONYMIZED";

pub const DEFAULT_PSEUDONYM_LENGTH: usize = 12;

/// Mutates datasets so they no longer identify the patient while staying
/// valid DICOM.
#[derive(Debug, Default)]
pub struct Pseudonymizer;

impl Pseudonymizer {
    pub fn new() -> Self {
        Self
    }

    /// Replace all patient identifying attributes.
    ///
    /// PatientID and PatientName become the pseudonym, the birth date is
    /// normalized to January 1st of the same year, every other person name
    /// gets a fixed placeholder and private tags as well as other patient
    /// IDs are stripped.
    pub fn pseudonymize(&self, obj: &mut InMemDicomObject, pseudonym: &str) {
        // Collect first, editing while iterating trips over the borrow.
        let mut person_names: Vec<Tag> = Vec::new();
        let mut private_tags: Vec<Tag> = Vec::new();
        for elem in obj.iter() {
            let tag = elem.tag();
            if tag.group() % 2 == 1 {
                private_tags.push(tag);
            } else if elem.vr() == VR::PN
                && tag != tags::PATIENT_NAME
            {
                person_names.push(tag);
            }
        }

        for tag in private_tags {
            obj.remove_element(tag);
        }
        obj.remove_element(OTHER_PATIENT_IDS);
        obj.remove_element(OTHER_PATIENT_IDS_SEQUENCE);

        for tag in person_names {
            obj.put(DataElement::new(
                tag,
                VR::PN,
                PrimitiveValue::from(ANONYMIZED_PERSON_NAME),
            ));
        }

        if let Some(normalized) = obj
            .get(tags::PATIENT_BIRTH_DATE)
            .and_then(|e| e.to_str().ok().map(|s| s.to_string()))
            .and_then(|v| normalize_birth_date(&v))
        {
            obj.put(DataElement::new(
                tags::PATIENT_BIRTH_DATE,
                VR::DA,
                PrimitiveValue::from(normalized),
            ));
        }

        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(pseudonym),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(pseudonym),
        ));
    }

    /// Stamp the clinical trial attributes when the job is configured with
    /// a trial protocol.
    pub fn apply_trial_protocol(
        &self,
        obj: &mut InMemDicomObject,
        protocol_id: Option<&str>,
        protocol_name: Option<&str>,
    ) {
        if let Some(id) = protocol_id {
            obj.put(DataElement::new(
                CLINICAL_TRIAL_PROTOCOL_ID,
                VR::LO,
                PrimitiveValue::from(id),
            ));
        }
        if let Some(name) = protocol_name {
            obj.put(DataElement::new(
                CLINICAL_TRIAL_PROTOCOL_NAME,
                VR::LO,
                PrimitiveValue::from(name),
            ));
        }
    }
}

/// Keep only the birth year: YYYYMMDD becomes YYYY0101
fn normalize_birth_date(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_end_matches('\0');
    if trimmed.len() < 4 || !trimmed[..4].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}0101", &trimmed[..4]))
}

/// Generate a pseudonym that does not collide with any already issued one.
/// Collisions trigger regeneration.
pub fn generate_pseudonym(length: usize, issued: &HashSet<String>) -> String {
    loop {
        let candidate: String = Uuid::new_v4()
            .simple()
            .to_string()
            .to_uppercase()
            .chars()
            .take(length)
            .collect();
        if !issued.contains(&candidate) {
            return candidate;
        }
    }
}
