//! DIMSE command set construction and status interpretation

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;

/// C-STORE-RQ command field value
pub const C_STORE_RQ: u16 = 0x0001;
/// C-STORE-RSP command field value
pub const C_STORE_RSP: u16 = 0x8001;
/// C-GET-RSP command field value
pub const C_GET_RSP: u16 = 0x8010;
/// C-FIND-RSP command field value
pub const C_FIND_RSP: u16 = 0x8020;
/// C-MOVE-RSP command field value
pub const C_MOVE_RSP: u16 = 0x8021;

/// Value of CommandDataSetType that signals "no data set follows"
pub const NO_DATA_SET: u16 = 0x0101;

/// Storage SOP classes requested for C-STORE associations and offered in
/// the SCP role during C-GET, covering the image types the engine moves.
/// Structured reports and dose objects are carried as opaque series.
pub const STORAGE_SOP_CLASSES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::X_RAY_ANGIOGRAPHIC_IMAGE_STORAGE,
    uids::X_RAY_RADIOFLUOROSCOPIC_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
];

/// DIMSE status categories per PS3.7 Annex C
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl StatusCategory {
    /// Map a raw status code to its category
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => StatusCategory::Success,
            0xFF00 | 0xFF01 => StatusCategory::Pending,
            0xFE00 => StatusCategory::Cancel,
            0x0001 | 0xB000..=0xBFFF => StatusCategory::Warning,
            _ => StatusCategory::Failure,
        }
    }
}

impl std::fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCategory::Success => "Success",
            StatusCategory::Pending => "Pending",
            StatusCategory::Cancel => "Cancel",
            StatusCategory::Warning => "Warning",
            StatusCategory::Failure => "Failure",
        };
        write!(f, "{}", name)
    }
}

/// Build a C-FIND-RQ command set
pub fn c_find_rq(sop_class_uid: &str, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0020])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
    ])
}

/// Build a C-GET-RQ command set
pub fn c_get_rq(sop_class_uid: &str, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0010])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
    ])
}

/// Build a C-MOVE-RQ command set with the retrieve destination
pub fn c_move_rq(sop_class_uid: &str, message_id: u16, destination_aet: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0021])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(destination_aet),
        ),
    ])
}

/// Build a C-STORE-RQ command set
pub fn c_store_rq(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
    ])
}

/// Build the C-STORE-RSP for an inbound C-STORE-RQ (C-GET sub-operation)
pub fn c_store_rsp(request: &InMemDicomObject, status: u16) -> InMemDicomObject {
    let sop_class = command_str(request, tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default();
    let sop_instance = command_str(request, tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();
    let message_id = command_u16(request, tags::MESSAGE_ID).unwrap_or(0);

    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [C_STORE_RSP]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance),
        ),
    ])
}

/// Read the command field of a command set
pub fn command_field(obj: &InMemDicomObject) -> Option<u16> {
    command_u16(obj, tags::COMMAND_FIELD)
}

/// Read the status code of a response command set
pub fn status_code(obj: &InMemDicomObject) -> Option<u16> {
    command_u16(obj, tags::STATUS)
}

/// Whether the command set announces a following data set
pub fn has_data_set(obj: &InMemDicomObject) -> bool {
    command_u16(obj, tags::COMMAND_DATA_SET_TYPE)
        .map(|v| v != NO_DATA_SET)
        .unwrap_or(false)
}

/// Aggregated sub-operation counters of a C-GET/C-MOVE response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: Option<u32>,
    pub completed: Option<u32>,
    pub failed: Option<u32>,
    pub warning: Option<u32>,
}

impl SubOperations {
    /// The counters are optional operation primitive parameters, absent
    /// values stay `None` so callers can tell "zero" from "not reported".
    pub fn from_command(obj: &InMemDicomObject) -> Self {
        Self {
            remaining: command_u32(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: command_u32(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: command_u32(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: command_u32(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }
}

fn command_str(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    obj.get(tag)
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
}

fn command_u16(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    obj.get(tag).and_then(|e| e.to_int::<u16>().ok())
}

fn command_u32(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u32> {
    obj.get(tag).and_then(|e| e.to_int::<u32>().ok())
}
