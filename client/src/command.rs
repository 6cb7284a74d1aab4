//! DIMSE command set definitions and builders.
//!
//! A DIMSE message starts with a small command set:
//! a DICOM data set of group `0000` elements
//! always encoded in _Implicit VR Little Endian_.
//! This module holds the command field and status code vocabulary
//! and the builders producing command sets
//! for the composite operations of the client.

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

/// Value of `(0000,0800)` command data set type
/// when the message carries no data set.
pub const DATA_SET_MISSING: u16 = 0x0101;

/// Value of `(0000,0800)` command data set type
/// when a data set follows the command set.
///
/// Receivers should treat any value other than
/// [`DATA_SET_MISSING`] as the truthy state.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// The command field codes of the DIMSE-C
/// and DIMSE-N operations (PS3.7 E.1).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandField {
    /// C-STORE-RQ
    CStoreRq = 0x0001,
    /// C-STORE-RSP
    CStoreRsp = 0x8001,
    /// C-GET-RQ
    CGetRq = 0x0010,
    /// C-GET-RSP
    CGetRsp = 0x8010,
    /// C-FIND-RQ
    CFindRq = 0x0020,
    /// C-FIND-RSP
    CFindRsp = 0x8020,
    /// C-MOVE-RQ
    CMoveRq = 0x0021,
    /// C-MOVE-RSP
    CMoveRsp = 0x8021,
    /// C-ECHO-RQ
    CEchoRq = 0x0030,
    /// C-ECHO-RSP
    CEchoRsp = 0x8030,
    /// C-CANCEL-RQ
    CCancelRq = 0x0FFF,
}

impl CommandField {
    /// Whether this command field code designates a response message.
    pub fn is_response(self) -> bool {
        (self as u16) & 0x8000 != 0
    }
}

impl TryFrom<u16> for CommandField {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(CommandField::CStoreRq),
            0x8001 => Ok(CommandField::CStoreRsp),
            0x0010 => Ok(CommandField::CGetRq),
            0x8010 => Ok(CommandField::CGetRsp),
            0x0020 => Ok(CommandField::CFindRq),
            0x8020 => Ok(CommandField::CFindRsp),
            0x0021 => Ok(CommandField::CMoveRq),
            0x8021 => Ok(CommandField::CMoveRsp),
            0x0030 => Ok(CommandField::CEchoRq),
            0x8030 => Ok(CommandField::CEchoRsp),
            0x0FFF => Ok(CommandField::CCancelRq),
            other => Err(other),
        }
    }
}

/// The priority of a composite request, `(0000,0700)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    /// low priority
    Low = 0x0002,
    /// medium priority (the default)
    Medium = 0x0000,
    /// high priority
    High = 0x0001,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Status categories of DIMSE responses (PS3.7 annex C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
    /// the operation completed
    Success,
    /// the operation completed with warnings
    Warning,
    /// the operation failed
    Failure,
    /// the operation was canceled
    Cancel,
    /// the operation is still in progress,
    /// further responses will follow
    Pending,
}

impl TryFrom<u16> for StatusType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
            0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
            0xFE00 => Ok(Self::Cancel),
            0xFF00 | 0xFF01 => Ok(Self::Pending),
            _ => Err(value),
        }
    }
}

/// Build a C-ECHO-RQ command set.
pub fn echo_rq(message_id: u16, affected_sop_class_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CEchoRq as u16]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_MISSING]),
        ),
    ])
}

/// Build a C-FIND-RQ command set.
/// The query identifier travels as the message data set.
pub fn find_rq(message_id: u16, affected_sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CFindRq as u16]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

/// Build a C-STORE-RQ command set.
pub fn store_rq(
    message_id: u16,
    affected_sop_class_uid: &str,
    affected_sop_instance_uid: &str,
    priority: Priority,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CStoreRq as u16]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_instance_uid),
        ),
    ])
}

/// Build a C-MOVE-RQ command set.
/// The move destination names the AE which will receive
/// the resulting C-STORE sub-operations.
pub fn move_rq(
    message_id: u16,
    affected_sop_class_uid: &str,
    move_destination: &str,
    priority: Priority,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CMoveRq as u16]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(move_destination),
        ),
    ])
}

/// Build a C-GET-RQ command set.
pub fn get_rq(message_id: u16, affected_sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CGetRq as u16]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

/// Build a C-CANCEL-RQ command set
/// targeting a previously issued multi-response request.
pub fn cancel_rq(message_id_being_responded_to: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CCancelRq as u16]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_being_responded_to]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_MISSING]),
        ),
    ])
}

/// Build a composite response command set,
/// as emitted by service class providers.
///
/// Primarily useful for exercising the client
/// against in-process acceptors.
pub fn composite_rsp(
    command_field: CommandField,
    affected_sop_class_uid: &str,
    message_id_being_responded_to: u16,
    status: u16,
    has_data_set: bool,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field as u16]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_being_responded_to]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if has_data_set {
                    DATA_SET_PRESENT
                } else {
                    DATA_SET_MISSING
                }]
            ),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}
