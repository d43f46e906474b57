//! DIMSE command sets.
//!
//! A DIMSE message starts with a _command set_,
//! a data set of group `0000` elements
//! always encoded in _Implicit VR Little Endian_.
//! This module provides typed request and response structs
//! for the composite and normalized services,
//! the [`Command`] trait rendering them into command sets,
//! and [`CommandSet`], the decoded form of an inbound command.
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt};

use super::{DecodeCommandSnafu, EncodeCommandSnafu, MissingCommandFieldSnafu, Result};

/// The priority of a composite service request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Command field codes of the DIMSE services.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    /// Interpret a command field code.
    pub fn from_code(code: u16) -> Option<Self> {
        let field = match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        };
        Some(field)
    }

    /// The response field code answering this request field code.
    pub fn response_code(code: u16) -> u16 {
        code | 0x8000
    }
}

/// Whether a command field code identifies a response message.
pub fn is_response_field(code: u16) -> bool {
    code & 0x8000 != 0 && code != CommandField::CCancelRq as u16
}

/// Well-known DIMSE status codes.
pub mod status {
    /// The operation completed successfully.
    pub const SUCCESS: u16 = 0x0000;
    /// The operation was canceled at the requestor's demand.
    pub const CANCEL: u16 = 0xFE00;
    /// Another response for this request will follow.
    pub const PENDING: u16 = 0xFF00;
    /// Another response will follow; some optional keys were not matched.
    pub const PENDING_WARNING: u16 = 0xFF01;
    /// The affected SOP class is not supported by this node.
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    /// The operation could not be processed.
    pub const PROCESSING_FAILURE: u16 = 0x0110;

    /// Whether this status announces further responses
    /// for the same request.
    pub fn is_pending(status: u16) -> bool {
        status == PENDING || status == PENDING_WARNING
    }
}

/// Data set type marker for a command set
/// which is followed by a data set.
const DATA_SET_PRESENT: u16 = 0x0001;
/// Data set type marker for a command set with no data set.
const DATA_SET_ABSENT: u16 = 0x0101;

/// A value which can be rendered into a DIMSE command set.
pub trait Command {
    /// The command field code of this message.
    fn command_field(&self) -> u16;

    /// Build the command set elements,
    /// except for the data set type.
    fn command_set(&self) -> InMemDicomObject;

    /// Encode the full command set in _Implicit VR Little Endian_,
    /// declaring whether a data set follows.
    fn encode(&self, dataset_follows: bool) -> Result<Vec<u8>> {
        let mut obj = self.command_set();
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if dataset_follows {
                    DATA_SET_PRESENT
                } else {
                    DATA_SET_ABSENT
                }]
            ),
        ));
        let mut buffer = Vec::new();
        obj.write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(EncodeCommandSnafu)?;
        Ok(buffer)
    }
}

/// A command which initiates an operation,
/// carrying the message ID the responses will be correlated with.
pub trait RequestCommand: Command {
    /// The message ID of this request.
    fn message_id(&self) -> u16;
}

/// C-ECHO request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRq {
    pub message_id: u16,
}

impl Command for CEchoRq {
    fn command_field(&self) -> u16 {
        CommandField::CEchoRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, "1.2.840.10008.1.1"),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
        ])
    }
}

impl RequestCommand for CEchoRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// C-ECHO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRsp {
    pub message_id_being_responded_to: u16,
    pub status: u16,
}

impl Command for CEchoRsp {
    fn command_field(&self) -> u16 {
        CommandField::CEchoRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, "1.2.840.10008.1.1"),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
        ])
    }
}

/// C-STORE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub priority: Priority,
    /// AE title of the C-MOVE originator,
    /// when this store is one of its sub-operations
    pub move_originator_ae_title: Option<String>,
    /// message ID of the originating C-MOVE request, if any
    pub move_originator_message_id: Option<u16>,
}

impl Command for CStoreRq {
    fn command_field(&self) -> u16 {
        CommandField::CStoreRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [self.priority as u16]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_instance_uid.as_str()),
            ),
        ]);
        if let Some(ae_title) = &self.move_originator_ae_title {
            obj.put(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, ae_title.as_str()),
            ));
        }
        if let Some(message_id) = self.move_originator_message_id {
            obj.put(DataElement::new(
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [message_id]),
            ));
        }
        obj
    }
}

impl RequestCommand for CStoreRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// C-STORE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub status: u16,
}

impl Command for CStoreRsp {
    fn command_field(&self) -> u16 {
        CommandField::CStoreRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_instance_uid.as_str()),
            ),
        ])
    }
}

/// C-FIND request.
///
/// The identifier (query) data set always follows the command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFindRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
}

impl Command for CFindRq {
    fn command_field(&self) -> u16 {
        CommandField::CFindRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        composite_request_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id,
            self.priority,
        )
    }
}

impl RequestCommand for CFindRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// C-FIND response.
///
/// Responses with a pending status carry a matching identifier
/// as their data set;
/// the final response carries none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFindRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub status: u16,
}

impl Command for CFindRsp {
    fn command_field(&self) -> u16 {
        CommandField::CFindRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        composite_response_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id_being_responded_to,
            self.status,
        )
    }
}

/// C-GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGetRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
}

impl Command for CGetRq {
    fn command_field(&self) -> u16 {
        CommandField::CGetRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        composite_request_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id,
            self.priority,
        )
    }
}

impl RequestCommand for CGetRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// C-GET response, with its sub-operation counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGetRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub status: u16,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

impl Command for CGetRsp {
    fn command_field(&self) -> u16 {
        CommandField::CGetRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = composite_response_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id_being_responded_to,
            self.status,
        );
        put_sub_operation_counters(
            &mut obj,
            self.remaining,
            self.completed,
            self.failed,
            self.warning,
        );
        obj
    }
}

/// C-MOVE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CMoveRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
    /// the AE title the matched instances shall be sent to
    pub move_destination: String,
}

impl Command for CMoveRq {
    fn command_field(&self) -> u16 {
        CommandField::CMoveRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = composite_request_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id,
            self.priority,
        );
        obj.put(DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, self.move_destination.as_str()),
        ));
        obj
    }
}

impl RequestCommand for CMoveRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// C-MOVE response, with its sub-operation counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CMoveRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub status: u16,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

impl Command for CMoveRsp {
    fn command_field(&self) -> u16 {
        CommandField::CMoveRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = composite_response_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id_being_responded_to,
            self.status,
        );
        put_sub_operation_counters(
            &mut obj,
            self.remaining,
            self.completed,
            self.failed,
            self.warning,
        );
        obj
    }
}

/// C-CANCEL request,
/// asking the performer to stop a multi-response operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CCancelRq {
    pub message_id_being_responded_to: u16,
}

impl Command for CCancelRq {
    fn command_field(&self) -> u16 {
        CommandField::CCancelRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
        ])
    }
}

/// N-CREATE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NCreateRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    /// the instance to create; may be omitted
    /// to let the performer assign one
    pub affected_sop_instance_uid: Option<String>,
}

impl Command for NCreateRq {
    fn command_field(&self) -> u16 {
        CommandField::NCreateRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
        ]);
        if let Some(uid) = &self.affected_sop_instance_uid {
            obj.put(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        obj
    }
}

impl RequestCommand for NCreateRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// N-CREATE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NCreateRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: Option<String>,
    pub status: u16,
}

impl Command for NCreateRsp {
    fn command_field(&self) -> u16 {
        CommandField::NCreateRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = composite_response_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id_being_responded_to,
            self.status,
        );
        if let Some(uid) = &self.affected_sop_instance_uid {
            obj.put(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        obj
    }
}

/// N-SET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NSetRq {
    pub message_id: u16,
    pub requested_sop_class_uid: String,
    pub requested_sop_instance_uid: String,
}

impl Command for NSetRq {
    fn command_field(&self) -> u16 {
        CommandField::NSetRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::REQUESTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.requested_sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::REQUESTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.requested_sop_instance_uid.as_str()),
            ),
        ])
    }
}

impl RequestCommand for NSetRq {
    fn message_id(&self) -> u16 {
        self.message_id
    }
}

/// N-SET response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NSetRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: Option<String>,
    pub status: u16,
}

impl Command for NSetRsp {
    fn command_field(&self) -> u16 {
        CommandField::NSetRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = composite_response_command_set(
            self.command_field(),
            &self.affected_sop_class_uid,
            self.message_id_being_responded_to,
            self.status,
        );
        if let Some(uid) = &self.affected_sop_instance_uid {
            obj.put(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        obj
    }
}

fn composite_request_command_set(
    command_field: u16,
    affected_sop_class_uid: &str,
    message_id: u16,
    priority: Priority,
) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
    ])
}

fn composite_response_command_set(
    command_field: u16,
    affected_sop_class_uid: &str,
    message_id_being_responded_to: u16,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_being_responded_to]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

fn put_sub_operation_counters(
    obj: &mut InMemDicomObject,
    remaining: Option<u16>,
    completed: Option<u16>,
    failed: Option<u16>,
    warning: Option<u16>,
) {
    for (tag, count) in [
        (tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining),
        (tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, completed),
        (tags::NUMBER_OF_FAILED_SUBOPERATIONS, failed),
        (tags::NUMBER_OF_WARNING_SUBOPERATIONS, warning),
    ] {
        if let Some(count) = count {
            obj.put(DataElement::new(tag, VR::US, dicom_value!(U16, [count])));
        }
    }
}

/// A decoded inbound command set.
#[derive(Debug, Clone)]
pub struct CommandSet(InMemDicomObject);

impl CommandSet {
    /// Decode a command set from its
    /// _Implicit VR Little Endian_ encoded form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            data,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(DecodeCommandSnafu)?;
        Ok(CommandSet(obj))
    }

    /// Wrap an already materialized command set object.
    pub fn from_object(obj: InMemDicomObject) -> Self {
        CommandSet(obj)
    }

    /// Access the underlying data set.
    pub fn inner(&self) -> &InMemDicomObject {
        &self.0
    }

    fn uint(&self, tag: dicom_core::Tag, field: &'static str) -> Result<u16> {
        self.0
            .element(tag)
            .ok()
            .and_then(|element| element.to_int::<u16>().ok())
            .context(MissingCommandFieldSnafu { field })
    }

    fn string(&self, tag: dicom_core::Tag) -> Option<String> {
        self.0
            .element(tag)
            .ok()
            .and_then(|element| element.to_str().ok())
            .map(|value| value.trim_end_matches('\0').to_string())
    }

    /// The command field code.
    pub fn command_field(&self) -> Result<u16> {
        self.uint(tags::COMMAND_FIELD, "Command Field")
    }

    /// The message ID of a request command.
    pub fn message_id(&self) -> Result<u16> {
        self.uint(tags::MESSAGE_ID, "Message ID")
    }

    /// The message ID a response command answers.
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.uint(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    /// The status of a response command.
    pub fn status(&self) -> Result<u16> {
        self.uint(tags::STATUS, "Status")
    }

    /// The affected or requested SOP class UID, whichever is present.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.string(tags::AFFECTED_SOP_CLASS_UID)
            .or_else(|| self.string(tags::REQUESTED_SOP_CLASS_UID))
    }

    /// The affected or requested SOP instance UID, whichever is present.
    pub fn sop_instance_uid(&self) -> Option<String> {
        self.string(tags::AFFECTED_SOP_INSTANCE_UID)
            .or_else(|| self.string(tags::REQUESTED_SOP_INSTANCE_UID))
    }

    /// Whether a data set follows this command set.
    pub fn has_data_set(&self) -> bool {
        self.uint(tags::COMMAND_DATA_SET_TYPE, "Command Data Set Type")
            .map(|value| value != DATA_SET_ABSENT)
            .unwrap_or(false)
    }

    /// Whether this command is a response message.
    pub fn is_response(&self) -> Result<bool> {
        Ok(is_response_field(self.command_field()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_round_trips() {
        let rq = CEchoRq { message_id: 7 };
        let bytes = rq.encode(false).unwrap();

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded.command_field().unwrap(), 0x0030);
        assert_eq!(decoded.message_id().unwrap(), 7);
        assert_eq!(decoded.sop_class_uid().as_deref(), Some("1.2.840.10008.1.1"));
        assert!(!decoded.has_data_set());
        assert!(!decoded.is_response().unwrap());
    }

    #[test]
    fn store_request_declares_its_data_set() {
        let rq = CStoreRq {
            message_id: 42,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
            affected_sop_instance_uid: "2.25.276540533432425367753953352996924301".to_string(),
            priority: Priority::Medium,
            move_originator_ae_title: None,
            move_originator_message_id: None,
        };
        let bytes = rq.encode(true).unwrap();

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded.command_field().unwrap(), 0x0001);
        assert!(decoded.has_data_set());
        assert_eq!(
            decoded.sop_class_uid().as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.4")
        );
        assert_eq!(
            decoded.sop_instance_uid().as_deref(),
            Some("2.25.276540533432425367753953352996924301")
        );
    }

    #[test]
    fn find_response_statuses() {
        let pending = CFindRsp {
            message_id_being_responded_to: 3,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
            status: status::PENDING,
        };
        let bytes = pending.encode(true).unwrap();
        let decoded = CommandSet::decode(&bytes).unwrap();
        assert!(decoded.is_response().unwrap());
        assert_eq!(decoded.message_id_being_responded_to().unwrap(), 3);
        assert!(status::is_pending(decoded.status().unwrap()));

        let done = CFindRsp {
            status: status::SUCCESS,
            ..pending
        };
        let bytes = done.encode(false).unwrap();
        let decoded = CommandSet::decode(&bytes).unwrap();
        assert!(!status::is_pending(decoded.status().unwrap()));
        assert!(!decoded.has_data_set());
    }

    #[test]
    fn cancel_is_not_a_response() {
        assert!(!is_response_field(CommandField::CCancelRq as u16));
        assert!(is_response_field(CommandField::CMoveRsp as u16));
        assert_eq!(CommandField::response_code(0x0021), 0x8021);
    }
}
