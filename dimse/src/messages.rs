//! Typed DIMSE command sets.
//!
//! Every DIMSE-C and DIMSE-N service has a pair of builder structs
//! here (`…Rq`/`…Rsp`) which produce the Command Set
//! of the respective message through the [`Command`] trait.
//! Command Sets are always encoded in Implicit VR Little Endian,
//! regardless of the transfer syntax negotiated for data sets.
//!
//! The [`CommandSet`] type is the read-side counterpart:
//! a view over a received command set with typed accessors.
use bon::Builder;
use dicom_core::value::{PrimitiveValue, Value};
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use snafu::{OptionExt, ResultExt};

use crate::commands::{CommandField, Priority, Status};
use crate::error::*;
use crate::Result;

/// Value of Command Data Set Type when a data set follows the command.
const DATA_SET_PRESENT: u16 = 0x0001;
/// Value of Command Data Set Type when no data set follows.
const NO_DATA_SET: u16 = 0x0101;

type CommandElement = InMemElement<StandardDataDictionary>;

fn el_us(tag: Tag, value: u16) -> CommandElement {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

fn el_ui(tag: Tag, value: &str) -> CommandElement {
    DataElement::new(tag, VR::UI, dicom_value!(Str, value))
}

fn el_ae(tag: Tag, value: &str) -> CommandElement {
    DataElement::new(tag, VR::AE, dicom_value!(Str, value))
}

/// A buildable DIMSE command set.
pub trait Command {
    /// The command field code of this message.
    fn command_field(&self) -> CommandField;

    /// Whether a data set follows the command set of this message.
    fn has_data_set(&self) -> bool;

    /// The service-specific command set elements.
    fn service_elements(&self) -> Vec<CommandElement>;

    /// The full command set as a DICOM object,
    /// with the Command Group Length computed on construction.
    fn dataset(&self) -> InMemDicomObject {
        let mut elements = vec![
            el_us(tags::COMMAND_FIELD, self.command_field() as u16),
            el_us(
                tags::COMMAND_DATA_SET_TYPE,
                if self.has_data_set() {
                    DATA_SET_PRESENT
                } else {
                    NO_DATA_SET
                },
            ),
        ];
        elements.extend(self.service_elements());
        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Encode the command set in Implicit VR Little Endian.
    fn encode(&self) -> Result<Vec<u8>> {
        let obj = self.dataset();
        let mut buffer = Vec::new();
        obj.write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(Box::new)
            .context(EncodeCommandSnafu)?;
        Ok(buffer)
    }
}

/// Encode a data set under the given transfer syntax.
pub fn encode_data_set(obj: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    let mut buffer = Vec::new();
    obj.write_dataset_with_ts(&mut buffer, ts)
        .map_err(Box::new)
        .context(EncodeDataSetSnafu)?;
    Ok(buffer)
}

/// Decode a data set under the given transfer syntax.
pub fn decode_data_set(bytes: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(Box::new)
        .context(DecodeDataSetSnafu)
}

/// C-ECHO request.
#[derive(Debug, Builder)]
pub struct CEchoRq<'a> {
    /// distinguishes this message from other outstanding messages
    pub message_id: u16,
    /// the SOP class of the operation (the verification SOP class)
    #[builder(default = "1.2.840.10008.1.1")]
    pub affected_sop_class_uid: &'a str,
}

impl Command for CEchoRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRq
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
        ]
    }
}

/// C-ECHO response.
#[derive(Debug, Builder)]
pub struct CEchoRsp<'a> {
    /// the Message ID of the request being answered
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    #[builder(default = 0x0000)]
    pub status: u16,
}

impl Command for CEchoRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRsp
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        out
    }
}

/// C-STORE request. The data set to store always follows.
#[derive(Debug, Builder)]
pub struct CStoreRq<'a> {
    pub message_id: u16,
    /// SOP class UID of the SOP instance to be stored
    pub affected_sop_class_uid: &'a str,
    /// UID of the SOP instance to be stored
    pub affected_sop_instance_uid: &'a str,
    #[builder(default)]
    pub priority: Priority,
    /// AE title of the node which invoked the C-MOVE
    /// that this store sub-operation belongs to
    pub move_originator_application_entity_title: Option<&'a str>,
    /// Message ID of the C-MOVE-RQ that this sub-operation belongs to
    pub move_originator_message_id: Option<u16>,
}

impl Command for CStoreRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRq
    }

    fn has_data_set(&self) -> bool {
        true
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_us(tags::PRIORITY, self.priority as u16),
            el_ui(
                tags::AFFECTED_SOP_INSTANCE_UID,
                self.affected_sop_instance_uid,
            ),
        ];
        if let Some(aet) = self.move_originator_application_entity_title {
            out.push(el_ae(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                aet,
            ));
        }
        if let Some(id) = self.move_originator_message_id {
            out.push(el_us(tags::MOVE_ORIGINATOR_MESSAGE_ID, id));
        }
        out
    }
}

/// C-STORE response.
#[derive(Debug, Builder)]
pub struct CStoreRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for CStoreRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRsp
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        out
    }
}

/// C-FIND request. The query identifier follows as the data set.
#[derive(Debug, Builder)]
pub struct CFindRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    #[builder(default)]
    pub priority: Priority,
}

impl Command for CFindRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRq
    }

    fn has_data_set(&self) -> bool {
        true
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_us(tags::PRIORITY, self.priority as u16),
        ]
    }
}

/// C-FIND response.
/// Pending responses carry a match identifier as the data set.
#[derive(Debug, Builder)]
pub struct CFindRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
    /// whether a match identifier follows this response
    #[builder(default = false)]
    pub identifier_follows: bool,
}

impl Command for CFindRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRsp
    }

    fn has_data_set(&self) -> bool {
        self.identifier_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        out
    }
}

/// C-GET request. The retrieve identifier follows as the data set.
#[derive(Debug, Builder)]
pub struct CGetRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    #[builder(default)]
    pub priority: Priority,
}

impl Command for CGetRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CGetRq
    }

    fn has_data_set(&self) -> bool {
        true
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_us(tags::PRIORITY, self.priority as u16),
        ]
    }
}

/// C-GET response, with sub-operation progress counts.
#[derive(Debug, Builder)]
pub struct CGetRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
    pub number_of_remaining_suboperations: Option<u16>,
    pub number_of_completed_suboperations: Option<u16>,
    pub number_of_failed_suboperations: Option<u16>,
    pub number_of_warning_suboperations: Option<u16>,
    #[builder(default = false)]
    pub identifier_follows: bool,
}

impl Command for CGetRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CGetRsp
    }

    fn has_data_set(&self) -> bool {
        self.identifier_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(n) = self.number_of_remaining_suboperations {
            out.push(el_us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, n));
        }
        if let Some(n) = self.number_of_completed_suboperations {
            out.push(el_us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, n));
        }
        if let Some(n) = self.number_of_failed_suboperations {
            out.push(el_us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, n));
        }
        if let Some(n) = self.number_of_warning_suboperations {
            out.push(el_us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, n));
        }
        out
    }
}

/// C-MOVE request. The retrieve identifier follows as the data set.
#[derive(Debug, Builder)]
pub struct CMoveRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    #[builder(default)]
    pub priority: Priority,
    /// AE title of the destination of the C-STORE sub-operations
    pub move_destination: &'a str,
}

impl Command for CMoveRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CMoveRq
    }

    fn has_data_set(&self) -> bool {
        true
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_us(tags::PRIORITY, self.priority as u16),
            el_ae(tags::MOVE_DESTINATION, self.move_destination),
        ]
    }
}

/// C-MOVE response, with sub-operation progress counts.
#[derive(Debug, Builder)]
pub struct CMoveRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
    pub number_of_remaining_suboperations: Option<u16>,
    pub number_of_completed_suboperations: Option<u16>,
    pub number_of_failed_suboperations: Option<u16>,
    pub number_of_warning_suboperations: Option<u16>,
    #[builder(default = false)]
    pub identifier_follows: bool,
}

impl Command for CMoveRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CMoveRsp
    }

    fn has_data_set(&self) -> bool {
        self.identifier_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(n) = self.number_of_remaining_suboperations {
            out.push(el_us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, n));
        }
        if let Some(n) = self.number_of_completed_suboperations {
            out.push(el_us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, n));
        }
        if let Some(n) = self.number_of_failed_suboperations {
            out.push(el_us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, n));
        }
        if let Some(n) = self.number_of_warning_suboperations {
            out.push(el_us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, n));
        }
        out
    }
}

/// C-CANCEL request, asking the SCP to abandon
/// the identified pending operation.
#[derive(Debug, Builder)]
pub struct CCancelRq {
    pub message_id_being_responded_to: u16,
}

impl Command for CCancelRq {
    fn command_field(&self) -> CommandField {
        CommandField::CCancelRq
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![el_us(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        )]
    }
}

/// N-EVENT-REPORT request.
#[derive(Debug, Builder)]
pub struct NEventReportRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub event_type_id: u16,
    /// whether event information follows as the data set
    #[builder(default = false)]
    pub event_information_follows: bool,
}

impl Command for NEventReportRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NEventReportRq
    }

    fn has_data_set(&self) -> bool {
        self.event_information_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_ui(
                tags::AFFECTED_SOP_INSTANCE_UID,
                self.affected_sop_instance_uid,
            ),
            el_us(tags::EVENT_TYPE_ID, self.event_type_id),
        ]
    }
}

/// N-EVENT-REPORT response.
#[derive(Debug, Builder)]
pub struct NEventReportRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub event_type_id: Option<u16>,
    pub status: u16,
    #[builder(default = false)]
    pub event_reply_follows: bool,
}

impl Command for NEventReportRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NEventReportRsp
    }

    fn has_data_set(&self) -> bool {
        self.event_reply_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        if let Some(id) = self.event_type_id {
            out.push(el_us(tags::EVENT_TYPE_ID, id));
        }
        out
    }
}

/// N-GET request.
#[derive(Debug, Builder)]
pub struct NGetRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
    /// attribute values to be retrieved; empty means all
    #[builder(default)]
    pub attribute_identifier_list: Vec<Tag>,
}

impl Command for NGetRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NGetRq
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
        ];
        if !self.attribute_identifier_list.is_empty() {
            out.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                Value::Primitive(PrimitiveValue::Tags(
                    self.attribute_identifier_list.iter().copied().collect(),
                )),
            ));
        }
        out
    }
}

/// N-GET response. Retrieved attributes follow as the data set.
#[derive(Debug, Builder)]
pub struct NGetRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
    #[builder(default = false)]
    pub attributes_follow: bool,
}

impl Command for NGetRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NGetRsp
    }

    fn has_data_set(&self) -> bool {
        self.attributes_follow
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        out
    }
}

/// N-SET request. The modification list follows as the data set.
#[derive(Debug, Builder)]
pub struct NSetRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
}

impl Command for NSetRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NSetRq
    }

    fn has_data_set(&self) -> bool {
        true
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
        ]
    }
}

/// N-SET response.
#[derive(Debug, Builder)]
pub struct NSetRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
    #[builder(default = false)]
    pub attributes_follow: bool,
}

impl Command for NSetRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NSetRsp
    }

    fn has_data_set(&self) -> bool {
        self.attributes_follow
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        out
    }
}

/// N-ACTION request.
#[derive(Debug, Builder)]
pub struct NActionRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
    pub action_type_id: u16,
    /// whether action information follows as the data set
    #[builder(default = false)]
    pub action_information_follows: bool,
}

impl Command for NActionRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NActionRq
    }

    fn has_data_set(&self) -> bool {
        self.action_information_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
            el_us(tags::ACTION_TYPE_ID, self.action_type_id),
        ]
    }
}

/// N-ACTION response.
#[derive(Debug, Builder)]
pub struct NActionRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub action_type_id: Option<u16>,
    pub status: u16,
    #[builder(default = false)]
    pub action_reply_follows: bool,
}

impl Command for NActionRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NActionRsp
    }

    fn has_data_set(&self) -> bool {
        self.action_reply_follows
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        if let Some(id) = self.action_type_id {
            out.push(el_us(tags::ACTION_TYPE_ID, id));
        }
        out
    }
}

/// N-CREATE request. The attribute list may follow as the data set.
#[derive(Debug, Builder)]
pub struct NCreateRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    /// the instance to create; omitted when the SCP assigns it
    pub affected_sop_instance_uid: Option<&'a str>,
    #[builder(default = false)]
    pub attributes_follow: bool,
}

impl Command for NCreateRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NCreateRq
    }

    fn has_data_set(&self) -> bool {
        self.attributes_follow
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
        ];
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        out
    }
}

/// N-CREATE response.
#[derive(Debug, Builder)]
pub struct NCreateRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
    #[builder(default = false)]
    pub attributes_follow: bool,
}

impl Command for NCreateRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NCreateRsp
    }

    fn has_data_set(&self) -> bool {
        self.attributes_follow
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        out
    }
}

/// N-DELETE request.
#[derive(Debug, Builder)]
pub struct NDeleteRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
}

impl Command for NDeleteRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NDeleteRq
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        vec![
            el_ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            el_us(tags::MESSAGE_ID, self.message_id),
            el_ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
        ]
    }
}

/// N-DELETE response.
#[derive(Debug, Builder)]
pub struct NDeleteRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for NDeleteRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NDeleteRsp
    }

    fn has_data_set(&self) -> bool {
        false
    }

    fn service_elements(&self) -> Vec<CommandElement> {
        let mut out = vec![
            el_us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            el_us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            out.push(el_ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            out.push(el_ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        out
    }
}

/// A received command set, with typed accessors
/// over the elements of Part 7 Annex E.
#[derive(Debug, Clone)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

impl CommandSet {
    /// Decode a command set from Implicit VR Little Endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            bytes,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(Box::new)
        .context(DecodeCommandSnafu)?;
        Ok(CommandSet { obj })
    }

    /// Wrap an already decoded command object.
    pub fn from_object(obj: InMemDicomObject) -> Self {
        CommandSet { obj }
    }

    fn required_u16(&self, tag: Tag, name: &'static str) -> Result<u16> {
        self.obj
            .element(tag)
            .ok()
            .context(MissingCommandElementSnafu { name })?
            .to_int::<u16>()
            .context(ConvertCommandElementSnafu { name })
    }

    fn optional_u16(&self, tag: Tag) -> Option<u16> {
        self.obj.element(tag).ok()?.to_int::<u16>().ok()
    }

    fn optional_str(&self, tag: Tag) -> Option<String> {
        let value = self.obj.element(tag).ok()?.to_str().ok()?;
        Some(
            value
                .trim_end_matches(|c: char| c == '\0' || c == ' ')
                .to_string(),
        )
    }

    /// The command field of the message.
    pub fn command_field(&self) -> Result<CommandField> {
        let value = self.required_u16(tags::COMMAND_FIELD, "Command Field")?;
        CommandField::try_from(value)
            .map_err(|value| UnknownCommandFieldSnafu { value }.build())
    }

    /// The Message ID of a request.
    pub fn message_id(&self) -> Result<u16> {
        self.required_u16(tags::MESSAGE_ID, "Message ID")
    }

    /// The Message ID a response correlates to.
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.required_u16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    /// The status of a response.
    pub fn status(&self) -> Result<Status> {
        self.required_u16(tags::STATUS, "Status").map(Status)
    }

    /// Whether a data set follows this command set.
    pub fn has_data_set(&self) -> bool {
        self.optional_u16(tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.optional_str(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.optional_str(tags::REQUESTED_SOP_CLASS_UID)
    }

    /// The SOP class of the operation,
    /// affected or requested depending on the service.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.affected_sop_class_uid()
            .or_else(|| self.requested_sop_class_uid())
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.optional_str(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        self.optional_str(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    /// The SOP instance of the operation,
    /// affected or requested depending on the service.
    pub fn sop_instance_uid(&self) -> Option<String> {
        self.affected_sop_instance_uid()
            .or_else(|| self.requested_sop_instance_uid())
    }

    pub fn priority(&self) -> Option<u16> {
        self.optional_u16(tags::PRIORITY)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.optional_str(tags::MOVE_DESTINATION)
    }

    pub fn move_originator_ae_title(&self) -> Option<String> {
        self.optional_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
    }

    pub fn event_type_id(&self) -> Option<u16> {
        self.optional_u16(tags::EVENT_TYPE_ID)
    }

    pub fn action_type_id(&self) -> Option<u16> {
        self.optional_u16(tags::ACTION_TYPE_ID)
    }

    pub fn number_of_remaining_suboperations(&self) -> Option<u16> {
        self.optional_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
    }

    pub fn number_of_completed_suboperations(&self) -> Option<u16> {
        self.optional_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)
    }

    pub fn number_of_failed_suboperations(&self) -> Option<u16> {
        self.optional_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS)
    }

    pub fn number_of_warning_suboperations(&self) -> Option<u16> {
        self.optional_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS)
    }

    /// The attribute identifier list of an N-GET request.
    pub fn attribute_identifier_list(&self) -> Option<Vec<Tag>> {
        let element = self.obj.element(tags::ATTRIBUTE_IDENTIFIER_LIST).ok()?;
        match element.value() {
            Value::Primitive(PrimitiveValue::Tags(tags)) => Some(tags.to_vec()),
            _ => None,
        }
    }

    /// A view over the underlying command object.
    pub fn inner(&self) -> &InMemDicomObject {
        &self.obj
    }

    /// Unwrap into the underlying command object.
    pub fn into_inner(self) -> InMemDicomObject {
        self.obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_command_roundtrip() {
        let rq = CEchoRq::builder().message_id(7).build();
        let bytes = rq.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::CEchoRq);
        assert_eq!(cs.message_id().unwrap(), 7);
        assert_eq!(
            cs.affected_sop_class_uid().as_deref(),
            Some("1.2.840.10008.1.1")
        );
        assert!(!cs.has_data_set());
    }

    #[test]
    fn store_request_declares_data_set() {
        let rq = CStoreRq::builder()
            .message_id(42)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
            .affected_sop_instance_uid("1.2.3.4.5")
            .build();
        let bytes = rq.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::CStoreRq);
        assert!(cs.has_data_set());
        assert_eq!(cs.message_id().unwrap(), 42);
        assert_eq!(
            cs.affected_sop_instance_uid().as_deref(),
            Some("1.2.3.4.5")
        );
        assert_eq!(cs.priority(), Some(Priority::Medium as u16));
    }

    #[test]
    fn store_response_correlates_to_request() {
        let rsp = CStoreRsp::builder()
            .message_id_being_responded_to(42)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
            .affected_sop_instance_uid("1.2.3.4.5")
            .status(0x0000)
            .build();
        let bytes = rsp.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::CStoreRsp);
        assert_eq!(cs.message_id_being_responded_to().unwrap(), 42);
        assert_eq!(cs.status().unwrap(), Status::SUCCESS);
        assert!(!cs.has_data_set());
    }

    #[test]
    fn find_response_pending_carries_identifier() {
        let rsp = CFindRsp::builder()
            .message_id_being_responded_to(3)
            .status(0xFF00)
            .identifier_follows(true)
            .build();
        let bytes = rsp.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::CFindRsp);
        assert!(cs.status().unwrap().is_pending());
        assert!(cs.has_data_set());
    }

    #[test]
    fn move_request_carries_destination() {
        let rq = CMoveRq::builder()
            .message_id(9)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.2")
            .move_destination("STORE-SCP")
            .build();
        let bytes = rq.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::CMoveRq);
        assert_eq!(cs.move_destination().as_deref(), Some("STORE-SCP"));
    }

    #[test]
    fn n_get_request_attribute_list() {
        let rq = NGetRq::builder()
            .message_id(5)
            .requested_sop_class_uid("1.2.840.10008.5.1.4.39.1")
            .requested_sop_instance_uid("1.2.3.4")
            .attribute_identifier_list(vec![tags::PATIENT_NAME, tags::PATIENT_ID])
            .build();
        let bytes = rq.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::NGetRq);
        assert_eq!(
            cs.requested_sop_instance_uid().as_deref(),
            Some("1.2.3.4")
        );
        assert_eq!(
            cs.attribute_identifier_list(),
            Some(vec![tags::PATIENT_NAME, tags::PATIENT_ID])
        );
        assert!(!cs.has_data_set());
    }

    #[test]
    fn cancel_request_correlation() {
        let rq = CCancelRq::builder()
            .message_id_being_responded_to(77)
            .build();
        let bytes = rq.encode().unwrap();
        let cs = CommandSet::from_bytes(&bytes).unwrap();

        assert_eq!(cs.command_field().unwrap(), CommandField::CCancelRq);
        assert_eq!(cs.message_id_being_responded_to().unwrap(), 77);
    }

    #[test]
    fn data_set_roundtrip_with_registry_transfer_syntax() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(el_ui(tags::SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.1.2"));
        obj.put(el_ui(tags::SOP_INSTANCE_UID, "1.2.3.4.5"));

        let bytes = encode_data_set(&obj, "1.2.840.10008.1.2.1").unwrap();
        let back = decode_data_set(&bytes, "1.2.840.10008.1.2.1").unwrap();
        assert_eq!(
            back.element(tags::SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3.4.5"
        );

        assert!(matches!(
            encode_data_set(&obj, "1.2.3.999"),
            Err(crate::Error::UnsupportedTransferSyntax { .. })
        ));
    }
}
