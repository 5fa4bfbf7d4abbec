//! PDU reader module
use std::io::{Cursor, ErrorKind, Read};

use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::warn;

use crate::pdu::*;

/// An error which may occur when reading a PDU from a data source.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("Could not read PDU field `{}`: {}", field, source))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Field `{}` of {} bytes does not fit the enclosing item",
        field,
        length
    ))]
    LengthMismatch {
        field: &'static str,
        length: u32,
        backtrace: Backtrace,
    },

    /// invalid association rejection source or reason
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    /// invalid abort source or reason
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    /// invalid presentation context result reason
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("invalid user identity type {}", value))]
    InvalidUserIdentityType { value: u8, backtrace: Backtrace },

    #[snafu(display("unknown sub-item type {:#04x}", item_type))]
    UnknownSubItem { item_type: u8, backtrace: Backtrace },

    /// multiple transfer syntaxes in a presentation context result
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    /// missing application context name
    MissingApplicationContextName { backtrace: Backtrace },

    /// missing abstract syntax in proposed presentation context
    MissingAbstractSyntax { backtrace: Backtrace },

    /// missing transfer syntax in presentation context result
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T, E = ReadError> = std::result::Result<T, E>;

/// A top level variable item of an A-ASSOCIATE-RQ or A-ASSOCIATE-AC PDU.
#[derive(Debug)]
enum VariableItem {
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
    Unknown(u8),
}

/// Read a PDU from the given data source.
///
/// Returns `Ok(None)` if the source does not yet contain a full PDU,
/// in which case the caller should obtain more bytes
/// and try again from the beginning.
///
/// When `strict` is set, incoming PDUs larger than `max_pdu_length`
/// are refused; otherwise the limit is stretched
/// up to [`MAXIMUM_PDU_SIZE`] with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: Read,
{
    // PDU-type (1), reserved (1), PDU-length (4)
    let mut head = [0u8; 6];
    if let Err(e) = reader.read_exact(&mut head) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = head[0];
    let pdu_length = u32::from_be_bytes([head[2], head[3], head[4], head[5]]);

    let effective_limit = if strict {
        max_pdu_length
    } else {
        let limit = max_pdu_length.max(MAXIMUM_PDU_SIZE);
        if pdu_length > max_pdu_length && pdu_length <= limit {
            warn!(
                "Incoming PDU of {} bytes exceeds the agreed maximum of {}",
                pdu_length, max_pdu_length
            );
        }
        limit
    };
    ensure!(
        pdu_length <= effective_limit,
        PduTooLargeSnafu {
            pdu_length,
            max_pdu_length: effective_limit,
        }
    );

    // growth is driven by the actual bytes read,
    // not by the length a peer merely declares
    let mut body = Vec::with_capacity(pdu_length.min(MAXIMUM_PDU_SIZE) as usize);
    reader
        .take(u64::from(pdu_length))
        .read_to_end(&mut body)
        .context(ReadPduFieldSnafu { field: "body" })?;
    if body.len() < pdu_length as usize {
        return Ok(None);
    }

    let mut cursor = Cursor::new(body);

    match pdu_type {
        0x01 => read_association_rq(&mut cursor).map(Some),
        0x02 => read_association_ac(&mut cursor).map(Some),
        0x03 => {
            // reserved (1), result (1), source (1), reason (1)
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AssociationRJ(AssociationRJ { result, source })))
        }
        0x04 => {
            let mut values = Vec::new();
            while remaining(&cursor) > 0 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2 && u64::from(item_length) <= remaining(&cursor),
                    LengthMismatchSnafu {
                        field: "Presentation-data-value",
                        length: item_length,
                    }
                );
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;
                // message control header: bit 0 = command, bit 1 = last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;
                let data = read_n(&mut cursor, item_length - 2, "Presentation-data-value")?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }
            Ok(Some(Pdu::PData { data: values }))
        }
        0x05 => {
            // 4 reserved bytes, any value
            let len = remaining(&cursor) as u32;
            let _ = read_n(&mut cursor, len, "reserved")?;
            Ok(Some(Pdu::ReleaseRQ))
        }
        0x06 => {
            let len = remaining(&cursor) as u32;
            let _ = read_n(&mut cursor, len, "reserved")?;
            Ok(Some(Pdu::ReleaseRP))
        }
        0x07 => {
            // reserved (2), source (1), reason (1)
            cursor
                .read_u16::<BigEndian>()
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;
            Ok(Some(Pdu::AbortRQ { source }))
        }
        _ => Ok(Some(Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        })),
    }
}

fn read_association_rq(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    cursor
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "reserved" })?;

    let called_ae_title = read_ae_title(cursor, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, "Calling-AE-title")?;

    // 32 reserved bytes, any value
    let _ = read_n(cursor, 32, "reserved")?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while remaining(cursor) > 0 {
        match read_variable_item(cursor)? {
            VariableItem::ApplicationContext(name) => application_context_name = Some(name),
            VariableItem::PresentationContextProposed(pc) => presentation_contexts.push(pc),
            VariableItem::UserVariables(vars) => user_variables = vars,
            item => {
                warn!("Ignoring misplaced variable item in A-ASSOCIATE-RQ: {:?}", item);
            }
        }
    }

    Ok(Pdu::AssociationRQ(AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

fn read_association_ac(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    cursor
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "reserved" })?;

    // mirrored AE title fields, reserved but kept for diagnostics
    let called_ae_title = read_ae_title(cursor, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, "Calling-AE-title")?;
    let _ = read_n(cursor, 32, "reserved")?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while remaining(cursor) > 0 {
        match read_variable_item(cursor)? {
            VariableItem::ApplicationContext(name) => application_context_name = Some(name),
            VariableItem::PresentationContextResult(pc) => presentation_contexts.push(pc),
            VariableItem::UserVariables(vars) => user_variables = vars,
            item => {
                warn!("Ignoring misplaced variable item in A-ASSOCIATE-AC: {:?}", item);
            }
        }
    }

    Ok(Pdu::AssociationAC(AssociationAC {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

fn read_variable_item(cursor: &mut Cursor<Vec<u8>>) -> Result<VariableItem> {
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "reserved" })?;
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    let body = read_n(cursor, u32::from(item_length), "variable item")?;
    let mut cursor = Cursor::new(body);

    match item_type {
        0x10 => Ok(VariableItem::ApplicationContext(trimmed_text(
            &cursor.into_inner(),
        ))),
        0x20 => {
            let id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            let _ = read_n(&mut cursor, 3, "reserved")?;

            let mut abstract_syntax = None;
            let mut transfer_syntaxes = Vec::new();
            while remaining(&cursor) > 0 {
                let (sub_type, sub_body) = read_sub_item(&mut cursor)?;
                match sub_type {
                    0x30 => abstract_syntax = Some(trimmed_text(&sub_body)),
                    0x40 => transfer_syntaxes.push(trimmed_text(&sub_body)),
                    other => return UnknownSubItemSnafu { item_type: other }.fail(),
                }
            }

            Ok(VariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            let id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            let reason =
                PresentationContextResultReason::from(cursor.read_u8().context(
                    ReadPduFieldSnafu {
                        field: "Result/Reason",
                    },
                )?)
                .context(InvalidPresentationContextResultReasonSnafu)?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "reserved" })?;

            let mut transfer_syntax = None;
            while remaining(&cursor) > 0 {
                let (sub_type, sub_body) = read_sub_item(&mut cursor)?;
                match sub_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(trimmed_text(&sub_body));
                    }
                    other => return UnknownSubItemSnafu { item_type: other }.fail(),
                }
            }

            Ok(VariableItem::PresentationContextResult(
                PresentationContextResult {
                    id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            let mut user_variables = Vec::new();
            while remaining(&cursor) > 0 {
                let (sub_type, sub_body) = read_sub_item(&mut cursor)?;
                user_variables.push(read_user_variable(sub_type, sub_body)?);
            }
            Ok(VariableItem::UserVariables(user_variables))
        }
        _ => Ok(VariableItem::Unknown(item_type)),
    }
}

fn read_user_variable(item_type: u8, body: Vec<u8>) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(body);
    match item_type {
        0x51 => {
            let max_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-length-received",
            })?;
            Ok(UserVariableItem::MaxLength(max_length))
        }
        0x52 => Ok(UserVariableItem::ImplementationClassUid(trimmed_text(
            &cursor.into_inner(),
        ))),
        0x53 => {
            let invoked = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-invoked",
            })?;
            let performed = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-performed",
            })?;
            Ok(UserVariableItem::AsyncOperationsWindow(invoked, performed))
        }
        0x54 => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let uid = read_n(&mut cursor, u32::from(uid_length), "SOP-class-uid")?;
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            Ok(UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: trimmed_text(&uid),
                scu_role: scu_role != 0,
                scp_role: scp_role != 0,
            }))
        }
        0x55 => Ok(UserVariableItem::ImplementationVersionName(trimmed_text(
            &cursor.into_inner(),
        ))),
        0x56 => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let uid = read_n(&mut cursor, u32::from(uid_length), "SOP-class-uid")?;
            let info_length = remaining(&cursor) as u32;
            let application_information = read_n(
                &mut cursor,
                info_length,
                "Service-class-application-information",
            )?;
            Ok(UserVariableItem::SopClassExtendedNegotiation(
                SopClassExtendedNegotiation {
                    sop_class_uid: trimmed_text(&uid),
                    application_information,
                },
            ))
        }
        0x57 => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let sop_class_uid = read_n(&mut cursor, u32::from(uid_length), "SOP-class-uid")?;
            let service_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Service-class-uid-length",
            })?;
            let service_class_uid =
                read_n(&mut cursor, u32::from(service_length), "Service-class-uid")?;
            let related_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Related-general-sop-class-identification-length",
            })?;
            let related = read_n(
                &mut cursor,
                u32::from(related_length),
                "Related-general-sop-class-identification",
            )?;

            let mut related_general_sop_classes = Vec::new();
            let mut related = Cursor::new(related);
            while remaining(&related) > 0 {
                let uid_length = related.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Related-general-sop-class-uid-length",
                })?;
                let uid = read_n(
                    &mut related,
                    u32::from(uid_length),
                    "Related-general-sop-class-uid",
                )?;
                related_general_sop_classes.push(trimmed_text(&uid));
            }

            Ok(UserVariableItem::SopClassCommonExtendedNegotiation(
                SopClassCommonExtendedNegotiation {
                    sop_class_uid: trimmed_text(&sop_class_uid),
                    service_class_uid: trimmed_text(&service_class_uid),
                    related_general_sop_classes,
                },
            ))
        }
        0x58 => {
            let identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-identity-type",
            })?;
            let identity_type = UserIdentityType::from(identity_type)
                .context(InvalidUserIdentityTypeSnafu {
                    value: identity_type,
                })?;
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Positive-response-requested",
            })? != 0;
            let primary_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Primary-field-length",
            })?;
            let primary_field = read_n(&mut cursor, u32::from(primary_length), "Primary-field")?;
            let secondary_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Secondary-field-length",
            })?;
            let secondary_field =
                read_n(&mut cursor, u32::from(secondary_length), "Secondary-field")?;
            Ok(UserVariableItem::UserIdentity(UserIdentity::new(
                positive_response_requested,
                identity_type,
                primary_field,
                secondary_field,
            )))
        }
        0x59 => {
            let response_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Server-response-length",
            })?;
            let server_response =
                read_n(&mut cursor, u32::from(response_length), "Server-response")?;
            Ok(UserVariableItem::UserIdentityResponse(server_response))
        }
        _ => Ok(UserVariableItem::Unknown(item_type, cursor.into_inner())),
    }
}

/// Read one sub-item header and body from within a variable item.
fn read_sub_item(cursor: &mut Cursor<Vec<u8>>) -> Result<(u8, Vec<u8>)> {
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "reserved" })?;
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    let body = read_n(cursor, u32::from(item_length), "sub-item")?;
    Ok((item_type, body))
}

fn read_ae_title(cursor: &mut Cursor<Vec<u8>>, field: &'static str) -> Result<String> {
    let mut bytes = [0u8; 16];
    cursor
        .read_exact(&mut bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(trimmed_text(&bytes))
}

/// Read exactly `length` bytes, failing with a length mismatch
/// if the cursor does not hold that many.
fn read_n(cursor: &mut Cursor<Vec<u8>>, length: u32, field: &'static str) -> Result<Vec<u8>> {
    ensure!(
        u64::from(length) <= remaining(cursor),
        LengthMismatchSnafu { field, length }
    );
    let mut out = vec![0; length as usize];
    cursor
        .read_exact(&mut out)
        .context(ReadPduFieldSnafu { field })?;
    Ok(out)
}

fn remaining(cursor: &Cursor<Vec<u8>>) -> u64 {
    cursor.get_ref().len() as u64 - cursor.position()
}

/// Decode an ISO 646 text field,
/// discarding the padding admitted in AE titles and UIDs.
fn trimmed_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}
