//! PDU writer module
use std::io::Write;

use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::pdu::*;

/// An error which may occur when writing a PDU to a data sink.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("Could not write PDU field `{}`: {}", field, source))]
    WritePduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = WriteError> = std::result::Result<T, E>;

fn write_chunk_u32<F>(writer: &mut dyn Write, field: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    func(&mut data)?;
    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WritePduFieldSnafu { field })?;
    writer
        .write_all(&data)
        .context(WritePduFieldSnafu { field })?;
    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, field: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    func(&mut data)?;
    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WritePduFieldSnafu { field })?;
    writer
        .write_all(&data)
        .context(WritePduFieldSnafu { field })?;
    Ok(())
}

/// A UID field: ISO 646 bytes, padded with a trailing null byte
/// to an even length.
fn uid_bytes(uid: &str) -> Vec<u8> {
    let mut bytes = uid.as_bytes().to_vec();
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    bytes
}

/// An AE title field: 16 ISO 646 bytes, space padded.
fn ae_title_bytes(ae_title: &str) -> Vec<u8> {
    let mut bytes = ae_title.as_bytes().to_vec();
    bytes.resize(16, b' ');
    bytes
}

/// Write a full PDU to the given data sink.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // PDU-type 01H + reserved
            writer
                .write_all(&[0x01, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "A-ASSOCIATE-RQ", |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WritePduFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0)
                    .context(WritePduFieldSnafu { field: "reserved" })?;
                writer
                    .write_all(&ae_title_bytes(called_ae_title))
                    .context(WritePduFieldSnafu {
                        field: "Called-AE-title",
                    })?;
                writer
                    .write_all(&ae_title_bytes(calling_ae_title))
                    .context(WritePduFieldSnafu {
                        field: "Calling-AE-title",
                    })?;
                writer
                    .write_all(&[0u8; 32])
                    .context(WritePduFieldSnafu { field: "reserved" })?;

                write_application_context(writer, application_context_name)?;
                for pc in presentation_contexts {
                    write_presentation_context_proposed(writer, pc)?;
                }
                write_user_variables(writer, user_variables)?;
                Ok(())
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // PDU-type 02H + reserved
            writer
                .write_all(&[0x02, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "A-ASSOCIATE-AC", |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WritePduFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0)
                    .context(WritePduFieldSnafu { field: "reserved" })?;
                // AE title fields mirrored from the request,
                // reserved on reception
                writer
                    .write_all(&ae_title_bytes(called_ae_title))
                    .context(WritePduFieldSnafu {
                        field: "Called-AE-title",
                    })?;
                writer
                    .write_all(&ae_title_bytes(calling_ae_title))
                    .context(WritePduFieldSnafu {
                        field: "Calling-AE-title",
                    })?;
                writer
                    .write_all(&[0u8; 32])
                    .context(WritePduFieldSnafu { field: "reserved" })?;

                write_application_context(writer, application_context_name)?;
                for pc in presentation_contexts {
                    write_presentation_context_result(writer, pc)?;
                }
                write_user_variables(writer, user_variables)?;
                Ok(())
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            writer
                .write_all(&[0x03, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "A-ASSOCIATE-RJ", |writer| {
                let (source_code, reason_code) = reject_codes(source);
                writer
                    .write_all(&[0x00, *result as u8, source_code, reason_code])
                    .context(WritePduFieldSnafu {
                        field: "Result/Source/Reason",
                    })?;
                Ok(())
            })
        }
        Pdu::PData { data } => {
            writer
                .write_all(&[0x04, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "P-DATA-TF", |writer| {
                for pdv in data {
                    write_chunk_u32(writer, "Presentation-data-value", |writer| {
                        writer
                            .write_u8(pdv.presentation_context_id)
                            .context(WritePduFieldSnafu {
                                field: "Presentation-context-ID",
                            })?;
                        let mut header = 0x00;
                        if pdv.value_type == PDataValueType::Command {
                            header |= 0x01;
                        }
                        if pdv.is_last {
                            header |= 0x02;
                        }
                        writer.write_u8(header).context(WritePduFieldSnafu {
                            field: "Message Control Header",
                        })?;
                        writer.write_all(&pdv.data).context(WritePduFieldSnafu {
                            field: "Presentation-data-value",
                        })?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => {
            writer
                .write_all(&[0x05, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "A-RELEASE-RQ", |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WritePduFieldSnafu { field: "reserved" })?;
                Ok(())
            })
        }
        Pdu::ReleaseRP => {
            writer
                .write_all(&[0x06, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "A-RELEASE-RP", |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WritePduFieldSnafu { field: "reserved" })?;
                Ok(())
            })
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_all(&[0x07, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "A-ABORT", |writer| {
                let (source_code, reason_code) = abort_codes(source);
                writer
                    .write_all(&[0x00, 0x00, source_code, reason_code])
                    .context(WritePduFieldSnafu {
                        field: "Source/Reason",
                    })?;
                Ok(())
            })
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_all(&[*pdu_type, 0x00])
                .context(WritePduFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, "Unknown", |writer| {
                writer
                    .write_all(data)
                    .context(WritePduFieldSnafu { field: "Unknown" })?;
                Ok(())
            })
        }
    }
}

fn reject_codes(source: &AssociationRJSource) -> (u8, u8) {
    match source {
        AssociationRJSource::ServiceUser(reason) => {
            let reason = match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 1,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized => 3,
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized => 7,
                AssociationRJServiceUserReason::Reserved(code) => *code,
            };
            (1, reason)
        }
        AssociationRJSource::ServiceProviderAsce(reason) => {
            let reason = match reason {
                AssociationRJServiceProviderAsceReason::NoReasonGiven => 1,
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 2,
            };
            (2, reason)
        }
        AssociationRJSource::ServiceProviderPresentation(reason) => {
            let reason = match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
            };
            (3, reason)
        }
    }
}

fn abort_codes(source: &AbortRQSource) -> (u8, u8) {
    match source {
        AbortRQSource::ServiceUser => (0, 0),
        AbortRQSource::Reserved => (1, 0),
        AbortRQSource::ServiceProvider(reason) => {
            let reason = match reason {
                AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                AbortRQServiceProviderReason::UnexpectedPdu => 2,
                AbortRQServiceProviderReason::Reserved => 3,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                AbortRQServiceProviderReason::InvalidPduParameter => 6,
            };
            (2, reason)
        }
    }
}

fn write_application_context(writer: &mut dyn Write, name: &str) -> Result<()> {
    // Item-type 10H + reserved
    writer
        .write_all(&[0x10, 0x00])
        .context(WritePduFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, "Application-context-name", |writer| {
        writer
            .write_all(&uid_bytes(name))
            .context(WritePduFieldSnafu {
                field: "Application-context-name",
            })?;
        Ok(())
    })
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    pc: &PresentationContextProposed,
) -> Result<()> {
    // Item-type 20H + reserved
    writer
        .write_all(&[0x20, 0x00])
        .context(WritePduFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, "Presentation context", |writer| {
        writer
            .write_all(&[pc.id, 0x00, 0x00, 0x00])
            .context(WritePduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // Abstract syntax sub-item 30H
        writer
            .write_all(&[0x30, 0x00])
            .context(WritePduFieldSnafu { field: "Item-type" })?;
        write_chunk_u16(writer, "Abstract-syntax-name", |writer| {
            writer
                .write_all(&uid_bytes(&pc.abstract_syntax))
                .context(WritePduFieldSnafu {
                    field: "Abstract-syntax-name",
                })?;
            Ok(())
        })?;

        // one transfer syntax sub-item 40H per candidate
        for ts in &pc.transfer_syntaxes {
            writer
                .write_all(&[0x40, 0x00])
                .context(WritePduFieldSnafu { field: "Item-type" })?;
            write_chunk_u16(writer, "Transfer-syntax-name", |writer| {
                writer
                    .write_all(&uid_bytes(ts))
                    .context(WritePduFieldSnafu {
                        field: "Transfer-syntax-name",
                    })?;
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    pc: &PresentationContextResult,
) -> Result<()> {
    // Item-type 21H + reserved
    writer
        .write_all(&[0x21, 0x00])
        .context(WritePduFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, "Presentation context result", |writer| {
        writer
            .write_all(&[pc.id, 0x00, pc.reason as u8, 0x00])
            .context(WritePduFieldSnafu {
                field: "Result/Reason",
            })?;

        writer
            .write_all(&[0x40, 0x00])
            .context(WritePduFieldSnafu { field: "Item-type" })?;
        write_chunk_u16(writer, "Transfer-syntax-name", |writer| {
            writer
                .write_all(&uid_bytes(&pc.transfer_syntax))
                .context(WritePduFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
            Ok(())
        })?;
        Ok(())
    })
}

fn write_user_variables(writer: &mut dyn Write, user_variables: &[UserVariableItem]) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // Item-type 50H + reserved
    writer
        .write_all(&[0x50, 0x00])
        .context(WritePduFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, "User information", |writer| {
        for item in user_variables {
            match item {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_all(&[0x51, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "Maximum-length-received", |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WritePduFieldSnafu {
                                field: "Maximum-length-received",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationClassUid(uid) => {
                    writer
                        .write_all(&[0x52, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "Implementation-class-uid", |writer| {
                        writer
                            .write_all(&uid_bytes(uid))
                            .context(WritePduFieldSnafu {
                                field: "Implementation-class-uid",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    writer
                        .write_all(&[0x53, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "Asynchronous-operations-window", |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WritePduFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WritePduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::RoleSelection(role) => {
                    writer
                        .write_all(&[0x54, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "SCP/SCU role selection", |writer| {
                        write_chunk_u16(writer, "SOP-class-uid", |writer| {
                            writer
                                .write_all(&uid_bytes(&role.sop_class_uid))
                                .context(WritePduFieldSnafu {
                                    field: "SOP-class-uid",
                                })?;
                            Ok(())
                        })?;
                        writer
                            .write_all(&[role.scu_role as u8, role.scp_role as u8])
                            .context(WritePduFieldSnafu {
                                field: "SCU-role/SCP-role",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    writer
                        .write_all(&[0x55, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "Implementation-version-name", |writer| {
                        writer
                            .write_all(name.as_bytes())
                            .context(WritePduFieldSnafu {
                                field: "Implementation-version-name",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiation(neg) => {
                    writer
                        .write_all(&[0x56, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "SOP class extended negotiation", |writer| {
                        write_chunk_u16(writer, "SOP-class-uid", |writer| {
                            writer
                                .write_all(&uid_bytes(&neg.sop_class_uid))
                                .context(WritePduFieldSnafu {
                                    field: "SOP-class-uid",
                                })?;
                            Ok(())
                        })?;
                        writer
                            .write_all(&neg.application_information)
                            .context(WritePduFieldSnafu {
                                field: "Service-class-application-information",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiation(neg) => {
                    writer
                        .write_all(&[0x57, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "SOP class common extended negotiation", |writer| {
                        write_chunk_u16(writer, "SOP-class-uid", |writer| {
                            writer
                                .write_all(&uid_bytes(&neg.sop_class_uid))
                                .context(WritePduFieldSnafu {
                                    field: "SOP-class-uid",
                                })?;
                            Ok(())
                        })?;
                        write_chunk_u16(writer, "Service-class-uid", |writer| {
                            writer
                                .write_all(&uid_bytes(&neg.service_class_uid))
                                .context(WritePduFieldSnafu {
                                    field: "Service-class-uid",
                                })?;
                            Ok(())
                        })?;
                        write_chunk_u16(
                            writer,
                            "Related-general-sop-class-identification",
                            |writer| {
                                for uid in &neg.related_general_sop_classes {
                                    write_chunk_u16(writer, "Related-general-sop-class-uid", |writer| {
                                        writer.write_all(&uid_bytes(uid)).context(
                                            WritePduFieldSnafu {
                                                field: "Related-general-sop-class-uid",
                                            },
                                        )?;
                                        Ok(())
                                    })?;
                                }
                                Ok(())
                            },
                        )?;
                        Ok(())
                    })?;
                }
                UserVariableItem::UserIdentity(identity) => {
                    writer
                        .write_all(&[0x58, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "User identity", |writer| {
                        writer
                            .write_all(&[
                                identity.identity_type() as u8,
                                identity.positive_response_requested() as u8,
                            ])
                            .context(WritePduFieldSnafu {
                                field: "User-identity-type",
                            })?;
                        write_chunk_u16(writer, "Primary-field", |writer| {
                            writer
                                .write_all(identity.primary_field())
                                .context(WritePduFieldSnafu {
                                    field: "Primary-field",
                                })?;
                            Ok(())
                        })?;
                        write_chunk_u16(writer, "Secondary-field", |writer| {
                            writer
                                .write_all(identity.secondary_field())
                                .context(WritePduFieldSnafu {
                                    field: "Secondary-field",
                                })?;
                            Ok(())
                        })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::UserIdentityResponse(response) => {
                    writer
                        .write_all(&[0x59, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "User identity response", |writer| {
                        write_chunk_u16(writer, "Server-response", |writer| {
                            writer
                                .write_all(response)
                                .context(WritePduFieldSnafu {
                                    field: "Server-response",
                                })?;
                            Ok(())
                        })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_all(&[*item_type, 0x00])
                        .context(WritePduFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, "Unknown", |writer| {
                        writer
                            .write_all(data)
                            .context(WritePduFieldSnafu { field: "Unknown" })?;
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    })
}
