use std::io::Cursor;

use crate::pdu::reader::read_pdu;
use crate::pdu::writer::write_pdu;
use crate::pdu::*;

fn roundtrip(pdu: Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    // full encoded length must match the declared PDU length
    let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(bytes.len() as u32, PDU_HEADER_SIZE + declared);

    let result = read_pdu(&mut Cursor::new(&bytes), MAXIMUM_PDU_SIZE, true)
        .unwrap()
        .expect("PDU should be complete");
    assert_eq!(result, pdu);

    // and writing the decoded value again must reproduce the same bytes
    let mut bytes2 = Vec::new();
    write_pdu(&mut bytes2, &result).unwrap();
    assert_eq!(bytes2, bytes);
}

#[test]
fn roundtrip_association_rq() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_382),
            UserVariableItem::ImplementationClassUid("1.2.345.6.7890.1.234".to_string()),
            UserVariableItem::ImplementationVersionName("NETDICOM01".to_string()),
        ],
    }));
}

#[test]
fn roundtrip_association_rq_with_full_user_information() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "GET-SCU".to_string(),
        called_ae_title: "ARCHIVE".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(0),
            UserVariableItem::AsyncOperationsWindow(3, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: false,
                scp_role: true,
            }),
            UserVariableItem::SopClassExtendedNegotiation(SopClassExtendedNegotiation {
                sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
                application_information: vec![0x01, 0x00],
            }),
            UserVariableItem::SopClassCommonExtendedNegotiation(
                SopClassCommonExtendedNegotiation {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
                    service_class_uid: "1.2.840.10008.4.2".to_string(),
                    related_general_sop_classes: vec![
                        "1.2.840.10008.5.1.4.1.1.88.11".to_string()
                    ],
                },
            ),
            UserVariableItem::UserIdentity(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"modality".to_vec(),
                b"secret".to_vec(),
            )),
            // an unrecognized sub-item must round-trip unchanged
            UserVariableItem::Unknown(0x77, vec![1, 2, 3, 4]),
        ],
    }));
}

#[test]
fn roundtrip_association_ac() {
    roundtrip(Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::UserIdentityResponse(b"granted!".to_vec()),
        ],
    }));
}

#[test]
fn roundtrip_association_rj() {
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
        ),
    }));
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    }));
}

#[test]
fn roundtrip_pdata() {
    roundtrip(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![8; 20],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![55; 256],
            },
        ],
    });
}

#[test]
fn roundtrip_release_and_abort() {
    roundtrip(Pdu::ReleaseRQ);
    roundtrip(Pdu::ReleaseRP);
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    });
}

#[test]
fn roundtrip_unknown_pdu_type() {
    roundtrip(Pdu::Unknown {
        pdu_type: 0xAA,
        data: vec![1, 2, 3, 4, 5],
    });
}

#[test]
fn read_incomplete_pdu_yields_none() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 64],
            }],
        },
    )
    .unwrap();

    // any strict prefix is not enough to decode
    for cut in [0, 3, 6, bytes.len() - 1] {
        let out = read_pdu(&mut Cursor::new(&bytes[..cut]), DEFAULT_MAX_PDU, true).unwrap();
        assert!(out.is_none(), "prefix of {} bytes should be incomplete", cut);
    }
}

#[test]
fn refuse_pdu_over_maximum_length() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 8192],
            }],
        },
    )
    .unwrap();

    let err = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, true);
    assert!(matches!(
        err,
        Err(reader::ReadError::PduTooLarge { .. })
    ));

    // non-strict mode admits it with a warning
    let out = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, false).unwrap();
    assert!(out.is_some());
}

#[test]
fn malformed_sub_item_is_an_error_not_a_panic() {
    // A-ASSOCIATE-RQ with a presentation context item
    // whose declared length overruns the PDU body
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "A".to_string(),
            called_ae_title: "B".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![],
        }),
    )
    .unwrap();

    // the variable items start at offset 74;
    // the presentation context item follows the application context item
    let app_context_len = u16::from_be_bytes([bytes[76], bytes[77]]) as usize;
    let pc_pos = 78 + app_context_len;
    assert_eq!(bytes[pc_pos], 0x20);
    bytes[pc_pos + 2] = 0xFF;
    bytes[pc_pos + 3] = 0xFF;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert!(result.is_err());
}

#[test]
fn reserved_bytes_are_not_tested_on_read() {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &Pdu::ReleaseRQ).unwrap();
    // second byte of the header is reserved
    bytes[1] = 0xCC;
    let out = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();
    assert_eq!(out, Pdu::ReleaseRQ);
}
