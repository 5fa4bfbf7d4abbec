//! End-to-end DIMSE exchanges between two application entities
//! over real TCP sockets.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use netdicom_dimse::events::QueryRequest;
use netdicom_dimse::{ApplicationEntity, Disposition, ServiceHandlers, Status};

static VERIFICATION: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static PRINTER_SOP_CLASS: &str = "1.2.840.10008.5.1.1.16";

fn scu_ae(title: &str) -> ApplicationEntity {
    ApplicationEntity::new(title)
        .acse_timeout(Some(Duration::from_secs(5)))
        .dimse_timeout(Some(Duration::from_secs(5)))
        .network_timeout(Some(Duration::from_secs(5)))
}

fn scp_ae(title: &str) -> ApplicationEntity {
    ApplicationEntity::new(title)
        .acse_timeout(Some(Duration::from_secs(5)))
        .dimse_timeout(Some(Duration::from_secs(5)))
        .network_timeout(Some(Duration::from_secs(5)))
}

fn ct_dataset(sop_instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance_uid),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "DOE^JOHN"),
    ));
    obj.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        dicom_value!(Str, "CT"),
    ));
    obj
}

/// Scenario: verification. The SCU sends a C-ECHO
/// and receives a success status correlating to its message.
#[test]
fn c_echo_roundtrip() {
    let server = scp_ae("ECHOSCP")
        .with_supported_context(VERIFICATION)
        .start_server("localhost:0", ServiceHandlers::new)
        .unwrap();

    let mut scu = scu_ae("ECHOSCU")
        .with_requested_abstract_syntax(VERIFICATION)
        .associate(server.local_addr())
        .unwrap();

    let status = scu.c_echo().unwrap();
    assert_eq!(status, Status::SUCCESS);

    scu.release().unwrap();
    server.shutdown();
}

/// Scenario: storage. The SCU stores a CT data set
/// fragmented across PDUs; the SCP reads back
/// the same SOP instance UID.
#[test]
fn c_store_delivers_the_dataset() {
    let stored: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let stored_in_handler = Arc::clone(&stored);

    let server = scp_ae("STORESCP")
        .with_supported_context(CT_IMAGE_STORAGE)
        .start_server("localhost:0", move || {
            let stored = Arc::clone(&stored_in_handler);
            ServiceHandlers::new().on_c_store(move |request| {
                let dataset = request.dataset().expect("data set should decode");
                let uid = dataset
                    .element(tags::SOP_INSTANCE_UID)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_string();
                assert_eq!(request.sop_class_uid, CT_IMAGE_STORAGE);
                stored.lock().unwrap().push(uid);
                Disposition::Respond(Status::SUCCESS)
            })
        })
        .unwrap();

    let mut scu = scu_ae("STORESCU")
        .with_requested_context(
            CT_IMAGE_STORAGE,
            vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
        )
        .associate(server.local_addr())
        .unwrap();

    let status = scu.c_store(&ct_dataset("1.2.3.4.5")).unwrap();
    assert_eq!(status, Status::SUCCESS);

    scu.release().unwrap();
    server.shutdown();

    assert_eq!(stored.lock().unwrap().as_slice(), ["1.2.3.4.5"]);
}

/// Scenario: rejection. Proposing only an abstract syntax
/// the SCP does not support surfaces a negotiation failure
/// with zero accepted contexts.
#[test]
fn unsupported_context_surfaces_negotiation_failure() {
    let server = scp_ae("ECHOSCP")
        .with_supported_context(VERIFICATION)
        .start_server("localhost:0", ServiceHandlers::new)
        .unwrap();

    let err = scu_ae("STORESCU")
        .with_requested_abstract_syntax(CT_IMAGE_STORAGE)
        .associate(server.local_addr())
        .expect_err("association should not be usable");
    assert!(matches!(
        err,
        netdicom_dimse::Error::Association {
            source: netdicom_ul::association::Error::NoAcceptedPresentationContexts { .. },
            ..
        }
    ));

    server.shutdown();
}

/// Scenario: query stream. The SCP yields three pending responses
/// with identifiers and then success;
/// the SCU iterator produces exactly those four items in order.
#[test]
fn c_find_streams_pending_responses() {
    let server = scp_ae("QUERYSCP")
        .with_supported_context(STUDY_ROOT_QR_FIND)
        .start_server("localhost:0", || {
            ServiceHandlers::new().on_c_find(|request: QueryRequest| {
                let identifier = request.identifier.expect("query identifier expected");
                assert!(identifier.element(tags::PATIENT_NAME).is_ok());
                let matches: Vec<_> = (1..=3)
                    .map(|i| {
                        let mut item = InMemDicomObject::new_empty();
                        item.put(DataElement::new(
                            tags::PATIENT_NAME,
                            VR::PN,
                            dicom_value!(Str, format!("PATIENT^{}", i)),
                        ));
                        (Status::PENDING, Some(item))
                    })
                    .chain(std::iter::once((Status::SUCCESS, None)))
                    .collect();
                Box::new(matches.into_iter())
            })
        })
        .unwrap();

    let mut scu = scu_ae("QUERYSCU")
        .with_requested_abstract_syntax(STUDY_ROOT_QR_FIND)
        .associate(server.local_addr())
        .unwrap();

    let mut identifier = InMemDicomObject::new_empty();
    identifier.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "*"),
    ));

    let responses: Vec<_> = scu
        .c_find(STUDY_ROOT_QR_FIND, &identifier)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(responses.len(), 4);
    for (i, (status, identifier)) in responses[..3].iter().enumerate() {
        assert!(status.is_pending());
        let name = identifier
            .as_ref()
            .expect("pending responses carry identifiers")
            .element(tags::PATIENT_NAME)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(name, format!("PATIENT^{}", i + 1));
    }
    let (final_status, final_identifier) = &responses[3];
    assert_eq!(*final_status, Status::SUCCESS);
    assert!(final_identifier.is_none());

    scu.release().unwrap();
    server.shutdown();
}

/// Scenario: abort from a handler. The store handler
/// asks for an abort instead of responding;
/// the SCU's pending store resolves with an abort error
/// and nothing deadlocks.
#[test]
fn abort_from_store_handler_resolves_the_request() {
    let server = scp_ae("STORESCP")
        .with_supported_context(CT_IMAGE_STORAGE)
        .start_server("localhost:0", || {
            ServiceHandlers::new().on_c_store(|_request| Disposition::Abort)
        })
        .unwrap();

    let mut scu = scu_ae("STORESCU")
        .with_requested_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE.to_string()])
        .associate(server.local_addr())
        .unwrap();

    let err = scu
        .c_store(&ct_dataset("1.2.3.4.5"))
        .expect_err("the store must not complete");
    assert!(matches!(
        err,
        netdicom_dimse::Error::AssociationAborted { .. }
            | netdicom_dimse::Error::Association { .. }
    ));

    server.shutdown();
}

/// N-GET: the SCP hands back an attribute list
/// which the SCU receives decoded.
#[test]
fn n_get_returns_attributes() {
    let server = scp_ae("PRINTSCP")
        .with_supported_context(PRINTER_SOP_CLASS)
        .start_server("localhost:0", || {
            ServiceHandlers::new().on_n_get(|command, _dataset| {
                assert_eq!(
                    command.requested_sop_instance_uid().as_deref(),
                    Some("1.2.840.10008.5.1.1.17")
                );
                let mut attrs = InMemDicomObject::new_empty();
                attrs.put(DataElement::new(
                    tags::PRINTER_STATUS,
                    VR::CS,
                    dicom_value!(Str, "NORMAL"),
                ));
                (Status::SUCCESS, Some(attrs))
            })
        })
        .unwrap();

    let mut scu = scu_ae("PRINTSCU")
        .with_requested_abstract_syntax(PRINTER_SOP_CLASS)
        .associate(server.local_addr())
        .unwrap();

    let (status, attrs) = scu
        .n_get(
            PRINTER_SOP_CLASS,
            "1.2.840.10008.5.1.1.17",
            vec![tags::PRINTER_STATUS],
        )
        .unwrap();
    assert_eq!(status, Status::SUCCESS);
    let attrs = attrs.expect("attribute list expected");
    assert_eq!(
        attrs
            .element(tags::PRINTER_STATUS)
            .unwrap()
            .to_str()
            .unwrap(),
        "NORMAL"
    );

    scu.release().unwrap();
    server.shutdown();
}

/// Peer-screening: an SCU with a calling AE title
/// outside the allow-list is rejected.
#[test]
fn calling_ae_title_allow_list_rejects_strangers() {
    let server = scp_ae("GATED-SCP")
        .with_supported_context(VERIFICATION)
        .require_calling_ae_title("TRUSTED-SCU")
        .start_server("localhost:0", ServiceHandlers::new)
        .unwrap();

    // the trusted title goes through
    let scu = scu_ae("TRUSTED-SCU")
        .with_requested_abstract_syntax(VERIFICATION)
        .associate(server.local_addr())
        .unwrap();
    scu.release().unwrap();

    // anyone else is turned away
    let err = scu_ae("STRANGER")
        .with_requested_abstract_syntax(VERIFICATION)
        .associate(server.local_addr())
        .expect_err("the stranger should be rejected");
    assert!(matches!(
        err,
        netdicom_dimse::Error::Association {
            source: netdicom_ul::association::Error::Rejected { .. },
            ..
        }
    ));

    server.shutdown();
}
