//! In-process association tests over real TCP sockets.
use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use crate::association::{
    client::ClientAssociationOptions, server::ServerAssociationOptions, Association, Error,
};
use crate::pdu::{PDataValue, PDataValueType, Pdu};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn command_packet(presentation_context_id: u8, len: usize) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0x55; len],
        }],
    }
}

/// An SCP which accepts the verification SOP class,
/// echoes one P-Data PDU back, and answers the release request.
fn spawn_echo_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.client_ae_title(), SCU_AE_TITLE);
        let accepted: Vec<_> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.is_accepted())
            .collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].abstract_syntax, VERIFICATION_SOP_CLASS);

        let pdu = association.receive()?;
        match pdu {
            Pdu::PData { data } => {
                association
                    .send(&Pdu::PData { data })
                    .expect("echo back failed");
            }
            other => panic!("expected P-DATA, got {}", other.short_description()),
        }

        match association.receive()? {
            Pdu::ReleaseRQ => association.respond_release()?,
            other => panic!("expected release, got {}", other.short_description()),
        }
        Ok(())
    });
    Ok((handle, addr))
}

#[test]
fn establish_data_exchange_and_release() {
    let (scp, addr) = spawn_echo_scp().unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(
            VERIFICATION_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        )
        .establish(addr)
        .unwrap();

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.is_accepted())
        .expect("one accepted context")
        .clone();
    // default roles: we are the SCU
    assert!(pc.scu_role);
    assert!(!pc.scp_role);

    association.send(&command_packet(pc.id, 128)).unwrap();
    match association.receive().unwrap() {
        Pdu::PData { data } => {
            assert_eq!(data.len(), 1);
            assert_eq!(data[0].data.len(), 128);
            assert_eq!(data[0].presentation_context_id, pc.id);
        }
        other => panic!("expected P-DATA, got {}", other.short_description()),
    }

    association.release().unwrap();
    scp.join().unwrap().unwrap();
}

#[test]
fn proposed_context_not_supported_is_refused() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let handle = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        // the association fails on the requestor's side;
        // the acceptor still answers with a full AC
        let association = scp.establish(stream).unwrap();
        let refused: Vec<_> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| !pc.is_accepted())
            .collect();
        assert_eq!(refused.len(), 1);
    });

    // propose only a context the SCP does not support
    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .expect_err("association should not complete");
    assert!(matches!(err, Error::NoAcceptedPresentationContexts { .. }));

    handle.join().unwrap();
}

#[test]
fn called_ae_title_mismatch_is_rejected() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let handle = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let err = scp.establish(stream).expect_err("should reject");
        assert!(matches!(err, Error::Rejected { .. }));
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NOT-THIS-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .expect_err("association should be rejected");
    match err {
        Error::Rejected { association_rj, .. } => {
            assert_eq!(
                association_rj.result,
                crate::pdu::AssociationRJResult::Permanent
            );
        }
        err => panic!("expected rejection, got {:?}", err),
    }

    handle.join().unwrap();
}

/// Both peers release at the same time;
/// both must see a clean release, not an abort.
#[test]
fn simultaneous_release_converges() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let association = scp.establish(stream)?;
        // release from the acceptor side immediately
        association.release()?;
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    association.release().unwrap();

    handle.join().unwrap().unwrap();
}

#[test]
fn abort_reaches_the_peer() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        match association.receive() {
            Ok(Pdu::AbortRQ { .. }) => {}
            Ok(other) => panic!("expected abort, got {}", other.short_description()),
            // the peer may have slammed the connection shut already
            Err(Error::Transport { .. }) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    association.abort().unwrap();

    handle.join().unwrap().unwrap();
}

#[test]
fn user_identity_is_negotiated() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .user_identity_response(b"ticket-ok".to_vec());

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        let identity = association.user_identity().expect("identity expected");
        assert_eq!(identity.primary_field(), b"modality");
        assert_eq!(identity.secondary_field(), b"secret");
        match association.receive()? {
            Pdu::ReleaseRQ => association.respond_release()?,
            other => panic!("expected release, got {}", other.short_description()),
        }
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .username_password("modality", "secret")
        .positive_response_requested(true)
        .establish(addr)
        .unwrap();
    assert_eq!(association.user_identity_response(), Some(&b"ticket-ok"[..]));

    association.release().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn role_selection_is_negotiated() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .with_role_selection(CT_IMAGE_STORAGE, true, true);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        let pc = association.presentation_contexts()[0].clone();
        // the requestor wants to act as the storage SCP,
        // so on this side the roles flip
        assert!(pc.scu_role);
        assert!(!pc.scp_role);
        match association.receive()? {
            Pdu::ReleaseRQ => association.respond_release()?,
            other => panic!("expected release, got {}", other.short_description()),
        }
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .with_role_selection(CT_IMAGE_STORAGE, false, true)
        .establish(addr)
        .unwrap();

    let pc = association.presentation_contexts()[0].clone();
    assert!(!pc.scu_role);
    assert!(pc.scp_role);

    association.release().unwrap();
    handle.join().unwrap().unwrap();
}
