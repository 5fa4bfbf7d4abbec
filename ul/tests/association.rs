use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use netdicom_ul::association::{Association, ClientAssociationOptions, ServerAssociationOptions};
use netdicom_ul::pdu::{PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

// different maximum PDU lengths on each side,
// so that fragmentation is exercised in both directions
const SCU_PDU_LEN: u32 = 5678;
const SCP_PDU_LEN: u32 = 7890;

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn spawn_scp(payload_len: usize) -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .max_pdu_length(SCP_PDU_LEN)
        .with_abstract_syntax(CT_IMAGE_STORAGE);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.peer_max_pdu_length(), SCU_PDU_LEN);
        assert_eq!(association.local_max_pdu_length(), SCP_PDU_LEN);

        // a command fragment comes first, in one PDV
        let pdu = association.receive()?;
        match pdu {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].value_type, PDataValueType::Command);
                assert!(data[0].is_last);
            }
            other => panic!("expected P-DATA, got {}", other.short_description()),
        }

        // then the data set, split across PDUs sized to our limit
        let mut dataset = Vec::new();
        {
            let mut reader = association.receive_pdata();
            reader.read_to_end(&mut dataset)?;
        }
        assert_eq!(dataset.len(), payload_len);
        assert!(dataset.iter().enumerate().all(|(i, b)| *b == i as u8));

        // reply with a single command PDV
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0u8; 16],
            }],
        })?;

        match association.receive()? {
            Pdu::ReleaseRQ => association.respond_release()?,
            other => panic!("expected release, got {}", other.short_description()),
        }
        Ok(())
    });
    Ok((handle, addr))
}

#[test]
fn store_like_exchange_with_fragmentation() {
    // more payload than fits in a single PDU towards the SCP
    let payload_len = (SCP_PDU_LEN - PDU_HEADER_SIZE) as usize * 2 + 2;
    let (scp, addr) = spawn_scp(payload_len).unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .max_pdu_length(SCU_PDU_LEN)
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    assert_eq!(association.peer_max_pdu_length(), SCP_PDU_LEN);

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.is_accepted())
        .expect("accepted presentation context")
        .clone();

    // command set first
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0u8; 64],
            }],
        })
        .unwrap();

    // then stream the data set through the fragmenting writer
    let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
    {
        let mut writer = association.send_pdata(pc.id);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();
    }

    // the response command
    match association.receive().unwrap() {
        Pdu::PData { data } => {
            assert_eq!(data.len(), 1);
            assert_eq!(data[0].value_type, PDataValueType::Command);
        }
        other => panic!("expected P-DATA, got {}", other.short_description()),
    }

    association.release().unwrap();
    scp.join().unwrap().unwrap();
}

#[test]
fn oversized_pdu_is_refused_locally() {
    let (scp, addr) = spawn_scp(1).unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .max_pdu_length(SCU_PDU_LEN)
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    // a P-DATA over the acceptor's maximum length must not leave this node
    let err = association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0u8; SCP_PDU_LEN as usize + 1],
            }],
        })
        .expect_err("oversized PDU should be refused");
    assert!(matches!(
        err,
        netdicom_ul::association::Error::Transport {
            source: netdicom_ul::transport::Error::SendTooLongPdu { .. },
            ..
        }
    ));

    // the association is still usable: complete the exchange
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0u8; 16],
            }],
        })
        .unwrap();
    {
        let mut writer = association.send_pdata(1);
        writer.write_all(&[0u8]).unwrap();
        writer.finish().unwrap();
    }
    match association.receive().unwrap() {
        Pdu::PData { .. } => {}
        other => panic!("expected P-DATA, got {}", other.short_description()),
    }
    association.release().unwrap();
    scp.join().unwrap().unwrap();
}
