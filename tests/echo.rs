//! End-to-end C-ECHO exchange through the DIMSE client
//! and the service registry.
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::spawn;
use std::time::Duration;

use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::dimse::command::{status, CEchoRq, CommandField};
use dicom_net::dimse::{DimseClient, Error, SessionLost};
use dicom_net::service::{serve, EchoService, ServiceRegistry};

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// A C-ECHO request round-trips with a success status.
#[test]
fn c_echo_round_trip() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp_handle = spawn(move || {
        let registry = ServiceRegistry::new();
        registry.register(
            VERIFICATION_SOP_CLASS,
            CommandField::CEchoRq,
            Arc::new(EchoService),
        );

        let scp = ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS);
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        // ends normally when the peer releases
        serve(&mut association, &registry).unwrap();
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .release_timeout(Duration::from_secs(5))
        .establish(addr)
        .unwrap();
    let client = DimseClient::new(association).unwrap();

    let context_id = client.presentation_contexts()[0].id;
    let message_id = client.next_message_id();
    let responses = client
        .send_request(context_id, &CEchoRq { message_id }, None)
        .unwrap();

    let response = responses
        .next_timeout(Duration::from_secs(5))
        .expect("the echo response should arrive");
    assert_eq!(response.status, status::SUCCESS);
    assert!(response.is_final());
    assert_eq!(
        response.command.message_id_being_responded_to().unwrap(),
        message_id
    );
    assert_eq!(response.command.command_field().unwrap(), 0x8030);

    client.release().expect("release should succeed");
    scp_handle.join().expect("SCP panicked");
}

/// Message IDs must be unique among outstanding requests.
#[test]
fn duplicate_message_ids_are_refused() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp_handle = spawn(move || {
        let scp = ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS);
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        // swallow whatever arrives until the association ends
        while association.receive().is_ok() {}
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    let client = DimseClient::new(association).unwrap();
    let context_id = client.presentation_contexts()[0].id;

    let _first = client
        .send_request(context_id, &CEchoRq { message_id: 9 }, None)
        .unwrap();
    let err = client
        .send_request(context_id, &CEchoRq { message_id: 9 }, None)
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateMessageId { message_id: 9, .. }));

    // a request on a context that was never negotiated is refused locally
    let err = client
        .send_request(99, &CEchoRq { message_id: 10 }, None)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPresentationContext { id: 99, .. }));

    client.abort();
    scp_handle.join().unwrap();
}

/// A peer abort mid-exchange fails every outstanding request
/// exactly once, and no further PDUs are written.
#[test]
fn peer_abort_fails_outstanding_requests() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp_handle = spawn(move || {
        let scp = ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS);
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        // consume the two echo requests, then abort without answering
        let mut seen = 0;
        while seen < 2 {
            match association.receive().unwrap() {
                dicom_net::Pdu::PData { data } => {
                    seen += data.iter().filter(|pdv| pdv.is_last).count();
                }
                pdu => panic!("unexpected PDU {:?}", pdu),
            }
        }
        association.abort().unwrap();
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    let client = DimseClient::new(association).unwrap();
    let context_id = client.presentation_contexts()[0].id;

    let first = client
        .send_request(context_id, &CEchoRq { message_id: 1 }, None)
        .unwrap();
    let second = client
        .send_request(context_id, &CEchoRq { message_id: 2 }, None)
        .unwrap();

    for pending in [&first, &second] {
        let err = pending
            .next_timeout(Duration::from_secs(5))
            .expect_err("the request should fail with a session loss");
        match err {
            Error::SessionLost { reason, .. } => {
                assert!(matches!(reason, SessionLost::Aborted(_)), "got {:?}", reason)
            }
            err => panic!("expected a session loss, got {:?}", err),
        }
    }

    // new requests are refused after the session is lost
    let err = client
        .send_request(context_id, &CEchoRq { message_id: 3 }, None)
        .unwrap_err();
    assert!(matches!(err, Error::SessionLost { .. }));

    scp_handle.join().unwrap();
}
