//! Association lifecycle tests over loopback TCP.
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::association::{AssociationState, Error};
use dicom_net::pdu::{
    write_pdu, AssociationRJServiceUserReason, AssociationRJSource, PDataValue, PDataValueType,
    Pdu, PresentationContextResult, PresentationContextResultReason,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

fn spawn_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.state(), AssociationState::Established);
        let contexts: Vec<PresentationContextResult> = association
            .presentation_contexts()
            .iter()
            .map(PresentationContextResult::from)
            .collect();
        assert_eq!(
            contexts,
            vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                }
            ],
        );

        // handle one release request
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        assert_eq!(association.state(), AssociationState::Closed);

        Ok(())
    });
    Ok((h, addr))
}

/// Run an SCP and an SCU concurrently,
/// negotiate an association and release it.
#[test]
fn scu_scp_association_test() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .with_presentation_context(
            DIGITAL_MG_STORAGE_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE, JPEG_BASELINE],
        )
        .establish(scp_addr)
        .unwrap();

    // only the verification context was accepted
    assert_eq!(association.presentation_contexts().len(), 1);
    assert_eq!(association.presentation_contexts()[0].id, 1);
    assert_eq!(association.state(), AssociationState::Established);

    association
        .release()
        .expect("did not have a peaceful release");

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
}

/// An association with zero accepted presentation contexts
/// is a negotiation failure for the requestor.
#[test]
fn association_with_no_usable_context_fails() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        // negotiation itself succeeds, with every context rejected
        let mut association = scp.establish(stream).unwrap();
        assert!(association
            .presentation_contexts()
            .iter()
            .all(|pc| !pc.is_accepted()));
        // the requestor gives up with an abort (or closes outright)
        let _ = association.receive();
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(DIGITAL_MG_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap_err();
    assert!(matches!(err, Error::NoAcceptedPresentationContexts { .. }));

    scp_handle.join().unwrap();
}

/// The acceptor's AE title policy yields a typed rejection.
#[test]
fn association_rejected_on_unknown_called_ae_title() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let err = scp.establish(stream).unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NO-SUCH-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap_err();

    match err {
        Error::Rejected { association_rj, .. } => assert_eq!(
            association_rj.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        ),
        err => panic!("expected a rejection, got {:?}", err),
    }

    scp_handle.join().unwrap();
}

/// Both peers request a release within the same round trip;
/// both must reach the closed state without hanging.
#[test]
fn release_collision_resolves_without_deadlock() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .release_timeout(Duration::from_secs(5));

    let scp_handle = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        // initiate a release from the acceptor side immediately
        association.send(&Pdu::ReleaseRQ).unwrap();
        assert_eq!(association.state(), AssociationState::AwaitingReleaseResponse);
        // the peer's own release request satisfies this wait
        match association.receive().unwrap() {
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).unwrap();
            }
            Pdu::ReleaseRP => {}
            pdu => panic!("unexpected PDU {:?}", pdu),
        }
        assert_eq!(association.state(), AssociationState::Closed);
    });

    let start = Instant::now();
    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .release_timeout(Duration::from_secs(5))
        .establish(addr)
        .unwrap();
    association.release().expect("release should resolve");
    assert!(start.elapsed() < Duration::from_secs(5));

    scp_handle.join().unwrap();
}

/// No response within the associate-response timeout:
/// the requestor aborts within a bounded delay.
#[test]
fn associate_response_timeout_aborts() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp_handle = spawn(move || {
        // accept the transport but never answer the request
        let (stream, _addr) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(3));
        drop(stream);
    });

    let timeout = Duration::from_millis(300);
    let start = Instant::now();
    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .response_timeout(timeout)
        .establish(addr)
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
    assert!(
        elapsed >= timeout && elapsed < timeout + Duration::from_secs(2),
        "aborted after {:?}",
        elapsed
    );

    scp_handle.join().unwrap();
}

/// P-Data sent before any association request
/// is answered with an abort, never an acknowledgement.
#[test]
fn data_before_association_is_aborted() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let err = scp.establish(stream).unwrap_err();
        assert!(matches!(err, Error::UnexpectedPdu { .. }));
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 16],
            }],
        },
    )
    .unwrap();
    std::io::Write::write_all(&mut stream, &bytes).unwrap();

    // the answer must be an A-ABORT
    let mut buffer = bytes::BytesMut::new();
    let mut reply = [0u8; 1024];
    let mut total = 0;
    loop {
        match std::io::Read::read(&mut stream, &mut reply[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => break,
        }
    }
    buffer.extend_from_slice(&reply[..total]);
    let mut cursor = std::io::Cursor::new(&buffer[..]);
    let pdu = dicom_net::read_pdu(&mut cursor, dicom_net::pdu::DEFAULT_MAX_PDU, true)
        .unwrap()
        .expect("an abort PDU should have been sent");
    assert!(matches!(pdu, Pdu::AbortRQ { .. }));

    scp_handle.join().unwrap();
}
