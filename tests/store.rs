//! C-STORE with a large data set:
//! fragmentation across the wire and byte-identical reassembly.
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Whatever};

use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::dimse::command::{status, CStoreRq, CStoreRsp, Priority};
use dicom_net::dimse::{DimseClient, DimseMessage};
use dicom_net::service::{
    serve, ServiceContext, ServiceHandler, ServiceRegistry, ServiceReply,
};

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static MR_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.4";
static INSTANCE_UID: &str = "2.25.221456831735590519447236364123927868545";

/// A storage handler which captures the stored bytes.
#[derive(Debug, Default)]
struct CaptureStorage {
    received: Mutex<Vec<Vec<u8>>>,
}

impl ServiceHandler for CaptureStorage {
    fn call(
        &self,
        ctx: ServiceContext<'_>,
        request: DimseMessage,
    ) -> Result<Vec<ServiceReply>, Whatever> {
        assert_eq!(ctx.transfer_syntax, IMPLICIT_VR_LE);
        let message_id = request
            .command
            .message_id()
            .whatever_context("missing message ID")?;
        let sop_class_uid = request
            .command
            .sop_class_uid()
            .whatever_context("missing SOP class UID")?;
        let sop_instance_uid = request
            .command
            .sop_instance_uid()
            .whatever_context("missing SOP instance UID")?;
        let data = request.data.whatever_context("missing data set")?;
        self.received
            .lock()
            .expect("lock should not be poisoned")
            .push(data);

        let response = CStoreRsp {
            message_id_being_responded_to: message_id,
            affected_sop_class_uid: sop_class_uid,
            affected_sop_instance_uid: sop_instance_uid,
            status: status::SUCCESS,
        };
        let reply =
            ServiceReply::new(&response, None).whatever_context("could not build response")?;
        Ok(vec![reply])
    }
}

/// A 200 000 byte data set over a negotiated maximum PDU length of 16 384
/// reaches the peer byte-identical.
#[test]
fn c_store_fragments_large_data_set() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let storage = Arc::new(CaptureStorage::default());
    let scp_storage = Arc::clone(&storage);

    let scp_handle = spawn(move || {
        let registry = ServiceRegistry::new();
        registry.register(
            MR_STORAGE_SOP_CLASS,
            dicom_net::dimse::command::CommandField::CStoreRq,
            scp_storage,
        );

        let scp = ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(MR_STORAGE_SOP_CLASS)
            .with_transfer_syntax(IMPLICIT_VR_LE)
            .max_pdu_length(16_384);
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        serve(&mut association, &registry).unwrap();
    });

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(MR_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .release_timeout(Duration::from_secs(5))
        .establish(addr)
        .unwrap();
    // the acceptor declared its own maximum PDU length
    assert_eq!(association.acceptor_max_pdu_length(), 16_384);

    let client = DimseClient::new(association).unwrap();
    let context_id = client.presentation_contexts()[0].id;
    let request = CStoreRq {
        message_id: client.next_message_id(),
        affected_sop_class_uid: MR_STORAGE_SOP_CLASS.to_string(),
        affected_sop_instance_uid: INSTANCE_UID.to_string(),
        priority: Priority::Medium,
        move_originator_ae_title: None,
        move_originator_message_id: None,
    };

    let responses = client
        .send_request(context_id, &request, Some(payload.clone()))
        .unwrap();
    let response = responses
        .next_timeout(Duration::from_secs(10))
        .expect("the store response should arrive");
    assert_eq!(response.status, status::SUCCESS);
    assert_eq!(
        response.command.sop_instance_uid().as_deref(),
        Some(INSTANCE_UID)
    );

    client.release().expect("release should succeed");
    scp_handle.join().expect("SCP panicked");

    let received = storage.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].len(), payload.len());
    assert_eq!(received[0], payload);
}
