//! Multi-response exchange:
//! a C-FIND style service emits pending responses
//! before the final one,
//! and the requestor's handler stays registered until the end.
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::spawn;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Whatever};

use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::dimse::command::{status, CFindRq, CFindRsp, CommandField, Priority};
use dicom_net::dimse::{DimseClient, DimseMessage};
use dicom_net::service::{serve, ServiceContext, ServiceHandler, ServiceRegistry, ServiceReply};

static SCU_AE_TITLE: &str = "FIND-SCU";
static SCP_AE_TITLE: &str = "FIND-SCP";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

/// A query service which answers any query
/// with two matches and a final success.
struct TwoMatches;

impl ServiceHandler for TwoMatches {
    fn call(
        &self,
        _ctx: ServiceContext<'_>,
        request: DimseMessage,
    ) -> Result<Vec<ServiceReply>, Whatever> {
        let message_id = request
            .command
            .message_id()
            .whatever_context("missing message ID")?;
        let sop_class_uid = request
            .command
            .sop_class_uid()
            .whatever_context("missing SOP class UID")?;
        request.data.as_ref().whatever_context("missing identifier")?;

        let mut replies = Vec::new();
        for matched in [b"match-one".to_vec(), b"match-two".to_vec()] {
            let pending = CFindRsp {
                message_id_being_responded_to: message_id,
                affected_sop_class_uid: sop_class_uid.clone(),
                status: status::PENDING,
            };
            replies.push(
                ServiceReply::new(&pending, Some(matched))
                    .whatever_context("could not build pending reply")?,
            );
        }
        let done = CFindRsp {
            message_id_being_responded_to: message_id,
            affected_sop_class_uid: sop_class_uid,
            status: status::SUCCESS,
        };
        replies.push(ServiceReply::new(&done, None).whatever_context("could not build final reply")?);
        Ok(replies)
    }
}

#[test]
fn c_find_delivers_all_responses_in_order() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp_handle = spawn(move || {
        let registry = ServiceRegistry::new();
        registry.register(STUDY_ROOT_QR_FIND, CommandField::CFindRq, Arc::new(TwoMatches));

        let scp = ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(STUDY_ROOT_QR_FIND)
            .with_transfer_syntax(IMPLICIT_VR_LE);
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        serve(&mut association, &registry).unwrap();
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(STUDY_ROOT_QR_FIND, vec![IMPLICIT_VR_LE])
        .release_timeout(Duration::from_secs(5))
        .establish(addr)
        .unwrap();
    let client = DimseClient::new(association).unwrap();
    let context_id = client.presentation_contexts()[0].id;

    let request = CFindRq {
        message_id: client.next_message_id(),
        affected_sop_class_uid: STUDY_ROOT_QR_FIND.to_string(),
        priority: Priority::Medium,
    };
    // the query identifier data set, opaque at this layer
    let identifier = vec![0u8; 32];
    let responses = client
        .send_request(context_id, &request, Some(identifier))
        .unwrap();

    let first = responses.next_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.status, status::PENDING);
    assert!(!first.is_final());
    assert_eq!(first.data.as_deref(), Some(&b"match-one"[..]));

    let second = responses.next_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.status, status::PENDING);
    assert_eq!(second.data.as_deref(), Some(&b"match-two"[..]));

    let done = responses.next_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(done.status, status::SUCCESS);
    assert!(done.is_final());
    assert!(done.data.is_none());

    // the completion was deregistered with the final response;
    // the same message ID may be used again
    let again = CFindRq {
        message_id: request.message_id,
        affected_sop_class_uid: STUDY_ROOT_QR_FIND.to_string(),
        priority: Priority::Medium,
    };
    let responses = client
        .send_request(context_id, &again, Some(vec![0u8; 16]))
        .unwrap();
    let first = responses.next_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.status, status::PENDING);
    drop(responses);
    client.forget(again.message_id);

    client.release().expect("release should succeed");
    scp_handle.join().expect("SCP panicked");
}
