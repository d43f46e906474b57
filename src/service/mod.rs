//! Service dispatch for accepting nodes.
//!
//! Inbound DIMSE commands are routed by their affected
//! (or requested) SOP class UID and command field
//! to a handler registered in a [`ServiceRegistry`].
//! Handlers can be added and removed at runtime
//! without disrupting in-flight associations:
//! the registry lock is only held for the lookup,
//! and the handler runs on a clone of its reference.
//!
//! A lookup failure is an application-level failure,
//! answered with the standard _SOP class not supported_ status,
//! never with an abort.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{ResultExt, Snafu, Whatever};
use tracing::{debug, info, warn};

use crate::association::server::ServerAssociation;
use crate::dimse::command::{is_response_field, status, CEchoRsp, Command, CommandField};
use crate::dimse::{fragment_message, DimseMessage, MessageAssembler};
use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, Pdu};
use crate::transport::TransportStream;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to receive from the association
    Receive {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// failed to send over the association
    Send {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// failed to reassemble an inbound message
    Assemble {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    /// failed to build a response message
    BuildReply {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    #[snafu(display("received a data fragment on unaccepted presentation context {}", id))]
    UnacceptedPresentationContext {
        id: u8,
        backtrace: snafu::Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The context an inbound request is served in.
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    /// the AE title of the node the request came from
    pub peer_ae_title: &'a str,
    /// the AE title of this node
    pub local_ae_title: &'a str,
    /// the presentation context the request arrived on
    pub presentation_context_id: u8,
    /// the transfer syntax negotiated for that context
    pub transfer_syntax: &'a str,
}

/// One response message produced by a service handler.
pub struct ServiceReply {
    command: Vec<u8>,
    data: Option<Vec<u8>>,
}

impl ServiceReply {
    /// Build a reply from a response command
    /// and an optional data set
    /// (already encoded under the context's transfer syntax).
    pub fn new(command: &impl Command, data: Option<Vec<u8>>) -> crate::dimse::Result<Self> {
        Ok(ServiceReply {
            command: command.encode(data.is_some())?,
            data,
        })
    }
}

/// A handler serving one DIMSE service for one SOP class.
///
/// Handlers run inline on the association's service loop:
/// they must return promptly,
/// or the peer's read timer may fire.
/// Long-running work belongs on a worker owned by the handler,
/// with the intermediate results delivered
/// through pending-status replies.
///
/// For multi-response services such as C-FIND,
/// return the intermediate (pending status) replies
/// followed by the final one.
pub trait ServiceHandler: Send + Sync {
    /// Serve one request, producing the response message(s) to send back.
    ///
    /// A returned error is reported to the peer
    /// as a _processing failure_ status;
    /// it never aborts the association.
    fn call(
        &self,
        ctx: ServiceContext<'_>,
        request: DimseMessage,
    ) -> std::result::Result<Vec<ServiceReply>, Whatever>;
}

/// A registry routing inbound commands to service handlers
/// by (SOP class UID, command field).
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use dicom_net::service::{EchoService, ServiceRegistry};
/// # use dicom_net::dimse::command::CommandField;
/// let registry = ServiceRegistry::new();
/// registry.register(
///     "1.2.840.10008.1.1",
///     CommandField::CEchoRq,
///     Arc::new(EchoService),
/// );
/// ```
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<(String, u16), Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Register a handler for the given SOP class and command field,
    /// replacing any previous registration for that pair.
    pub fn register(
        &self,
        sop_class_uid: impl Into<String>,
        command_field: CommandField,
        handler: Arc<dyn ServiceHandler>,
    ) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert((sop_class_uid.into(), command_field as u16), handler);
    }

    /// Remove the handler for the given SOP class and command field.
    ///
    /// Associations currently dispatching to the handler
    /// keep their clone of it and are not disturbed.
    pub fn unregister(&self, sop_class_uid: &str, command_field: CommandField) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .remove(&(sop_class_uid.to_string(), command_field as u16))
            .is_some()
    }

    /// Find the handler for the given SOP class and command field code.
    pub fn lookup(&self, sop_class_uid: &str, command_field: u16) -> Option<Arc<dyn ServiceHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .get(&(sop_class_uid.to_string(), command_field))
            .cloned()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .handlers
            .read()
            .map(|handlers| handlers.len())
            .unwrap_or(0);
        f.debug_struct("ServiceRegistry")
            .field("handlers", &count)
            .finish()
    }
}

/// The standard verification (C-ECHO) service.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

impl ServiceHandler for EchoService {
    fn call(
        &self,
        _ctx: ServiceContext<'_>,
        request: DimseMessage,
    ) -> std::result::Result<Vec<ServiceReply>, Whatever> {
        let message_id = request
            .command
            .message_id()
            .whatever_context("C-ECHO request with no message ID")?;
        let response = CEchoRsp {
            message_id_being_responded_to: message_id,
            status: status::SUCCESS,
        };
        let reply = ServiceReply::new(&response, None)
            .whatever_context("could not build C-ECHO response")?;
        Ok(vec![reply])
    }
}

/// Serve DIMSE requests on an established acceptor association
/// until the peer releases or the association ends.
///
/// Inbound messages are reassembled and dispatched through `registry`;
/// an A-RELEASE-RQ is answered and ends the loop normally;
/// a peer abort or protocol violation surfaces as an error.
pub fn serve<S>(association: &mut ServerAssociation<S>, registry: &ServiceRegistry) -> Result<()>
where
    S: TransportStream,
{
    let mut assembler = MessageAssembler::new();
    info!(
        "Serving DIMSE requests for {}",
        association.client_ae_title()
    );

    loop {
        let pdu = association.receive().context(ReceiveSnafu)?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    let context_id = pdv.presentation_context_id;
                    let transfer_syntax = association
                        .presentation_contexts()
                        .iter()
                        .find(|pc| pc.id == context_id && pc.is_accepted())
                        .map(|pc| pc.transfer_syntax.clone());
                    let transfer_syntax = match transfer_syntax {
                        Some(ts) => ts,
                        None => {
                            // fragment outside the negotiated table:
                            // protocol violation, abort
                            let _ = association.send(&Pdu::AbortRQ {
                                source: AbortRQSource::ServiceProvider(
                                    AbortRQServiceProviderReason::UnexpectedPduParameter,
                                ),
                            });
                            return UnacceptedPresentationContextSnafu { id: context_id }.fail();
                        }
                    };

                    let message = match assembler.push(pdv) {
                        Ok(None) => continue,
                        Ok(Some(message)) => message,
                        Err(e) => {
                            let _ = association.send(&Pdu::AbortRQ {
                                source: AbortRQSource::ServiceProvider(
                                    AbortRQServiceProviderReason::InvalidPduParameter,
                                ),
                            });
                            return Err(e).context(AssembleSnafu);
                        }
                    };

                    let pdus = dispatch_to_pdus(
                        registry,
                        association.client_ae_title(),
                        association.ae_title(),
                        context_id,
                        &transfer_syntax,
                        message,
                        association.requestor_max_pdu_length(),
                    )?;
                    for pdu in &pdus {
                        association.send(pdu).context(SendSnafu)?;
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).context(SendSnafu)?;
                debug!("Association released by {}", association.client_ae_title());
                return Ok(());
            }
            pdu => {
                // the association layer only lets release and data through here
                warn!(
                    "Ignoring PDU `{}` on the service loop",
                    pdu.short_description()
                );
            }
        }
    }
}

/// Dispatch one reassembled inbound message through the registry,
/// returning the PDUs to answer it with.
pub(crate) fn dispatch_to_pdus(
    registry: &ServiceRegistry,
    peer_ae_title: &str,
    local_ae_title: &str,
    presentation_context_id: u8,
    transfer_syntax: &str,
    message: DimseMessage,
    peer_max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    let command_field = message.command.command_field().context(AssembleSnafu)?;

    if is_response_field(command_field) {
        warn!("Discarding unsolicited response message (field {:#06x})", command_field);
        return Ok(Vec::new());
    }
    if command_field == CommandField::CCancelRq as u16 {
        // cancellation of an operation this loop is not running
        debug!("Ignoring C-CANCEL with no matching operation");
        return Ok(Vec::new());
    }

    let message_id = match message.command.message_id() {
        Ok(message_id) => message_id,
        Err(_) => {
            warn!("Discarding request with no message ID (field {:#06x})", command_field);
            return Ok(Vec::new());
        }
    };
    let sop_class_uid = match message.command.sop_class_uid() {
        Some(uid) => uid,
        None => {
            warn!("Request {:#06x} carries no SOP class UID", command_field);
            return fallback_response_pdus(
                command_field,
                message_id,
                None,
                status::PROCESSING_FAILURE,
                presentation_context_id,
                peer_max_pdu_length,
            );
        }
    };

    match registry.lookup(&sop_class_uid, command_field) {
        Some(handler) => {
            let ctx = ServiceContext {
                peer_ae_title,
                local_ae_title,
                presentation_context_id,
                transfer_syntax,
            };
            match handler.call(ctx, message) {
                Ok(replies) => {
                    let mut pdus = Vec::new();
                    for reply in replies {
                        pdus.extend(fragment_message(
                            presentation_context_id,
                            reply.command,
                            reply.data,
                            peer_max_pdu_length,
                        ));
                    }
                    Ok(pdus)
                }
                Err(e) => {
                    warn!(
                        "Handler for SOP class {} failed: {}",
                        sop_class_uid, e
                    );
                    fallback_response_pdus(
                        command_field,
                        message_id,
                        Some(&sop_class_uid),
                        status::PROCESSING_FAILURE,
                        presentation_context_id,
                        peer_max_pdu_length,
                    )
                }
            }
        }
        None => {
            info!(
                "No handler for SOP class {} (field {:#06x})",
                sop_class_uid, command_field
            );
            fallback_response_pdus(
                command_field,
                message_id,
                Some(&sop_class_uid),
                status::SOP_CLASS_NOT_SUPPORTED,
                presentation_context_id,
                peer_max_pdu_length,
            )
        }
    }
}

/// Answer a message with the _SOP class not supported_ status,
/// for nodes with no registry at hand.
pub(crate) fn unsupported_to_pdus(
    message: &DimseMessage,
    peer_max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    let command_field = message.command.command_field().context(AssembleSnafu)?;
    let message_id = message.command.message_id().context(AssembleSnafu)?;
    fallback_response_pdus(
        command_field,
        message_id,
        message.command.sop_class_uid().as_deref(),
        status::SOP_CLASS_NOT_SUPPORTED,
        message.presentation_context_id,
        peer_max_pdu_length,
    )
}

/// Build a minimal response command set
/// answering `command_field`/`message_id` with the given status,
/// already fragmented for the wire.
fn fallback_response_pdus(
    command_field: u16,
    message_id: u16,
    sop_class_uid: Option<&str>,
    response_status: u16,
    presentation_context_id: u8,
    peer_max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    let mut obj = InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::response_code(command_field)]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response_status])),
    ]);
    if let Some(uid) = sop_class_uid {
        obj.put(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));
    }

    let mut command = Vec::new();
    obj.write_dataset_with_ts(&mut command, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(crate::dimse::EncodeCommandSnafu)
        .context(BuildReplySnafu)?;

    Ok(fragment_message(
        presentation_context_id,
        command,
        None,
        peer_max_pdu_length,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::command::{CEchoRq, CommandSet};
    use crate::pdu::PDataValueType;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

    fn echo_message(message_id: u16) -> DimseMessage {
        let bytes = CEchoRq { message_id }.encode(false).unwrap();
        DimseMessage {
            presentation_context_id: 1,
            command: CommandSet::decode(&bytes).unwrap(),
            data: None,
        }
    }

    fn first_command_set(pdus: &[Pdu]) -> CommandSet {
        let mut bytes = Vec::new();
        for pdu in pdus {
            if let Pdu::PData { data } = pdu {
                for pdv in data {
                    assert_eq!(pdv.value_type, PDataValueType::Command);
                    bytes.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        return CommandSet::decode(&bytes).unwrap();
                    }
                }
            }
        }
        panic!("no complete command in reply PDUs");
    }

    #[test]
    fn registered_echo_handler_answers_success() {
        let registry = ServiceRegistry::new();
        registry.register(VERIFICATION, CommandField::CEchoRq, Arc::new(EchoService));

        let pdus = dispatch_to_pdus(
            &registry,
            "ECHO-SCU",
            "THIS-SCP",
            1,
            IMPLICIT_VR_LE,
            echo_message(11),
            16_384,
        )
        .unwrap();
        let command = first_command_set(&pdus);
        assert_eq!(command.command_field().unwrap(), 0x8030);
        assert_eq!(command.message_id_being_responded_to().unwrap(), 11);
        assert_eq!(command.status().unwrap(), status::SUCCESS);
    }

    #[test]
    fn lookup_failure_is_an_application_failure() {
        let registry = ServiceRegistry::new();

        let pdus = dispatch_to_pdus(
            &registry,
            "ECHO-SCU",
            "THIS-SCP",
            1,
            IMPLICIT_VR_LE,
            echo_message(5),
            16_384,
        )
        .unwrap();
        // a response is produced, not an abort
        let command = first_command_set(&pdus);
        assert_eq!(command.status().unwrap(), status::SOP_CLASS_NOT_SUPPORTED);
        assert_eq!(command.message_id_being_responded_to().unwrap(), 5);
    }

    #[test]
    fn handlers_can_be_added_and_removed_at_runtime() {
        let registry = ServiceRegistry::new();
        assert!(registry.lookup(VERIFICATION, 0x0030).is_none());

        registry.register(VERIFICATION, CommandField::CEchoRq, Arc::new(EchoService));
        let live = registry.lookup(VERIFICATION, 0x0030).unwrap();

        assert!(registry.unregister(VERIFICATION, CommandField::CEchoRq));
        assert!(!registry.unregister(VERIFICATION, CommandField::CEchoRq));
        assert!(registry.lookup(VERIFICATION, 0x0030).is_none());

        // an in-flight clone keeps working after removal
        let reply = live
            .call(
                ServiceContext {
                    peer_ae_title: "A",
                    local_ae_title: "B",
                    presentation_context_id: 1,
                    transfer_syntax: IMPLICIT_VR_LE,
                },
                echo_message(1),
            )
            .unwrap();
        assert_eq!(reply.len(), 1);
    }

    #[test]
    fn unsolicited_responses_are_dropped() {
        let registry = ServiceRegistry::new();
        let bytes = crate::dimse::command::CEchoRsp {
            message_id_being_responded_to: 1,
            status: status::SUCCESS,
        }
        .encode(false)
        .unwrap();
        let message = DimseMessage {
            presentation_context_id: 1,
            command: CommandSet::decode(&bytes).unwrap(),
            data: None,
        };
        let pdus = dispatch_to_pdus(
            &registry,
            "A",
            "B",
            1,
            IMPLICIT_VR_LE,
            message,
            16_384,
        )
        .unwrap();
        assert!(pdus.is_empty());
    }
}
