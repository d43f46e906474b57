//! DICOM association module
//!
//! This module contains the utilities for establishing associations
//! between DICOM nodes and driving their lifecycle.
//!
//! As an association requester,
//! often as a service class user (SCU),
//! a new association is started
//! via the [`ClientAssociationOptions`] type.
//! The minimum required properties are the proposed presentation contexts
//! and the address of the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! a newly accepted [TCP stream](std::net::TcpStream) is passed to
//! a previously prepared [`ServerAssociationOptions`].
//!
//! Both sides track the session lifecycle explicitly
//! through [`AssociationState`]:
//! a PDU which is illegal for the current state,
//! a malformed PDU,
//! or the expiry of the timer bound to the current wait state
//! all force an A-ABORT and terminate the association.
pub mod client;
pub mod negotiate;
pub mod pdata;
pub mod server;

pub(crate) mod uid;

use bytes::{Buf, BytesMut};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::{Cursor, Read};

use crate::pdu::{
    read_pdu, write_pdu, AbortRQSource, AssociationRJ, Pdu, UserVariableItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use negotiate::PresentationContextNegotiated;
pub use pdata::{PDataReader, PDataWriter};
pub use server::{ServerAssociation, ServerAssociationOptions};

/// The lifecycle state of an association.
///
/// `Idle` is the initial state;
/// `Closed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// No session activity yet
    Idle,
    /// Requestor only: the transport is being opened
    AwaitingTransportConnect,
    /// Requestor only: A-ASSOCIATE-RQ sent, waiting for the response
    AwaitingAssociateResponse,
    /// Acceptor only: transport accepted, waiting for A-ASSOCIATE-RQ
    AwaitingAssociateRequest,
    /// Negotiation complete, DIMSE traffic may flow
    Established,
    /// A-RELEASE-RQ sent, waiting for the reply
    AwaitingReleaseResponse,
    /// A-RELEASE-RQ received, reply not sent yet
    ReleaseIndicated,
    /// The association was aborted by either peer
    Aborted,
    /// The association ended by orderly release or rejection
    Closed,
}

impl std::fmt::Display for AssociationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AssociationState::Idle => "Idle",
            AssociationState::AwaitingTransportConnect => "AwaitingTransportConnect",
            AssociationState::AwaitingAssociateResponse => "AwaitingAssociateResponse",
            AssociationState::AwaitingAssociateRequest => "AwaitingAssociateRequest",
            AssociationState::Established => "Established",
            AssociationState::AwaitingReleaseResponse => "AwaitingReleaseResponse",
            AssociationState::ReleaseIndicated => "ReleaseIndicated",
            AssociationState::Aborted => "Aborted",
            AssociationState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing at least one abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to the peer node
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not tunnel the connection through the HTTP proxy
    ProxyTunnel {
        #[snafu(backtrace)]
        source: crate::transport::proxy::Error,
    },

    /// could not configure the socket
    ConfigureSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// a TLS configuration is required for this operation
    #[cfg(feature = "tls")]
    TlsConfigMissing { backtrace: Backtrace },

    /// failure in the TLS layer
    #[cfg(feature = "tls")]
    Tls {
        source: rustls::Error,
        backtrace: Backtrace,
    },

    #[cfg(feature = "tls")]
    #[snafu(display("invalid server name `{}` for TLS", name))]
    InvalidServerName { name: String, backtrace: Backtrace },

    /// failed to encode an outbound PDU
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU bytes on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to decode an inbound PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to read PDU bytes from the wire
    WireRead {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the connection was closed by the peer
    ConnectionClosed { backtrace: Backtrace },

    /// did not receive a PDU within the configured time
    Timeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected by the peer: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// the association was aborted
    #[snafu(display("association aborted by {:?}", origin))]
    Aborted {
        origin: AbortRQSource,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU `{}` in state {}", pdu.short_description(), state))]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
        /// the association state it arrived in
        state: AssociationState,
    },

    #[snafu(display("unknown PDU received from the peer"))]
    UnknownPdu {
        /// the PDU obtained from the peer, of variant Unknown
        pdu: Box<Pdu>,
    },

    #[snafu(display("cannot send `{}` in state {}", description, state))]
    IllegalSend {
        description: String,
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display("cannot receive in state {}", state))]
    IllegalReceive {
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity",
        length
    ))]
    SendTooLongPdu { length: usize, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of acceptor-side negotiation,
/// carried from the options into the established association.
#[derive(Debug, Clone)]
pub(crate) struct NegotiatedOptions {
    /// the maximum PDU length the peer is willing to receive
    pub peer_max_pdu_length: u32,
    /// the user variables received from the peer
    pub user_variables: Vec<UserVariableItem>,
    /// the negotiated presentation contexts, accepted and rejected
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the peer's AE title
    pub peer_ae_title: String,
}

/// Extract the peer's declared maximum PDU length from its user variables,
/// mapping the "unlimited" marker (0) to `fallback_for_zero`.
pub(crate) fn peer_max_pdu_length(
    user_variables: &[UserVariableItem],
    fallback_for_zero: u32,
) -> u32 {
    let declared = user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU);
    if declared == 0 {
        fallback_for_zero
    } else {
        declared
    }
}

/// Read one full PDU from the stream,
/// buffering partial frames in `read_buffer` across calls.
///
/// I/O timeouts configured on the stream surface as [`Error::Timeout`];
/// an orderly end of stream as [`Error::ConnectionClosed`].
pub(crate) fn read_pdu_from_wire<R>(
    reader: &mut R,
    read_buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: Read,
{
    loop {
        let mut cursor = Cursor::new(&read_buffer[..]);
        if let Some(pdu) = read_pdu(&mut cursor, max_pdu_length, strict).context(ReceivePduSnafu)? {
            read_buffer.advance(cursor.position() as usize);
            return Ok(pdu);
        }

        let mut chunk = [0u8; 8192];
        match reader.read(&mut chunk) {
            Ok(0) => return ConnectionClosedSnafu.fail(),
            Ok(n) => read_buffer.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(e).context(TimeoutSnafu);
            }
            Err(e) => return Err(e).context(WireReadSnafu),
        }
    }
}

/// Encode a PDU into `buffer`,
/// refusing to produce a frame larger than
/// the peer's maximum PDU length plus the PDU header.
pub(crate) fn encode_pdu(buffer: &mut Vec<u8>, pdu: &Pdu, max_pdu_length: u32) -> Result<()> {
    buffer.clear();
    write_pdu(buffer, pdu).context(SendPduSnafu)?;
    let limit = max_pdu_length
        .min(MAXIMUM_PDU_SIZE)
        .saturating_add(PDU_HEADER_SIZE) as usize;
    snafu::ensure!(
        buffer.len() <= limit,
        SendTooLongPduSnafu {
            length: buffer.len()
        }
    );
    Ok(())
}

/// Whether the given PDU may be sent in the given state.
pub(crate) fn pdu_legal_to_send(state: AssociationState, pdu: &Pdu) -> bool {
    match (state, pdu) {
        // abort is always a legal way out of a live session
        (
            AssociationState::Established
            | AssociationState::AwaitingReleaseResponse
            | AssociationState::ReleaseIndicated,
            Pdu::AbortRQ { .. },
        ) => true,
        (AssociationState::Established, Pdu::PData { .. } | Pdu::ReleaseRQ) => true,
        (AssociationState::ReleaseIndicated, Pdu::ReleaseRP) => true,
        // the release collision resolution:
        // answering the peer's request while waiting for our own reply
        (AssociationState::AwaitingReleaseResponse, Pdu::ReleaseRP) => true,
        _ => false,
    }
}

/// The state transition implied by successfully sending the given PDU.
pub(crate) fn state_after_send(state: AssociationState, pdu: &Pdu) -> AssociationState {
    match pdu {
        Pdu::AbortRQ { .. } => AssociationState::Aborted,
        Pdu::ReleaseRQ => AssociationState::AwaitingReleaseResponse,
        Pdu::ReleaseRP => AssociationState::Closed,
        _ => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PDataValue;
    use crate::pdu::PDataValueType;

    fn pdata() -> Pdu {
        Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 8],
            }],
        }
    }

    #[test]
    fn send_legality_follows_the_state_machine() {
        use AssociationState::*;

        assert!(pdu_legal_to_send(Established, &pdata()));
        assert!(pdu_legal_to_send(Established, &Pdu::ReleaseRQ));
        assert!(!pdu_legal_to_send(Established, &Pdu::ReleaseRP));

        // no data may flow before establishment
        assert!(!pdu_legal_to_send(Idle, &pdata()));
        assert!(!pdu_legal_to_send(AwaitingAssociateResponse, &pdata()));

        // nothing flows out of a terminal state
        assert!(!pdu_legal_to_send(Closed, &pdata()));
        assert!(!pdu_legal_to_send(
            Aborted,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser
            }
        ));

        // release collision: a reply may be sent while awaiting our own
        assert!(pdu_legal_to_send(AwaitingReleaseResponse, &Pdu::ReleaseRP));
        assert!(!pdu_legal_to_send(AwaitingReleaseResponse, &pdata()));
    }

    #[test]
    fn incremental_wire_read_waits_for_full_frames() {
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &Pdu::ReleaseRQ).unwrap();

        // deliver the frame one byte at a time
        struct Trickle<'a>(&'a [u8], usize);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Ok(0);
                }
                buf[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }

        let mut reader = Trickle(&bytes, 0);
        let mut buffer = BytesMut::new();
        let pdu = read_pdu_from_wire(&mut reader, &mut buffer, DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        assert!(buffer.is_empty());

        // end of stream with no pending frame
        let err = read_pdu_from_wire(&mut reader, &mut buffer, DEFAULT_MAX_PDU, true).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
    }
}
