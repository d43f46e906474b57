//! DIMSE message exchange.
//!
//! This module turns command/data-set pairs into presentation data values
//! and back, on top of an established association:
//!
//! - [`command`] holds the typed DIMSE commands
//!   and their _Implicit VR Little Endian_ codec;
//! - [`MessageAssembler`] reassembles inbound fragments into
//!   full [`DimseMessage`]s,
//!   using the last-fragment bit as the sole boundary signal;
//! - [`exchange`] provides [`DimseClient`](exchange::DimseClient),
//!   a concurrency-safe requestor
//!   which correlates responses to outstanding requests by message ID.
pub mod command;
pub mod exchange;

use std::collections::HashMap;

use snafu::{Backtrace, Snafu};

use crate::pdu::{PDataValue, PDataValueType, Pdu};

pub use command::{Command, CommandSet, RequestCommand};
pub use exchange::{DimseClient, DimseResponse, PendingResponses};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to encode a command set
    #[snafu(visibility(pub(crate)))]
    EncodeCommand {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },

    /// failed to decode a command set
    DecodeCommand {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    #[snafu(display("missing or invalid command set field `{}`", field))]
    MissingCommandField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "received a data set fragment with no preceding command on context {}",
        presentation_context_id
    ))]
    UnexpectedDataFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context {} was not negotiated", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display("message ID {} is already in use by an outstanding request", message_id))]
    DuplicateMessageId {
        message_id: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("the session was lost: {}", reason))]
    SessionLost {
        reason: SessionLost,
        backtrace: Backtrace,
    },

    #[snafu(display("no response for message ID {} within the given time", message_id))]
    ReceiveTimeout {
        message_id: u16,
        backtrace: Backtrace,
    },

    /// failed to encode a message for the association
    Send {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// failed to send message bytes on the wire
    Wire {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set up the transport for the exchange
    Transport {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reason an association stopped serving its outstanding requests.
///
/// Delivered exactly once to every pending response handler
/// when the session ends before (or while) its responses arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLost {
    /// the peer (or this node) aborted the association
    Aborted(crate::pdu::AbortRQSource),
    /// a session timer expired
    TimedOut,
    /// a protocol violation forced the association down
    ProtocolViolation,
    /// the connection was closed or released
    Closed,
}

impl std::fmt::Display for SessionLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionLost::Aborted(source) => write!(f, "association aborted by {:?}", source),
            SessionLost::TimedOut => f.write_str("session timer expired"),
            SessionLost::ProtocolViolation => f.write_str("protocol violation"),
            SessionLost::Closed => f.write_str("connection closed"),
        }
    }
}

/// A fully reassembled DIMSE message:
/// a command set and, when the command declares one, a data set.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the decoded command set
    pub command: CommandSet,
    /// the data set bytes, encoded under the context's transfer syntax
    pub data: Option<Vec<u8>>,
}

/// Reassembles presentation data values into DIMSE messages.
///
/// Fragments are concatenated per presentation context
/// and per plane (command or data set)
/// until one arrives with the last-fragment bit set.
/// A command set announcing a data set
/// holds the message back until the data set is complete as well.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: HashMap<u8, Partial>,
}

#[derive(Debug, Default)]
struct Partial {
    command_buffer: Vec<u8>,
    command: Option<CommandSet>,
    data_buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        MessageAssembler::default()
    }

    /// Feed one presentation data value into the assembler,
    /// returning a message once its final fragment arrives.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        let context_id = pdv.presentation_context_id;
        let partial = self.partial.entry(context_id).or_default();

        match pdv.value_type {
            PDataValueType::Command => {
                partial.command_buffer.extend(pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = CommandSet::decode(&partial.command_buffer)?;
                partial.command_buffer.clear();
                if command.has_data_set() {
                    // hold the message until its data set is complete
                    partial.command = Some(command);
                    Ok(None)
                } else {
                    self.partial.remove(&context_id);
                    Ok(Some(DimseMessage {
                        presentation_context_id: context_id,
                        command,
                        data: None,
                    }))
                }
            }
            PDataValueType::Data => {
                if partial.command.is_none() {
                    return UnexpectedDataFragmentSnafu {
                        presentation_context_id: context_id,
                    }
                    .fail();
                }
                partial.data_buffer.extend(pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                match self.partial.remove(&context_id) {
                    Some(Partial {
                        command: Some(command),
                        data_buffer,
                        ..
                    }) => Ok(Some(DimseMessage {
                        presentation_context_id: context_id,
                        command,
                        data: Some(data_buffer),
                    })),
                    _ => UnexpectedDataFragmentSnafu {
                        presentation_context_id: context_id,
                    }
                    .fail(),
                }
            }
        }
    }
}

/// Fragment one outbound message into P-DATA-TF PDUs,
/// command fragments first, then data set fragments,
/// each bounded by the peer's maximum PDU length.
pub(crate) fn fragment_message(
    presentation_context_id: u8,
    command: Vec<u8>,
    data: Option<Vec<u8>>,
    peer_max_pdu_length: u32,
) -> Vec<Pdu> {
    let max_payload = crate::association::pdata::max_fragment_payload(peer_max_pdu_length);
    let mut pdus = Vec::new();
    fragment_plane(
        &mut pdus,
        presentation_context_id,
        PDataValueType::Command,
        command,
        max_payload,
    );
    if let Some(data) = data {
        fragment_plane(
            &mut pdus,
            presentation_context_id,
            PDataValueType::Data,
            data,
            max_payload,
        );
    }
    pdus
}

fn fragment_plane(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    mut payload: Vec<u8>,
    max_payload: usize,
) {
    loop {
        let rest = if payload.len() > max_payload {
            payload.split_off(max_payload)
        } else {
            Vec::new()
        };
        let is_last = rest.is_empty();
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last,
                data: payload,
            }],
        });
        if is_last {
            break;
        }
        payload = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::command::{status, CEchoRsp, CStoreRq, Command, Priority};
    use super::*;

    fn store_rq_bytes(dataset_follows: bool) -> Vec<u8> {
        CStoreRq {
            message_id: 1,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
            affected_sop_instance_uid: "2.25.3218212".to_string(),
            priority: Priority::Medium,
            move_originator_ae_title: None,
            move_originator_message_id: None,
        }
        .encode(dataset_follows)
        .unwrap()
    }

    #[test]
    fn assembles_command_with_data_set() {
        let command = store_rq_bytes(true);
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();

        let mut assembler = MessageAssembler::new();
        let mut messages = Vec::new();
        for pdu in fragment_message(1, command, Some(payload.clone()), 4096) {
            let data = match pdu {
                Pdu::PData { data } => data,
                pdu => panic!("unexpected PDU {:?}", pdu),
            };
            for pdv in data {
                if let Some(msg) = assembler.push(pdv).unwrap() {
                    messages.push(msg);
                }
            }
        }

        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.presentation_context_id, 1);
        assert_eq!(message.command.command_field().unwrap(), 0x0001);
        assert_eq!(message.data.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn command_without_data_set_completes_on_its_last_fragment() {
        let command = CEchoRsp {
            message_id_being_responded_to: 5,
            status: status::SUCCESS,
        }
        .encode(false)
        .unwrap();

        let mut assembler = MessageAssembler::new();
        let mut out = None;
        for pdu in fragment_message(3, command, None, 16_384) {
            if let Pdu::PData { data } = pdu {
                for pdv in data {
                    out = assembler.push(pdv).unwrap();
                }
            }
        }
        let message = out.expect("message should be complete");
        assert_eq!(message.presentation_context_id, 3);
        assert!(message.data.is_none());
    }

    #[test]
    fn data_fragment_without_command_is_refused() {
        let mut assembler = MessageAssembler::new();
        let err = assembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 16],
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedDataFragment { .. }));
    }

    #[test]
    fn interleaved_contexts_are_kept_apart() {
        let echo = CEchoRsp {
            message_id_being_responded_to: 9,
            status: status::SUCCESS,
        }
        .encode(false)
        .unwrap();
        let store = store_rq_bytes(true);

        let mut assembler = MessageAssembler::new();
        // a store command on context 1, held open awaiting data,
        // must not be disturbed by an echo on context 3
        let store_pdvs: Vec<PDataValue> = fragment_message(1, store, Some(vec![7; 64]), 4096)
            .into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                _ => unreachable!(),
            })
            .collect();
        assert!(assembler.push(store_pdvs[0].clone()).unwrap().is_none());

        let echo_pdvs: Vec<PDataValue> = fragment_message(3, echo, None, 4096)
            .into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                _ => unreachable!(),
            })
            .collect();
        let msg = assembler.push(echo_pdvs[0].clone()).unwrap().unwrap();
        assert_eq!(msg.presentation_context_id, 3);

        let msg = assembler.push(store_pdvs[1].clone()).unwrap().unwrap();
        assert_eq!(msg.presentation_context_id, 1);
        assert_eq!(msg.data.as_deref(), Some(&[7u8; 64][..]));
    }
}
