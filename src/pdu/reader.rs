//! PDU decoding from length-prefixed binary frames.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, Read};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid presentation data value item length {} (must be >= 2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display("PDU contained an unexpected variable item {:?}", var_item))]
    UnexpectedPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("multiple transfer syntaxes were accepted in one presentation context"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },

    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Try to decode a full PDU from the bytes remaining in `reader`.
///
/// Returns `Ok(None)` if the buffer does not yet hold the complete frame
/// declared by the PDU length field,
/// in which case the cursor position is left unspecified
/// and the caller should retry with more data.
/// On success the cursor is advanced to the first byte
/// after the decoded PDU.
///
/// In strict mode, PDUs longer than `max_pdu_length` are refused;
/// otherwise they are admitted up to the maximum size
/// accepted by the standard, with a warning.
pub fn read_pdu(
    reader: &mut Cursor<&[u8]>,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Option<Pdu>> {
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    let total = reader.get_ref().len() as u64;
    if total - reader.position() < u64::from(PDU_HEADER_SIZE) {
        return Ok(None);
    }

    let pdu_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "PDU-type" })?;
    let _reserved = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        if pdu_length > max_pdu_length {
            warn!(
                "Incoming PDU of length {} exceeds the negotiated maximum of {}",
                pdu_length, max_pdu_length
            );
        }
    }

    if total - reader.position() < u64::from(pdu_length) {
        return Ok(None);
    }

    let start = reader.position() as usize;
    let end = start + pdu_length as usize;
    let body = &reader.get_ref()[start..end];
    let pdu = read_pdu_body(pdu_type, body)?;
    reader.set_position(end as u64);
    Ok(Some(pdu))
}

fn read_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => read_associate_rq_ac(pdu_type, &mut cursor, &codec),
        0x03 => {
            // A-ASSOCIATE-RJ: 1 reserved byte, result, source, reason/diag.
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let result = AssociationRJResult::from_code(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;
            let source = AssociationRJSource::from_codes(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;
            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF: a sequence of presentation data value items,
            // each a 4-byte length, context ID, message control header
            // (bit 0: command, bit 1: last fragment) and the fragment.
            let mut values = Vec::new();
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;
                let data =
                    read_n(&mut cursor, item_length as usize - 2).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }
            Ok(Pdu::PData { data: values })
        }
        0x05 => Ok(Pdu::ReleaseRQ),
        0x06 => Ok(Pdu::ReleaseRP),
        0x07 => {
            // A-ABORT: 2 reserved bytes, source, reason/diag.
            let mut reserved = [0u8; 2];
            cursor
                .read_exact(&mut reserved)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let source = AbortRQSource::from_codes(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reason/Diag" })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;
            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body.to_vec(),
        }),
    }
}

/// Decode the common body layout of A-ASSOCIATE-RQ and A-ASSOCIATE-AC:
/// protocol version, 2 reserved bytes, two 16-byte AE title fields,
/// 32 reserved bytes and a sequence of variable items.
fn read_associate_rq_ac(
    pdu_type: u8,
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<Pdu> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    cursor
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    // in the AC, the AE title fields are formally reserved,
    // but echo the request values; decode them on both
    let called_ae_title = read_ae_title(cursor, codec, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, codec, "Calling-AE-title")?;

    let mut reserved = [0u8; 32];
    cursor
        .read_exact(&mut reserved)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts_proposed = Vec::new();
    let mut presentation_contexts_results = Vec::new();
    let mut user_variables = Vec::new();

    while cursor.position() < cursor.get_ref().len() as u64 {
        match read_pdu_variable(cursor, codec)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextProposed(val) if pdu_type == 0x01 => {
                presentation_contexts_proposed.push(val);
            }
            PduVariableItem::PresentationContextResult(val) if pdu_type == 0x02 => {
                presentation_contexts_results.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            var_item => {
                return UnexpectedPduVariableSnafu { var_item }.fail();
            }
        }
    }

    let application_context_name =
        application_context_name.context(MissingApplicationContextNameSnafu)?;

    if pdu_type == 0x01 {
        Ok(Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts: presentation_contexts_proposed,
            user_variables,
        }))
    } else {
        Ok(Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts: presentation_contexts_results,
            user_variables,
        }))
    }
}

fn read_ae_title(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let mut ae_bytes = [0u8; 16];
    cursor
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::with_capacity(bytes_to_read.min(1 << 20));
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() != bytes_to_read {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(result)
}

fn read_uid<R>(
    reader: &mut R,
    length: usize,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn read_pdu_variable(cursor: &mut Cursor<&[u8]>, codec: &dyn TextCodec) -> Result<PduVariableItem> {
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(cursor, item_length as usize).context(ReadPduFieldSnafu {
        field: "Item contents",
    })?;
    let mut cursor = Cursor::new(&bytes[..]);

    match item_type {
        0x10 => {
            // Application Context Item
            let val = read_uid(
                &mut cursor,
                item_length as usize,
                codec,
                "Application-context-name",
            )?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item (proposed):
            // context ID, 3 reserved bytes, one abstract syntax sub-item
            // and one or more transfer syntax sub-items
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = Vec::new();

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            let mut reserved = [0u8; 3];
            cursor
                .read_exact(&mut reserved)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let sub_item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let sub_item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                match sub_item_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid(
                            &mut cursor,
                            sub_item_length as usize,
                            codec,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            sub_item_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item (result):
            // context ID, reserved, result/reason, reserved,
            // exactly one transfer syntax sub-item
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let reason = PresentationContextResultReason::from_code(
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Result/Reason",
                })?,
            )
            .context(InvalidPresentationContextResultReasonSnafu)?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            let mut transfer_syntax: Option<String> = None;
            while cursor.position() < cursor.get_ref().len() as u64 {
                let sub_item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let sub_item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                match sub_item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_uid(
                            &mut cursor,
                            sub_item_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information Item
            let mut user_variables = Vec::new();

            while cursor.position() < cursor.get_ref().len() as u64 {
                let sub_item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let sub_item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match sub_item_type {
                    0x51 => {
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        user_variables.push(UserVariableItem::ImplementationClassUID(read_uid(
                            &mut cursor,
                            sub_item_length as usize,
                            codec,
                            "Implementation-class-uid",
                        )?));
                    }
                    0x53 => {
                        let invoked =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        let performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        user_variables
                            .push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
                    }
                    0x54 => {
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid =
                            read_uid(&mut cursor, uid_length as usize, codec, "SOP-class-uid")?;
                        let scu_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCU-role" })?;
                        let scp_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCP-role" })?;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role: scu_role != 0,
                            scp_role: scp_role != 0,
                        }));
                    }
                    0x55 => {
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            read_uid(
                                &mut cursor,
                                sub_item_length as usize,
                                codec,
                                "Implementation-version-name",
                            )?,
                        ));
                    }
                    0x56 => {
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            sop_class_uid_length as usize,
                            codec,
                            "SOP-class-uid",
                        )?;
                        // the remaining bytes of the sub-item are the
                        // service class application information
                        let data_length = sub_item_length
                            .saturating_sub(2)
                            .saturating_sub(sop_class_uid_length);
                        let data =
                            read_n(&mut cursor, data_length as usize).context(ReadPduFieldSnafu {
                                field: "Service-class-application-information",
                            })?;
                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid,
                            data,
                        ));
                    }
                    0x57 => {
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            sop_class_uid_length as usize,
                            codec,
                            "SOP-class-uid",
                        )?;
                        let service_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-uid-length",
                            })?;
                        let service_class_uid = read_uid(
                            &mut cursor,
                            service_class_uid_length as usize,
                            codec,
                            "Service-class-uid",
                        )?;
                        let related_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification-length",
                            })?;
                        let mut related = Vec::new();
                        let related_end = cursor.position() + u64::from(related_length);
                        while cursor.position() < related_end {
                            let uid_length =
                                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                    field: "Related-general-sop-class-uid-length",
                                })?;
                            related.push(read_uid(
                                &mut cursor,
                                uid_length as usize,
                                codec,
                                "Related-general-sop-class-uid",
                            )?);
                        }
                        user_variables.push(
                            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                                SopClassCommonExtendedNegotiation {
                                    sop_class_uid,
                                    service_class_uid,
                                    related_general_sop_class_uids: related,
                                },
                            ),
                        );
                    }
                    0x58 => {
                        let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "User-Identity-type",
                        })?;
                        let positive_response_requested =
                            cursor.read_u8().context(ReadPduFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;
                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        let primary_field = read_n(&mut cursor, primary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        let secondary_field = read_n(&mut cursor, secondary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })?;

                        match UserIdentityType::from_code(user_identity_type) {
                            Some(identity_type) => {
                                user_variables.push(UserVariableItem::UserIdentityItem(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("Unknown user identity type code {}", user_identity_type);
                            }
                        }
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            sub_item_type,
                            read_n(&mut cursor, sub_item_length as usize).context(
                                ReadPduFieldSnafu {
                                    field: "Unknown sub-item",
                                },
                            )?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
