//! PDU encoding into length-prefixed binary frames.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("failed to build chunk"))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("failed to write chunk length"))]
    WriteChunkLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("failed to write chunk data"))]
    WriteChunkData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Run `func` against a temporary buffer,
/// then write the buffer's length as a big endian `u32`
/// followed by the buffer itself.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteChunkLengthSnafu)?;
    writer.write_all(&data).context(WriteChunkDataSnafu)?;
    Ok(())
}

/// Same as [`write_chunk_u32`], with a `u16` length prefix.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteChunkLengthSnafu)?;
    writer.write_all(&data).context(WriteChunkDataSnafu)?;
    Ok(())
}

/// Encode the given PDU into its binary frame format.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_pdu_header(writer, 0x01)?;
            write_chunk_u32(writer, |writer| {
                write_associate_header(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                    &codec,
                )?;
                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_pdu_header(writer, 0x02)?;
            write_chunk_u32(writer, |writer| {
                // the AE title fields are reserved in the AC,
                // but shall echo the values received in the request
                write_associate_header(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                    &codec,
                )?;
                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_pdu_header(writer, 0x03)?;
            write_chunk_u32(writer, |writer| {
                let (source_code, reason_code) = source.codes();
                writer
                    .write_all(&[0x00, *result as u8, source_code, reason_code])
                    .context(WriteFieldSnafu {
                        field: "Result/Source/Reason",
                    })
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })
        }
        Pdu::PData { data } => {
            write_pdu_header(writer, 0x04)?;
            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        let mut header = 0x00u8;
                        if let PDataValueType::Command = pdv.value_type {
                            header |= 0x01;
                        }
                        if pdv.is_last {
                            header |= 0x02;
                        }
                        writer
                            .write_all(&[pdv.presentation_context_id, header])
                            .context(WriteFieldSnafu {
                                field: "Presentation-data-value header",
                            })?;
                        writer.write_all(&pdv.data).context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })
        }
        Pdu::ReleaseRQ => {
            write_pdu_header(writer, 0x05)?;
            write_chunk_u32(writer, |writer| {
                writer.write_all(&[0u8; 4]).context(WriteFieldSnafu {
                    field: "A-RELEASE-RQ data",
                })
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })
        }
        Pdu::ReleaseRP => {
            write_pdu_header(writer, 0x06)?;
            write_chunk_u32(writer, |writer| {
                writer.write_all(&[0u8; 4]).context(WriteFieldSnafu {
                    field: "A-RELEASE-RP data",
                })
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })
        }
        Pdu::AbortRQ { source } => {
            write_pdu_header(writer, 0x07)?;
            write_chunk_u32(writer, |writer| {
                let (source_code, reason_code) = source.codes();
                writer
                    .write_all(&[0x00, 0x00, source_code, reason_code])
                    .context(WriteFieldSnafu {
                        field: "Source/Reason",
                    })
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })
        }
        Pdu::Unknown { pdu_type, data } => {
            write_pdu_header(writer, *pdu_type)?;
            write_chunk_u32(writer, |writer| {
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Unknown data",
                })
            })
            .context(WriteChunkSnafu { name: "Unknown" })
        }
    }
}

/// Write the PDU type code and the reserved byte.
fn write_pdu_header(writer: &mut dyn Write, pdu_type: u8) -> Result<()> {
    writer
        .write_all(&[pdu_type, 0x00])
        .context(WriteFieldSnafu { field: "PDU-type" })
}

/// Write the fixed portion of A-ASSOCIATE-RQ/AC bodies:
/// protocol version, 2 reserved bytes,
/// the two 16-byte space-padded AE title fields,
/// and 32 reserved bytes.
fn write_associate_header(
    writer: &mut dyn Write,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteFieldSnafu { field: "Reserved" })?;

    for (title, field) in [
        (called_ae_title, "Called-AE-title"),
        (calling_ae_title, "Calling-AE-title"),
    ] {
        let mut ae_title_bytes = codec.encode(title).context(EncodeFieldSnafu { field })?;
        ae_title_bytes.resize(16, b' ');
        writer
            .write_all(&ae_title_bytes)
            .context(WriteFieldSnafu { field })?;
    }

    writer
        .write_all(&[0u8; 32])
        .context(WriteFieldSnafu { field: "Reserved" })
}

/// Encode a UID value, NUL-padded to even length.
fn encode_uid(uid: &str, codec: &dyn TextCodec, field: &'static str) -> Result<Vec<u8>> {
    let mut bytes = codec.encode(uid).context(EncodeFieldSnafu { field })?;
    if bytes.len() % 2 != 0 {
        bytes.push(b'\0');
    }
    Ok(bytes)
}

fn write_sub_item_header(writer: &mut dyn Write, item_type: u8) -> Result<()> {
    writer
        .write_all(&[item_type, 0x00])
        .context(WriteFieldSnafu { field: "Item-type" })
}

fn write_uid_item(
    writer: &mut dyn Write,
    item_type: u8,
    uid: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    write_sub_item_header(writer, item_type)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&encode_uid(uid, codec, field)?)
            .context(WriteFieldSnafu { field })
    })
    .context(WriteChunkSnafu { name: "UID item" })
}

fn write_application_context(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_uid_item(
        writer,
        0x10,
        application_context_name,
        codec,
        "Application-context-name",
    )
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_sub_item_header(writer, 0x20)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&[presentation_context.id, 0x00, 0x00, 0x00])
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        write_uid_item(
            writer,
            0x30,
            &presentation_context.abstract_syntax,
            codec,
            "Abstract-syntax-name",
        )?;
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_uid_item(writer, 0x40, transfer_syntax, codec, "Transfer-syntax-name")?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context item",
    })
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_sub_item_header(writer, 0x21)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&[
                presentation_context.id,
                0x00,
                presentation_context.reason as u8,
                0x00,
            ])
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID/Result",
            })?;

        // the transfer syntax sub-item is only significant on acceptance,
        // but is always present in the frame
        write_uid_item(
            writer,
            0x40,
            &presentation_context.transfer_syntax,
            codec,
            "Transfer-syntax-name",
        )
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context result item",
    })
}

fn write_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_sub_item_header(writer, 0x50)?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    write_sub_item_header(writer, 0x51)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum-length-received",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    write_uid_item(writer, 0x52, uid, codec, "Implementation-class-uid")?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    write_sub_item_header(writer, 0x53)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous Operations Window",
                    })?;
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    write_sub_item_header(writer, 0x54)?;
                    write_chunk_u16(writer, |writer| {
                        let uid =
                            encode_uid(&role_selection.sop_class_uid, codec, "SOP-class-uid")?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_all(&[
                                role_selection.scu_role as u8,
                                role_selection.scp_role as u8,
                            ])
                            .context(WriteFieldSnafu {
                                field: "SCU-role/SCP-role",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Role Selection",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_sub_item_header(writer, 0x55)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&codec.encode(name).context(EncodeFieldSnafu {
                                field: "Implementation-version-name",
                            })?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-version-name",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-version-name",
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    write_sub_item_header(writer, 0x56)?;
                    write_chunk_u16(writer, |writer| {
                        let uid = encode_uid(sop_class_uid, codec, "SOP-class-uid")?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Service-class-application-information",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP Class Extended Negotiation",
                    })?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(item) => {
                    write_sub_item_header(writer, 0x57)?;
                    write_chunk_u16(writer, |writer| {
                        for (uid, length_field, field) in [
                            (
                                &item.sop_class_uid,
                                "SOP-class-uid-length",
                                "SOP-class-uid",
                            ),
                            (
                                &item.service_class_uid,
                                "Service-class-uid-length",
                                "Service-class-uid",
                            ),
                        ] {
                            let uid = encode_uid(uid, codec, field)?;
                            writer
                                .write_u16::<BigEndian>(uid.len() as u16)
                                .context(WriteFieldSnafu { field: length_field })?;
                            writer.write_all(&uid).context(WriteFieldSnafu { field })?;
                        }
                        write_chunk_u16(writer, |writer| {
                            for related in &item.related_general_sop_class_uids {
                                let uid = encode_uid(
                                    related,
                                    codec,
                                    "Related-general-sop-class-uid",
                                )?;
                                writer
                                    .write_u16::<BigEndian>(uid.len() as u16)
                                    .context(WriteFieldSnafu {
                                        field: "Related-general-sop-class-uid-length",
                                    })?;
                                writer.write_all(&uid).context(WriteFieldSnafu {
                                    field: "Related-general-sop-class-uid",
                                })?;
                            }
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "Related general SOP class identification",
                        })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP Class Common Extended Negotiation",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    write_sub_item_header(writer, 0x58)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&[
                                user_identity.identity_type().code(),
                                user_identity.positive_response_requested() as u8,
                            ])
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.primary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.primary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.secondary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.secondary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_sub_item_header(writer, *item_type)?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Unknown sub-item data",
                        })
                    })
                    .context(WriteChunkSnafu { name: "Unknown" })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() {
        let mut bytes = Vec::new();
        write_chunk_u32(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .unwrap();

        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() {
        let mut bytes = Vec::new();
        write_chunk_u16(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .unwrap();

        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
    }

    #[test]
    fn uids_are_padded_to_even_length() {
        let codec = DefaultCharacterSetCodec;
        let bytes = encode_uid("1.2.840.10008.1.1", &codec, "Abstract-syntax-name").unwrap();
        assert_eq!(bytes.len() % 2, 0);
        assert_eq!(bytes.last(), Some(&b'\0'));

        let bytes = encode_uid("1.2.840.10008.1.2", &codec, "Transfer-syntax-name").unwrap();
        assert_eq!(bytes, b"1.2.840.10008.1.2\0");
    }
}
