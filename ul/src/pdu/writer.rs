//! PDU encoding routines.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

/// An error encoding a PDU into its octet stream representation.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not write chunk of PDU `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(backtrace)]
        source: WriteChunkError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An error writing a length-prefixed chunk.
#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    // AE titles occupy exactly 16 bytes, space padded
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Encode a single PDU into `writer`.
///
/// The writer is expected to be an in-memory buffer;
/// this function performs no socket I/O.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            // 1 - PDU-type - 01H
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 - Called-AE-title
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;

                // 27-42 - Calling-AE-title
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                // 75-xxx - Variable items
                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            // 1 - PDU-type - 02H
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-42 - Reserved, echoing the AE titles of the request
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                // 75-xxx - Variable items
                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;

            Ok(())
        }
        Pdu::AssociationRJ { result, source } => {
            // 1 - PDU-type - 03H
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result: 1 rejected-permanent, 2 rejected-transient
                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu { field: "Result" })?;

                // 9 - Source, 10 - Reason/Diag.
                let (source_code, reason_code) = match source {
                    AssociationRJSource::ServiceUser(reason) => (
                        0x01,
                        match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                0x02
                            }
                            AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                            AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                            AssociationRJServiceUserReason::Reserved(code) => *code,
                        },
                    ),
                    AssociationRJSource::ServiceProviderAsce(reason) => (
                        0x02,
                        match reason {
                            AssociationRJServiceProviderAsceReason::NoReasonGiven => 0x01,
                            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => {
                                0x02
                            }
                        },
                    ),
                    AssociationRJSource::ServiceProviderPresentation(reason) => (
                        0x03,
                        match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                0x01
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                0x02
                            }
                            AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
                        },
                    ),
                };
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason_code).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            // 1 - PDU-type - 04H
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        // 5 - Presentation-context-ID
                        writer.push(presentation_data_value.presentation_context_id);

                        // 6 - Message control header:
                        // bit 0 set for command, bit 1 set for last fragment
                        let mut message_control_header = 0x00;
                        if presentation_data_value.value_type == PDataValueType::Command {
                            message_control_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_control_header |= 0x02;
                        }
                        writer.push(message_control_header);

                        // 7-xxx - Presentation-data-value
                        writer.extend_from_slice(&presentation_data_value.data);

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;

            Ok(())
        }
        Pdu::ReleaseRQ => {
            // 1 - PDU-type - 05H
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            // 3-6 - PDU-length, 7-10 - Reserved
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "PDU-length" })?;
            writer
                .write_all(&[0; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })?;

            Ok(())
        }
        Pdu::ReleaseRP => {
            // 1 - PDU-type - 06H
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            // 3-6 - PDU-length, 7-10 - Reserved
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "PDU-length" })?;
            writer
                .write_all(&[0; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })?;

            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // 1 - PDU-type - 07H
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Reserved
                writer
                    .write_all(&[0; 2])
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 9 - Source, 10 - Reason/Diag
                let (source_code, reason_code) = match source {
                    AbortRQSource::ServiceUser => (0x00, 0x00),
                    AbortRQSource::Reserved => (0x01, 0x00),
                    AbortRQSource::ServiceProvider(reason) => (
                        0x02,
                        match reason {
                            AbortRQServiceProviderReason::ReasonNotSpecified => 0x00,
                            AbortRQServiceProviderReason::UnrecognizedPdu => 0x01,
                            AbortRQServiceProviderReason::UnexpectedPdu => 0x02,
                            AbortRQServiceProviderReason::Reserved => 0x03,
                            AbortRQServiceProviderReason::UnrecognizedPduParameter => 0x04,
                            AbortRQServiceProviderReason::UnexpectedPduParameter => 0x05,
                            AbortRQServiceProviderReason::InvalidPduParameter => 0x06,
                        },
                    ),
                };
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason_code).context(WriteFieldSnafu {
                    field: "Reason/Diag",
                })?;

                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            // carried through verbatim
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(data.len() as u32)
                .context(WriteFieldSnafu { field: "PDU-length" })?;
            writer
                .write_all(data)
                .context(WriteFieldSnafu { field: "Unknown" })?;

            Ok(())
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 10H
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        let bytes = codec
            .encode(application_context_name)
            .context(EncodeFieldSnafu {
                field: "Application-context-name",
            })?;
        writer.extend_from_slice(&bytes);
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 20H
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer.push(presentation_context.id);

        // 6-8 - Reserved
        writer.extend_from_slice(&[0; 3]);

        // 9-xxx - Abstract syntax sub-item
        writer.push(0x30);
        writer.push(0x00);
        write_chunk_u16(writer, |writer| {
            let bytes = codec
                .encode(&presentation_context.abstract_syntax)
                .context(EncodeFieldSnafu {
                    field: "Abstract-syntax-name",
                })?;
            writer.extend_from_slice(&bytes);
            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        // Transfer syntax sub-items
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer.push(0x40);
            writer.push(0x00);
            write_chunk_u16(writer, |writer| {
                let bytes = codec.encode(transfer_syntax).context(EncodeFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
                writer.extend_from_slice(&bytes);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax Sub-Item",
            })?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 21H
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer.push(presentation_context.id);

        // 6 - Reserved
        writer.push(0x00);

        // 7 - Result/Reason
        writer.push(presentation_context.reason as u8);

        // 8 - Reserved
        writer.push(0x00);

        // 9-xxx - Transfer syntax sub-item
        writer.push(0x40);
        writer.push(0x00);
        write_chunk_u16(writer, |writer| {
            let bytes = codec
                .encode(&presentation_context.transfer_syntax)
                .context(EncodeFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
            writer.extend_from_slice(&bytes);
            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax Sub-Item",
        })?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // 1 - Item-type - 50H
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // 1 - Item-type - 51H
                    writer.push(0x51);
                    writer.push(0x00);
                    write_chunk_u16(writer, |writer| {
                        writer.extend_from_slice(&max_length.to_be_bytes());
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum Length Sub-Item",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    // 1 - Item-type - 52H
                    writer.push(0x52);
                    writer.push(0x00);
                    write_chunk_u16(writer, |writer| {
                        let bytes =
                            codec
                                .encode(implementation_class_uid)
                                .context(EncodeFieldSnafu {
                                    field: "Implementation-class-uid",
                                })?;
                        writer.extend_from_slice(&bytes);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Class UID Sub-Item",
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_ops_invoked,
                    max_ops_performed,
                } => {
                    // 1 - Item-type - 53H
                    writer.push(0x53);
                    writer.push(0x00);
                    write_chunk_u16(writer, |writer| {
                        writer.extend_from_slice(&max_ops_invoked.to_be_bytes());
                        writer.extend_from_slice(&max_ops_performed.to_be_bytes());
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous Operations Window Sub-Item",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    // 1 - Item-type - 55H
                    writer.push(0x55);
                    writer.push(0x00);
                    write_chunk_u16(writer, |writer| {
                        let bytes = codec.encode(implementation_version_name).context(
                            EncodeFieldSnafu {
                                field: "Implementation-version-name",
                            },
                        )?;
                        writer.extend_from_slice(&bytes);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Version Name Sub-Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer.push(*item_type);
                    writer.push(0x00);
                    write_chunk_u16(writer, |writer| {
                        writer.extend_from_slice(data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Unknown Sub-Item",
                    })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "User Information Item",
    })
}

#[cfg(test)]
mod tests {
    use super::write_pdu;
    use crate::pdu::{read_pdu, Pdu, DEFAULT_MAX_PDU};
    use std::io::Cursor;

    #[test]
    fn release_pdus_are_fixed_size() {
        for (pdu, pdu_type) in [(Pdu::ReleaseRQ, 0x05), (Pdu::ReleaseRP, 0x06)] {
            let mut bytes = Vec::new();
            write_pdu(&mut bytes, &pdu).unwrap();
            assert_eq!(bytes.len(), 10);
            assert_eq!(bytes[0], pdu_type);
            let same = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap();
            assert_eq!(same, pdu);
        }
    }
}
