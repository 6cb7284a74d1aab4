//! PDU decoding routines.
//!
//! Decoding happens in two stages:
//! [`read_pdu`] pulls the six-octet header and the announced payload
//! from a reader, and the payload is then interpreted in memory
//! by a small forward-only scanner over the raw octets.
//! No socket I/O happens here;
//! callers hand in framed buffers
//! (see [`Connection`](crate::connection::Connection)).

use std::io::{ErrorKind, Read};

use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, IntoError, OptionExt, Snafu};

use crate::pdu::{
    AbortRQSource, AssociationRJResult, AssociationRJSource, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};

/// An error decoding a PDU from its octet stream representation.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The stream ended cleanly before any part of a PDU arrived.
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display(
        "admissible maximum PDU length {} is outside the protocol bounds",
        max_pdu_length
    ))]
    MaxPduOutOfBounds {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU of {} bytes exceeds the admissible maximum of {}",
        pdu_length,
        max_pdu_length
    ))]
    OverlongPdu {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read {}", subject))]
    ReadFailed {
        subject: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU data ended early while decoding {}", subject))]
    Truncated {
        subject: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("could not decode text field {}", subject))]
    DecodeText {
        subject: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("unexpected item {:#04X} within {}", item_type, within))]
    UnexpectedItem {
        item_type: u8,
        within: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unrecognized {} code {:#06X}", field, code))]
    UnrecognizedCode {
        field: &'static str,
        code: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("required field {} is missing", field))]
    MissingField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("{} may only appear once", field))]
    DuplicateField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation data value of {} bytes is too short", length))]
    MalformedPdv { length: u32, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode a single PDU from `reader`.
///
/// `max_pdu_length` bounds the announced PDU length.
/// In strict mode an over-long PDU is an error;
/// otherwise lengths up to [`MAXIMUM_PDU_SIZE`] are tolerated
/// with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        MaxPduOutOfBoundsSnafu { max_pdu_length }
    );

    // probing the type and reserved octets first tells an idle stream
    // apart from one that was cut mid-PDU
    let mut head = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut head) {
        return if e.kind() == ErrorKind::UnexpectedEof {
            NoPduAvailableSnafu.fail()
        } else {
            Err(ReadFailedSnafu {
                subject: "PDU header",
            }
            .into_error(e))
        };
    }

    let mut length_octets = [0u8; 4];
    read_all(reader, &mut length_octets, "PDU length")?;
    let pdu_length = u32::from_be_bytes(length_octets);

    let admissible = if strict { max_pdu_length } else { MAXIMUM_PDU_SIZE };
    ensure!(
        pdu_length <= admissible,
        OverlongPduSnafu {
            pdu_length,
            max_pdu_length: admissible,
        }
    );
    if !strict && pdu_length > max_pdu_length {
        tracing::warn!(
            "tolerating PDU of {} bytes above the negotiated maximum of {}",
            pdu_length,
            max_pdu_length
        );
    }

    let mut payload = vec![0u8; pdu_length as usize];
    read_all(reader, &mut payload, "PDU payload")?;

    decode_pdu(head[0], &payload)
}

fn read_all<R>(reader: &mut R, buffer: &mut [u8], subject: &'static str) -> Result<()>
where
    R: Read,
{
    reader.read_exact(buffer).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TruncatedSnafu { subject }.build()
        } else {
            ReadFailedSnafu { subject }.into_error(e)
        }
    })
}

fn decode_pdu(pdu_type: u8, payload: &[u8]) -> Result<Pdu> {
    match pdu_type {
        // A-ASSOCIATE-RQ and -AC share their fixed header layout
        0x01 | 0x02 => decode_associate(pdu_type, payload),
        0x03 => decode_reject(payload),
        0x04 => decode_pdata(payload),
        0x05 => Ok(Pdu::ReleaseRQ),
        0x06 => Ok(Pdu::ReleaseRP),
        0x07 => decode_abort(payload),
        other => Ok(Pdu::Unknown {
            pdu_type: other,
            data: payload.to_vec(),
        }),
    }
}

fn decode_associate(pdu_type: u8, payload: &[u8]) -> Result<Pdu> {
    let mut scan = Scanner::new(payload);

    let protocol_version = scan.u16("Protocol-version")?;
    scan.skip(2, "reserved octets")?;
    let called_ae_title = scan.ae_title("Called-AE-title")?;
    let calling_ae_title = scan.ae_title("Calling-AE-title")?;
    scan.skip(32, "reserved octets")?;

    let within = if pdu_type == 0x01 {
        "A-ASSOCIATE-RQ"
    } else {
        "A-ASSOCIATE-AC"
    };
    let mut application_context_name = None;
    let mut proposed = Vec::new();
    let mut results = Vec::new();
    let mut user_variables = Vec::new();

    while !scan.is_empty() {
        let (item_type, body) = scan.item("variable item")?;
        match item_type {
            0x10 => {
                application_context_name =
                    Some(decode_uid(body, "Application-context-name")?);
            }
            0x20 if pdu_type == 0x01 => proposed.push(decode_proposed_context(body)?),
            0x21 if pdu_type == 0x02 => results.push(decode_context_result(body)?),
            0x50 => user_variables = decode_user_information(body)?,
            other => {
                return UnexpectedItemSnafu {
                    item_type: other,
                    within,
                }
                .fail();
            }
        }
    }

    let application_context_name = application_context_name.context(MissingFieldSnafu {
        field: "Application-context-name",
    })?;

    if pdu_type == 0x01 {
        Ok(Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts: proposed,
            user_variables,
        })
    } else {
        Ok(Pdu::AssociationAC {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts: results,
            user_variables,
        })
    }
}

fn decode_proposed_context(body: &[u8]) -> Result<PresentationContextProposed> {
    let mut scan = Scanner::new(body);
    let id = scan.u8("Presentation-context-ID")?;
    scan.skip(3, "reserved octets")?;

    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();
    while !scan.is_empty() {
        let (item_type, item) = scan.item("presentation context sub-item")?;
        match item_type {
            0x30 => abstract_syntax = Some(decode_uid(item, "Abstract-syntax-name")?),
            0x40 => transfer_syntaxes.push(decode_uid(item, "Transfer-syntax-name")?),
            other => {
                return UnexpectedItemSnafu {
                    item_type: other,
                    within: "proposed presentation context",
                }
                .fail();
            }
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax.context(MissingFieldSnafu {
            field: "Abstract-syntax-name",
        })?,
        transfer_syntaxes,
    })
}

fn decode_context_result(body: &[u8]) -> Result<PresentationContextResult> {
    let mut scan = Scanner::new(body);
    let id = scan.u8("Presentation-context-ID")?;
    scan.skip(1, "reserved octet")?;
    let reason_code = scan.u8("Result/Reason")?;
    let reason = PresentationContextResultReason::from(reason_code).context(
        UnrecognizedCodeSnafu {
            field: "Result/Reason",
            code: u16::from(reason_code),
        },
    )?;
    scan.skip(1, "reserved octet")?;

    let mut transfer_syntax = None;
    while !scan.is_empty() {
        let (item_type, item) = scan.item("presentation context sub-item")?;
        match item_type {
            0x40 => {
                ensure!(
                    transfer_syntax.is_none(),
                    DuplicateFieldSnafu {
                        field: "Transfer-syntax-name",
                    }
                );
                transfer_syntax = Some(decode_uid(item, "Transfer-syntax-name")?);
            }
            other => {
                return UnexpectedItemSnafu {
                    item_type: other,
                    within: "presentation context result",
                }
                .fail();
            }
        }
    }

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax: transfer_syntax.context(MissingFieldSnafu {
            field: "Transfer-syntax-name",
        })?,
    })
}

fn decode_user_information(body: &[u8]) -> Result<Vec<UserVariableItem>> {
    let mut scan = Scanner::new(body);
    let mut items = Vec::new();
    while !scan.is_empty() {
        let (item_type, body) = scan.item("user information sub-item")?;
        let item = match item_type {
            0x51 => {
                let mut sub = Scanner::new(body);
                UserVariableItem::MaxLength(sub.u32("Maximum-length-received")?)
            }
            0x52 => UserVariableItem::ImplementationClassUID(decode_uid(
                body,
                "Implementation-class-uid",
            )?),
            0x53 => {
                let mut sub = Scanner::new(body);
                UserVariableItem::AsyncOperationsWindow {
                    max_ops_invoked: sub.u16("Maximum-number-operations-invoked")?,
                    max_ops_performed: sub.u16("Maximum-number-operations-performed")?,
                }
            }
            0x55 => UserVariableItem::ImplementationVersionName(decode_uid(
                body,
                "Implementation-version-name",
            )?),
            other => UserVariableItem::Unknown(other, body.to_vec()),
        };
        items.push(item);
    }
    Ok(items)
}

fn decode_reject(payload: &[u8]) -> Result<Pdu> {
    let mut scan = Scanner::new(payload);
    scan.skip(1, "reserved octet")?;
    let result_code = scan.u8("Result")?;
    let result = AssociationRJResult::from(result_code).context(UnrecognizedCodeSnafu {
        field: "Result",
        code: u16::from(result_code),
    })?;
    let source_code = scan.u8("Source")?;
    let reason_code = scan.u8("Reason/Diag.")?;
    let source =
        AssociationRJSource::from(source_code, reason_code).context(UnrecognizedCodeSnafu {
            field: "Source/Reason",
            code: u16::from_be_bytes([source_code, reason_code]),
        })?;
    Ok(Pdu::AssociationRJ { result, source })
}

fn decode_abort(payload: &[u8]) -> Result<Pdu> {
    let mut scan = Scanner::new(payload);
    scan.skip(2, "reserved octets")?;
    let source_code = scan.u8("Source")?;
    let reason_code = scan.u8("Reason/Diag")?;
    let source = AbortRQSource::from(source_code, reason_code).context(UnrecognizedCodeSnafu {
        field: "Source/Reason",
        code: u16::from_be_bytes([source_code, reason_code]),
    })?;
    Ok(Pdu::AbortRQ { source })
}

fn decode_pdata(payload: &[u8]) -> Result<Pdu> {
    let mut scan = Scanner::new(payload);
    let mut values = Vec::new();
    while !scan.is_empty() {
        let length = scan.u32("Item-length")?;
        ensure!(length >= 2, MalformedPdvSnafu { length });
        let body = scan.take(length as usize, "Presentation-data-value")?;

        // the first two octets are the presentation context ID
        // and the message control header;
        // bit 0 of the latter marks a command fragment,
        // bit 1 the last fragment of its stream
        let control = body[1];
        values.push(PDataValue {
            presentation_context_id: body[0],
            value_type: if control & 0x01 != 0 {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            },
            is_last: control & 0x02 != 0,
            data: body[2..].to_vec(),
        });
    }
    Ok(Pdu::PData { data: values })
}

fn decode_text(octets: &[u8], subject: &'static str) -> Result<String> {
    DefaultCharacterSetCodec
        .decode(octets)
        .map_err(|e| DecodeTextSnafu { subject }.into_error(e))
}

/// Decode a UID field, stripping even-length padding.
fn decode_uid(octets: &[u8], subject: &'static str) -> Result<String> {
    Ok(decode_text(octets, subject)?
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string())
}

/// A forward-only view over raw PDU octets.
///
/// All multi-octet integers in the upper layer protocol are big endian.
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(octets: &'a [u8]) -> Self {
        Scanner { rest: octets }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn take(&mut self, count: usize, subject: &'static str) -> Result<&'a [u8]> {
        ensure!(self.rest.len() >= count, TruncatedSnafu { subject });
        let (taken, rest) = self.rest.split_at(count);
        self.rest = rest;
        Ok(taken)
    }

    fn skip(&mut self, count: usize, subject: &'static str) -> Result<()> {
        self.take(count, subject).map(|_| ())
    }

    fn u8(&mut self, subject: &'static str) -> Result<u8> {
        Ok(self.take(1, subject)?[0])
    }

    fn u16(&mut self, subject: &'static str) -> Result<u16> {
        let octets = self.take(2, subject)?;
        Ok(u16::from_be_bytes([octets[0], octets[1]]))
    }

    fn u32(&mut self, subject: &'static str) -> Result<u32> {
        let octets = self.take(4, subject)?;
        Ok(u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]))
    }

    /// Read one `{type, reserved, u16 length, body}` item,
    /// yielding the item type and its body octets.
    fn item(&mut self, subject: &'static str) -> Result<(u8, &'a [u8])> {
        let item_type = self.u8(subject)?;
        self.skip(1, subject)?;
        let length = self.u16(subject)? as usize;
        Ok((item_type, self.take(length, subject)?))
    }

    /// Read a 16-octet space-padded AE title field.
    fn ae_title(&mut self, subject: &'static str) -> Result<String> {
        let octets = self.take(16, subject)?;
        Ok(decode_text(octets, subject)?.trim().to_string())
    }
}
