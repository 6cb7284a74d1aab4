//! Assembly and disassembly of DIMSE messages.
//!
//! A DIMSE message is a command set followed by an optional data set,
//! each traveling as a fragmented presentation data value stream
//! within P-DATA-TF PDUs.
//! [`message_pdus`] turns a message into wire-ready PDUs
//! and [`MessageAssembler`] rebuilds inbound messages
//! from the fragments of the peer.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_encoding::TransferSyntax;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::trace;

use radlink_ul::association::pdata::{fragment_pdata, PDataAssembler};
use radlink_ul::pdu::{PDataValue, PDataValueType, Pdu, PresentationContextNegotiated};

use crate::command::DATA_SET_MISSING;

/// An error encoding an outbound DIMSE message.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EncodeError {
    /// failed to encode command set
    WriteCommand { source: dicom_object::WriteError },

    /// failed to encode data set
    WriteData { source: dicom_object::WriteError },

    #[snafu(display("unknown transfer syntax `{}`", uid))]
    UnknownTransferSyntax { uid: String },
}

/// An error reassembling an inbound DIMSE message.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AssembleError {
    /// failed to decode command set
    ReadCommand { source: dicom_object::ReadError },

    /// failed to decode data set
    ReadData { source: dicom_object::ReadError },

    /// received fragments out of order
    OutOfOrder,

    #[snafu(display("unknown transfer syntax `{}`", uid))]
    UnknownInboundTransferSyntax { uid: String },

    #[snafu(display("no presentation context with id {}", id))]
    NoPresentationContext { id: u8 },
}

/// A DICOM message composed of a command set
/// followed by an optional data set.
pub struct DicomMessage {
    /// the command set
    pub command: InMemDicomObject,
    /// the data set, when the command announces one
    pub data: Option<InMemDicomObject>,
    /// the presentation context the message arrived or leaves on
    pub presentation_context_id: u8,
}

impl Debug for DicomMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.data.is_some() {
            write!(f, "DicomMessage {{ command, data }}")
        } else {
            write!(f, "DicomMessage {{ command }}")
        }
    }
}

/// Encode a command set and an optional data set into P-DATA-TF PDUs
/// sized to the PDU length granted by the peer.
///
/// The command set is always encoded in _Implicit VR Little Endian_;
/// the data set uses the transfer syntax
/// negotiated for the presentation context.
pub fn message_pdus(
    command: &InMemDicomObject,
    data: Option<&InMemDicomObject>,
    transfer_syntax: &TransferSyntax,
    presentation_context_id: u8,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>, EncodeError> {
    let mut command_bytes = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut command_bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(WriteCommandSnafu)?;

    let mut pdus = fragment_pdata(
        presentation_context_id,
        PDataValueType::Command,
        &command_bytes,
        max_pdu_length,
    );

    if let Some(data) = data {
        let mut data_bytes = Vec::new();
        data.write_dataset_with_ts(&mut data_bytes, transfer_syntax)
            .context(WriteDataSnafu)?;
        pdus.extend(fragment_pdata(
            presentation_context_id,
            PDataValueType::Data,
            &data_bytes,
            max_pdu_length,
        ));
    }

    Ok(pdus)
}

/// An incremental reassembler of inbound DIMSE messages.
///
/// Fragments are concatenated per presentation context;
/// once a command set is complete,
/// its `(0000,0800)` element decides whether a data set stream
/// must complete before the message is delivered.
pub struct MessageAssembler {
    streams: PDataAssembler,
    pending_commands: HashMap<u8, InMemDicomObject>,
    transfer_syntaxes: HashMap<u8, String>,
}

impl MessageAssembler {
    /// Create an assembler for an association
    /// with the given negotiated presentation contexts.
    pub fn new(presentation_contexts: &[PresentationContextNegotiated]) -> Self {
        MessageAssembler {
            streams: PDataAssembler::new(),
            pending_commands: HashMap::new(),
            transfer_syntaxes: presentation_contexts
                .iter()
                .map(|pc| (pc.id, pc.transfer_syntax.clone()))
                .collect(),
        }
    }

    /// Feed one inbound PDV into the assembler,
    /// yielding a message once both its streams are complete.
    pub fn push_pdv(&mut self, pdv: PDataValue) -> Result<Option<DicomMessage>, AssembleError> {
        let Some(stream) = self.streams.push(pdv) else {
            return Ok(None);
        };
        let context_id = stream.presentation_context_id;

        match stream.value_type {
            PDataValueType::Command => {
                trace!(context_id, "command stream complete");
                if self.pending_commands.contains_key(&context_id) {
                    // a second command set may not start
                    // before the previous data set finished
                    return Err(AssembleError::OutOfOrder);
                }
                let command = InMemDicomObject::read_dataset_with_ts(
                    stream.data.as_slice(),
                    &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                )
                .context(ReadCommandSnafu)?;

                let has_data_set = command
                    .get(tags::COMMAND_DATA_SET_TYPE)
                    .map(InMemElement::to_int::<u16>)
                    .and_then(Result::ok)
                    .is_some_and(|value| value != DATA_SET_MISSING);

                if has_data_set {
                    self.pending_commands.insert(context_id, command);
                    Ok(None)
                } else {
                    Ok(Some(DicomMessage {
                        command,
                        data: None,
                        presentation_context_id: context_id,
                    }))
                }
            }
            PDataValueType::Data => {
                trace!(context_id, "data stream complete");
                let command = self
                    .pending_commands
                    .remove(&context_id)
                    .ok_or(AssembleError::OutOfOrder)?;

                let ts_uid = self
                    .transfer_syntaxes
                    .get(&context_id)
                    .context(NoPresentationContextSnafu { id: context_id })?;
                let transfer_syntax = TransferSyntaxRegistry.get(ts_uid).context(
                    UnknownInboundTransferSyntaxSnafu {
                        uid: ts_uid.clone(),
                    },
                )?;

                let data =
                    InMemDicomObject::read_dataset_with_ts(stream.data.as_slice(), transfer_syntax)
                        .context(ReadDataSnafu)?;

                Ok(Some(DicomMessage {
                    command,
                    data: Some(data),
                    presentation_context_id: context_id,
                }))
            }
        }
    }
}
