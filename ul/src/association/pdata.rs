//! Fragmentation and reassembly of presentation data value streams.
//!
//! A DIMSE message travels as two byte streams per presentation context,
//! one for the command set and one for the data set,
//! each chopped into presentation data values (PDVs)
//! that must fit the PDU size granted by the peer.

use std::collections::HashMap;

use crate::pdu::{PDataValue, PDataValueType, Pdu, PDV_HEADER_SIZE};

/// Split one command or data stream into P-DATA-TF PDUs.
///
/// Every produced PDU carries a single PDV whose payload is capped at
/// `max_pdu_length` minus the PDV header overhead,
/// with the is-last bit set on the final fragment.
/// An empty stream still produces one empty last fragment,
/// so that the receiving side sees the stream completed.
pub fn fragment_pdata(
    presentation_context_id: u8,
    value_type: PDataValueType,
    data: &[u8],
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let max_data_length = (max_pdu_length - PDV_HEADER_SIZE) as usize;

    if data.is_empty() {
        return vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        }];
    }

    let mut chunks = data.chunks(max_data_length).peekable();
    let mut pdus = Vec::with_capacity(data.len() / max_data_length + 1);
    while let Some(chunk) = chunks.next() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }],
        });
    }
    pdus
}

/// A command or data stream reassembled from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdvStream {
    /// the presentation context the stream belongs to
    pub presentation_context_id: u8,
    /// whether this is a command or a data stream
    pub value_type: PDataValueType,
    /// the concatenated stream contents
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct PendingStreams {
    command: Vec<u8>,
    data: Vec<u8>,
}

/// An accumulator concatenating inbound PDV fragments
/// into whole command and data streams,
/// independently per presentation context.
#[derive(Debug, Default)]
pub struct PDataAssembler {
    pending: HashMap<u8, PendingStreams>,
}

impl PDataAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        PDataAssembler::default()
    }

    /// Feed one PDV into the assembler.
    ///
    /// Returns the completed stream once a fragment
    /// with the is-last bit arrives.
    pub fn push(&mut self, mut pdv: PDataValue) -> Option<PdvStream> {
        let streams = self.pending.entry(pdv.presentation_context_id).or_default();
        let stream = match pdv.value_type {
            PDataValueType::Command => &mut streams.command,
            PDataValueType::Data => &mut streams.data,
        };
        stream.append(&mut pdv.data);

        if !pdv.is_last {
            return None;
        }
        Some(PdvStream {
            presentation_context_id: pdv.presentation_context_id,
            value_type: pdv.value_type,
            data: std::mem::take(stream),
        })
    }
}
