//! DICOM association module
//!
//! This module implements the client side of the upper layer protocol
//! state machine: requesting an association,
//! exchanging presentation data,
//! and ending the session through release or abort.
//!
//! The [`client`] module provides the association builder and session
//! object, and [`pdata`] the fragmentation and reassembly of
//! presentation data value streams.

pub mod client;
pub mod pdata;
pub(crate) mod uid;

use crate::pdu::Pdu;

/// The state of an association as seen by the requestor.
///
/// An association starts [`Idle`](AssociationState::Idle),
/// moves through [`Requesting`](AssociationState::Requesting)
/// while negotiation is underway,
/// and spends its useful life in
/// [`Established`](AssociationState::Established).
/// The terminal states are
/// [`Rejected`](AssociationState::Rejected),
/// [`Closed`](AssociationState::Closed)
/// and [`Aborted`](AssociationState::Aborted);
/// no transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// no association activity yet
    Idle,
    /// an A-ASSOCIATE-RQ was sent, awaiting the peer's verdict
    Requesting,
    /// the association is established and may carry presentation data
    Established,
    /// an A-RELEASE-RQ was sent, awaiting the peer's reply
    Releasing,
    /// the peer rejected the association (terminal)
    Rejected,
    /// the association ended through an orderly release (terminal)
    Closed,
    /// the association was aborted by either side (terminal)
    Aborted,
}

impl AssociationState {
    /// Whether the association is in a live (non-terminal) state
    /// past the idle stage.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AssociationState::Requesting
                | AssociationState::Established
                | AssociationState::Releasing
        )
    }

    /// Whether the association reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssociationState::Rejected | AssociationState::Closed | AssociationState::Aborted
        )
    }

    /// The state which receiving the given PDU moves this state into,
    /// or `None` if the PDU is not acceptable in this state
    /// (upon which the association must be aborted
    /// with reason _unexpected PDU_).
    pub fn on_pdu(self, pdu: &Pdu) -> Option<AssociationState> {
        use AssociationState::*;
        match (self, pdu) {
            // any live state accepts an abort from the peer
            (Requesting | Established | Releasing, Pdu::AbortRQ { .. }) => Some(Aborted),
            (Requesting, Pdu::AssociationAC { .. }) => Some(Established),
            (Requesting, Pdu::AssociationRJ { .. }) => Some(Rejected),
            (Established, Pdu::PData { .. }) => Some(Established),
            // presentation data may still arrive while a release
            // initiated by us is in flight
            (Releasing, Pdu::PData { .. }) => Some(Releasing),
            (Releasing, Pdu::ReleaseRP) => Some(Closed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AssociationState;
    use crate::pdu::{AbortRQSource, PDataValue, PDataValueType, Pdu};
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

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

    fn abort() -> Pdu {
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let state = AssociationState::Requesting;
        let state = state
            .on_pdu(&Pdu::AssociationAC {
                protocol_version: 1,
                called_ae_title: "THEM".to_string(),
                calling_ae_title: "US".to_string(),
                application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
                presentation_contexts: vec![],
                user_variables: vec![],
            })
            .unwrap();
        assert_eq!(state, AssociationState::Established);
        let state = state.on_pdu(&pdata()).unwrap();
        assert_eq!(state, AssociationState::Established);
        let state = AssociationState::Releasing.on_pdu(&Pdu::ReleaseRP).unwrap();
        assert_eq!(state, AssociationState::Closed);
    }

    #[test]
    fn abort_is_accepted_from_any_live_state() {
        for state in [
            AssociationState::Requesting,
            AssociationState::Established,
            AssociationState::Releasing,
        ] {
            assert_eq!(state.on_pdu(&abort()), Some(AssociationState::Aborted));
        }
    }

    #[test]
    fn data_before_negotiation_is_rejected() {
        assert_eq!(AssociationState::Requesting.on_pdu(&pdata()), None);
        assert_eq!(AssociationState::Idle.on_pdu(&pdata()), None);
    }

    /// A small stand-in for arbitrary inbound PDUs.
    #[derive(Debug, Clone)]
    struct AnyPdu(Pdu);

    impl Arbitrary for AnyPdu {
        fn arbitrary(g: &mut Gen) -> Self {
            let pdu = match u8::arbitrary(g) % 8 {
                0 => Pdu::ReleaseRQ,
                1 => Pdu::ReleaseRP,
                2 => abort(),
                3 => pdata(),
                4 => Pdu::AssociationAC {
                    protocol_version: 1,
                    called_ae_title: "THEM".to_string(),
                    calling_ae_title: "US".to_string(),
                    application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
                    presentation_contexts: vec![],
                    user_variables: vec![],
                },
                5 => Pdu::AssociationRJ {
                    result: crate::pdu::AssociationRJResult::Permanent,
                    source: crate::pdu::AssociationRJSource::ServiceUser(
                        crate::pdu::AssociationRJServiceUserReason::NoReasonGiven,
                    ),
                },
                6 => Pdu::AssociationRQ {
                    protocol_version: 1,
                    calling_ae_title: "X".to_string(),
                    called_ae_title: "Y".to_string(),
                    application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
                    presentation_contexts: vec![],
                    user_variables: vec![],
                },
                _ => Pdu::Unknown {
                    pdu_type: 0xAA,
                    data: vec![],
                },
            };
            AnyPdu(pdu)
        }
    }

    /// Driving the state machine with arbitrary PDU sequences
    /// never leaves the allowed transition table:
    /// terminal states absorb everything,
    /// and any accepted transition lands in a known state.
    #[quickcheck]
    fn arbitrary_sequences_respect_the_transition_table(pdus: Vec<AnyPdu>) -> bool {
        let mut state = AssociationState::Requesting;
        for AnyPdu(pdu) in pdus {
            match state.on_pdu(&pdu) {
                Some(next) => {
                    // terminal states must never transition
                    if state.is_terminal() {
                        return false;
                    }
                    // an accepted abort must land in Aborted
                    if matches!(pdu, Pdu::AbortRQ { .. })
                        && next != AssociationState::Aborted
                    {
                        return false;
                    }
                    state = next;
                }
                None => {
                    // an unexpected PDU leads to a local abort
                    if state.is_terminal() {
                        // fine, terminal states accept nothing
                        continue;
                    }
                    state = AssociationState::Aborted;
                }
            }
        }
        true
    }
}
