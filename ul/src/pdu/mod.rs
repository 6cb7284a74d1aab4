//! Protocol data unit module
//!
//! This module comprises the data structures for the seven protocol data
//! units (PDUs) of the DICOM upper layer protocol,
//! as well as the codec routines translating them
//! from and to their octet stream representation.
//! The codec never touches a socket:
//! [`read_pdu`] and [`write_pdu`] work on in-memory readers and writers,
//! leaving all transport concerns to the
//! [`connection`](crate::connection) module.

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The length of the header of a single presentation data value item
/// in bytes: item length (4 bytes), presentation context ID (1 byte),
/// and message control header (1 byte).
pub const PDV_HEADER_SIZE: u32 = 6;

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax with one or more candidate transfer syntaxes.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context as it appears in an A-ASSOCIATE-AC:
/// the acceptor's verdict on one proposed context.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax UID chosen by the acceptor
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// joining the proposed abstract syntax with the acceptor's verdict.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// the transfer syntax UID chosen by the acceptor
    pub transfer_syntax: String,
}

/// The reason code of a presentation context result.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    /// the presentation context was accepted
    Acceptance = 0,
    /// user rejection
    UserRejection = 1,
    /// provider rejection with no reason given
    NoReason = 2,
    /// the abstract syntax is not supported
    AbstractSyntaxNotSupported = 3,
    /// none of the proposed transfer syntaxes are supported
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };
        Some(result)
    }
}

/// The result field of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJResult {
    /// the rejection is permanent
    Permanent,
    /// the rejection is transient,
    /// the requestor may try again later
    Transient,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason of an association rejection.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJSource {
    /// the DICOM UL service user rejected the association
    ServiceUser(AssociationRJServiceUserReason),
    /// the DICOM UL service provider rejected the association
    /// (ACSE related function)
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    /// the DICOM UL service provider rejected the association
    /// (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        let result = match (source, reason) {
            (1, 1) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
            }
            (1, 2) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
            (1, 3) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
            (1, 7) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
            (1, x) if (4..=6).contains(&x) || (8..=10).contains(&x) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(x))
            }
            (2, 1) => AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
            (3, x) if x == 0 || (3..=7).contains(&x) => {
                AssociationRJSource::ServiceProviderPresentation(
                    AssociationRJServiceProviderPresentationReason::Reserved(x),
                )
            }
            _ => {
                return None;
            }
        };
        Some(result)
    }
}

/// Rejection reasons attributed to the service user.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    /// no reason given
    NoReasonGiven,
    /// the application context name is not supported
    ApplicationContextNameNotSupported,
    /// the calling AE title is not recognized
    CallingAETitleNotRecognized,
    /// the called AE title is not recognized
    CalledAETitleNotRecognized,
    /// a reserved reason code
    Reserved(u8),
}

/// Rejection reasons attributed to the service provider
/// (ACSE related function).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    /// no reason given
    NoReasonGiven,
    /// the protocol version is not supported
    ProtocolVersionNotSupported,
}

/// Rejection reasons attributed to the service provider
/// (presentation related function).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// temporary congestion
    TemporaryCongestion,
    /// local limit exceeded
    LocalLimitExceeded,
    /// a reserved reason code
    Reserved(u8),
}

/// A single presentation data value within a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    /// the presentation context identifier this value belongs to
    pub presentation_context_id: u8,
    /// whether the fragment is part of a command set or a data set
    pub value_type: PDataValueType,
    /// whether this is the last fragment of its stream
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of stream a presentation data value fragment belongs to.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    /// message command information
    Command,
    /// message data set information
    Data,
}

/// The source field of an A-ABORT.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQSource {
    /// the abort was initiated by the service user
    ServiceUser,
    /// the abort was initiated by the service provider
    ServiceProvider(AbortRQServiceProviderReason),
    /// a reserved source code
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecified)
            }
            (2, 1) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            ),
            (2, 5) => AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            ),
            (2, 6) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter)
            }
            _ => {
                return None;
            }
        };
        Some(result)
    }
}

/// Abort reasons attributed to the service provider.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// the reason for the abort was not specified
    ReasonNotSpecified,
    /// a PDU could not be recognized
    UnrecognizedPdu,
    /// a PDU arrived which was not expected in the current state
    UnexpectedPdu,
    /// a reserved reason code
    Reserved,
    /// a PDU parameter could not be recognized
    UnrecognizedPduParameter,
    /// a PDU parameter arrived which was not expected
    UnexpectedPduParameter,
    /// a PDU parameter had an invalid value
    InvalidPduParameter,
}

/// A variable item in an association PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    /// an item of an unrecognized type
    Unknown(u8),
    /// an application context item
    ApplicationContext(String),
    /// a proposed presentation context item
    PresentationContextProposed(PresentationContextProposed),
    /// a presentation context result item
    PresentationContextResult(PresentationContextResult),
    /// a user information item
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    /// a sub-item of an unrecognized type, carried through verbatim
    Unknown(u8, Vec<u8>),
    /// the maximum length sub-item,
    /// bounding the P-DATA-TF PDUs the peer may send to us
    MaxLength(u32),
    /// the implementation class UID sub-item
    ImplementationClassUID(String),
    /// the implementation version name sub-item
    ImplementationVersionName(String),
    /// the asynchronous operations window sub-item,
    /// negotiating how many operations either party
    /// may have outstanding at once
    AsyncOperationsWindow {
        /// maximum number of operations the requestor may invoke
        /// without awaiting their responses
        max_ops_invoked: u16,
        /// maximum number of operations the requestor may perform
        /// without reporting their outcome
        max_ops_performed: u16,
    },
}

/// A DICOM upper layer protocol data unit.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Pdu {
    /// a PDU of an unrecognized type
    Unknown {
        /// the PDU type code found on the wire
        pdu_type: u8,
        /// the raw PDU payload
        data: Vec<u8>,
    },
    /// A-ASSOCIATE-RQ (PDU type 01H)
    AssociationRQ {
        /// the protocol version, with bit 0 set for version 1
        protocol_version: u16,
        /// the AE title of the requesting node
        calling_ae_title: String,
        /// the AE title of the destination node
        called_ae_title: String,
        /// the application context name
        application_context_name: String,
        /// the list of proposed presentation contexts
        presentation_contexts: Vec<PresentationContextProposed>,
        /// the user information sub-items
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-AC (PDU type 02H)
    AssociationAC {
        /// the protocol version, with bit 0 set for version 1
        protocol_version: u16,
        /// reserved, echoes the called AE title of the request
        called_ae_title: String,
        /// reserved, echoes the calling AE title of the request
        calling_ae_title: String,
        /// the application context name
        application_context_name: String,
        /// the presentation context results
        presentation_contexts: Vec<PresentationContextResult>,
        /// the user information sub-items
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-RJ (PDU type 03H)
    AssociationRJ {
        /// whether the rejection is permanent or transient
        result: AssociationRJResult,
        /// who rejected the association and why
        source: AssociationRJSource,
    },
    /// P-DATA-TF (PDU type 04H)
    PData {
        /// the presentation data value items
        data: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ (PDU type 05H)
    ReleaseRQ,
    /// A-RELEASE-RP (PDU type 06H)
    ReleaseRP,
    /// A-ABORT (PDU type 07H)
    AbortRQ {
        /// who aborted the association and why
        source: AbortRQSource,
    },
}

impl Pdu {
    /// A short name for the PDU variant, for log messages.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::Unknown { .. } => "Unknown",
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
        }
    }
}
