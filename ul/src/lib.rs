//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! It provides the building blocks for service class users (SCUs):
//!
//! - The [`pdu`] module holds the data structures representing
//!   _protocol data units_ and the codec translating them
//!   from and to their octet stream form.
//! - The [`connection`] module frames PDUs over asynchronous
//!   byte streams (plain TCP, TLS, or test doubles),
//!   with per-write deadlines.
//! - The [`association`] module drives the upper layer state machine
//!   for establishing, using and ending associations.
//! - The [`address`] module provides an abstraction for compound
//!   addresses referring to application entities in a network.
//!
//! ## Features
//!
//! * `tls`: enables encrypted transport through `rustls`.

pub mod address;
pub mod association;
pub mod connection;
pub mod pdu;

/// The implementation class UID of this stack.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.306504260668353256707897632792946936762";

/// The implementation version name of this stack.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "radlink 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::AssociationState;
pub use connection::{Connection, Connector, TcpConnector};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
