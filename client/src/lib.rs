//! An association-oriented DIMSE client
//! for the DICOM upper layer protocol.
//!
//! This crate builds on [`radlink_ul`] to provide the service class user
//! side of the DICOM message service element (DIMSE):
//!
//! - the [`command`] module holds the command set vocabulary and builders;
//! - the [`message`] module assembles and disassembles DIMSE messages
//!   (command set plus optional data set) from presentation data values;
//! - the [`request`] module defines queued requests,
//!   their responses and lifecycle events;
//! - the [`client`] module is the dispatcher:
//!   it queues requests, negotiates associations on demand,
//!   pipelines outstanding operations,
//!   and enforces per-request timeouts.
//!
//! # Example
//!
//! ```no_run
//! use radlink_client::{DicomClient, DicomClientOptions, CancelToken, DicomRequest};
//! use radlink_client::request::RequestEvent;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DicomClientOptions::new("pacs.example.com:104", "MAIN-PACS")
//!     .calling_ae_title("MY-SCU")
//!     .into_client();
//!
//! let (request, mut events) = DicomRequest::c_echo();
//! client.add_request(request);
//! client.send(CancelToken::new()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let RequestEvent::Response(response) = event {
//!         println!("echo status: {:04X}", response.status);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod message;
pub mod request;

pub use client::{CancelToken, ClientEvent, DicomClient, DicomClientOptions, Error};
pub use command::{CommandField, Priority, StatusType};
pub use message::DicomMessage;
pub use request::{DicomRequest, DicomResponse, FailureReason, RequestEvent, RequestState};
