//! Queued DIMSE requests and their responses.
//!
//! A [`DicomRequest`] is handed over to the
//! [dispatcher](crate::client::DicomClient) upon
//! [`add_request`](crate::client::DicomClient::add_request)
//! and owned by it until a terminal event fires.
//! Everything the request produces along the way,
//! responses, a timeout, or a failure,
//! is delivered through the paired [`RequestEvents`] receiver.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use snafu::Snafu;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::command::{self, Priority, StatusType};
use crate::message::DicomMessage;

/// Returns a new message id by incrementing a process-wide counter.
///
/// Identifiers start at 1 and wrap around the 16-bit space,
/// skipping 0.
pub(crate) fn next_message_id() -> u16 {
    static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
    loop {
        let id = CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst);
        if id != 0 {
            return id;
        }
    }
}

/// The lifecycle state of a request.
///
/// A request only ever moves forward:
/// `Pending → InFlight → {Completed | TimedOut | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// queued, not yet transmitted
    Pending,
    /// transmitted, awaiting responses
    InFlight,
    /// a final (non-pending) response arrived (terminal)
    Completed,
    /// the peer stayed silent past the request timeout (terminal)
    TimedOut,
    /// the request failed without a final response (terminal)
    Failed,
}

impl RequestState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::TimedOut | RequestState::Failed
        )
    }
}

/// Why a request failed without reaching a final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum FailureReason {
    /// the association carrying the request was aborted
    AssociationAborted,
    /// the peer rejected the association
    AssociationRejected,
    /// the peer violated the protocol
    ProtocolViolation,
    /// the transport failed
    Transport,
    /// the caller canceled the run
    Cancelled,
    /// the peer accepted no presentation context
    /// for the request's SOP class
    NoAcceptedPresentationContext,
}

/// An event on the lifecycle of a single request.
#[derive(Debug)]
pub enum RequestEvent {
    /// a response was received;
    /// for multi-response operations
    /// every pending response produces one such event
    Response(DicomResponse),
    /// the peer stayed silent past the request timeout;
    /// no further events will follow
    TimedOut {
        /// the timeout that elapsed
        timeout: Duration,
    },
    /// the request failed; no further events will follow
    Failed {
        /// why the request failed
        reason: FailureReason,
    },
}

/// The receiving end of a request's event channel.
pub type RequestEvents = UnboundedReceiver<RequestEvent>;

/// A response correlated to a request by message id.
#[derive(Debug)]
pub struct DicomResponse {
    /// the message id of the originating request
    pub message_id: u16,
    /// the raw status code from `(0000,0900)`
    pub status: u16,
    /// the status category of the response
    pub status_type: StatusType,
    /// the full response command set
    pub command: InMemDicomObject,
    /// the response data set, if any
    pub data: Option<InMemDicomObject>,
}

impl DicomResponse {
    /// Interpret an inbound message as a response.
    ///
    /// Returns `None` when the command set lacks
    /// the message id or status fields.
    pub(crate) fn from_message(message: DicomMessage) -> Option<DicomResponse> {
        let message_id = message
            .command
            .get(tags::MESSAGE_ID_BEING_RESPONDED_TO)
            .map(InMemElement::to_int::<u16>)
            .and_then(Result::ok)?;
        let status = message
            .command
            .get(tags::STATUS)
            .map(InMemElement::to_int::<u16>)
            .and_then(Result::ok)?;
        // AEs are free to use status codes outside the standard ranges,
        // treat those as failures
        let status_type = StatusType::try_from(status).unwrap_or(StatusType::Failure);
        Some(DicomResponse {
            message_id,
            status,
            status_type,
            command: message.command,
            data: message.data,
        })
    }
}

/// A queued DIMSE operation.
///
/// Construct one through the typed constructors
/// ([`c_echo`](DicomRequest::c_echo), [`c_find`](DicomRequest::c_find),
/// [`c_store`](DicomRequest::c_store), [`c_move`](DicomRequest::c_move),
/// [`c_get`](DicomRequest::c_get))
/// or from a raw command set with [`new`](DicomRequest::new).
/// Each constructor returns the request
/// together with its event receiver.
#[derive(Debug)]
pub struct DicomRequest {
    message_id: u16,
    sop_class_uid: String,
    command: InMemDicomObject,
    data: Option<InMemDicomObject>,
    multi_response: bool,
    state: RequestState,
    events: UnboundedSender<RequestEvent>,
}

impl DicomRequest {
    /// Create a request from a raw command set.
    ///
    /// `multi_response` marks operations which produce
    /// a sequence of pending responses before the final one
    /// (C-FIND, C-MOVE, C-GET).
    pub fn new(
        sop_class_uid: impl Into<String>,
        command: InMemDicomObject,
        data: Option<InMemDicomObject>,
        multi_response: bool,
    ) -> (DicomRequest, RequestEvents) {
        let (events, receiver) = unbounded_channel();
        (
            DicomRequest {
                message_id: next_message_id(),
                sop_class_uid: sop_class_uid.into(),
                command,
                data,
                multi_response,
                state: RequestState::Pending,
                events,
            },
            receiver,
        )
    }

    /// Create a C-ECHO request against the verification SOP class.
    pub fn c_echo() -> (DicomRequest, RequestEvents) {
        let sop_class_uid = "1.2.840.10008.1.1";
        let message_id = next_message_id();
        let command = command::echo_rq(message_id, sop_class_uid);
        Self::with_message_id(message_id, sop_class_uid, command, None, false)
    }

    /// Create a C-FIND request with the given query identifier.
    pub fn c_find(
        sop_class_uid: impl Into<String>,
        identifier: InMemDicomObject,
        priority: Priority,
    ) -> (DicomRequest, RequestEvents) {
        let sop_class_uid = sop_class_uid.into();
        let message_id = next_message_id();
        let command = command::find_rq(message_id, &sop_class_uid, priority);
        Self::with_message_id(message_id, sop_class_uid, command, Some(identifier), true)
    }

    /// Create a C-STORE request for one SOP instance.
    pub fn c_store(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: &str,
        data: InMemDicomObject,
        priority: Priority,
    ) -> (DicomRequest, RequestEvents) {
        let sop_class_uid = sop_class_uid.into();
        let message_id = next_message_id();
        let command = command::store_rq(message_id, &sop_class_uid, sop_instance_uid, priority);
        Self::with_message_id(message_id, sop_class_uid, command, Some(data), false)
    }

    /// Create a C-MOVE request
    /// directing matching instances to `move_destination`.
    pub fn c_move(
        sop_class_uid: impl Into<String>,
        move_destination: &str,
        identifier: InMemDicomObject,
        priority: Priority,
    ) -> (DicomRequest, RequestEvents) {
        let sop_class_uid = sop_class_uid.into();
        let message_id = next_message_id();
        let command = command::move_rq(message_id, &sop_class_uid, move_destination, priority);
        Self::with_message_id(message_id, sop_class_uid, command, Some(identifier), true)
    }

    /// Create a C-GET request with the given query identifier.
    pub fn c_get(
        sop_class_uid: impl Into<String>,
        identifier: InMemDicomObject,
        priority: Priority,
    ) -> (DicomRequest, RequestEvents) {
        let sop_class_uid = sop_class_uid.into();
        let message_id = next_message_id();
        let command = command::get_rq(message_id, &sop_class_uid, priority);
        Self::with_message_id(message_id, sop_class_uid, command, Some(identifier), true)
    }

    fn with_message_id(
        message_id: u16,
        sop_class_uid: impl Into<String>,
        command: InMemDicomObject,
        data: Option<InMemDicomObject>,
        multi_response: bool,
    ) -> (DicomRequest, RequestEvents) {
        let (events, receiver) = unbounded_channel();
        (
            DicomRequest {
                message_id,
                sop_class_uid: sop_class_uid.into(),
                command,
                data,
                multi_response,
                state: RequestState::Pending,
                events,
            },
            receiver,
        )
    }

    /// The message id distinguishing this request on its association.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// The SOP class UID (abstract syntax) of the operation.
    pub fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    /// The current lifecycle state of the request.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether this operation produces pending responses
    /// before the final one.
    pub fn is_multi_response(&self) -> bool {
        self.multi_response
    }

    pub(crate) fn command(&self) -> &InMemDicomObject {
        &self.command
    }

    pub(crate) fn data(&self) -> Option<&InMemDicomObject> {
        self.data.as_ref()
    }

    pub(crate) fn mark_in_flight(&mut self) {
        debug_assert_eq!(self.state, RequestState::Pending);
        self.state = RequestState::InFlight;
    }

    /// Deliver one response.
    /// Returns `true` when the response terminated the request.
    ///
    /// A response on a request no longer in flight is dropped.
    pub(crate) fn deliver_response(&mut self, response: DicomResponse) -> bool {
        if self.state != RequestState::InFlight {
            debug!(
                message_id = self.message_id,
                state = ?self.state,
                "discarding late response"
            );
            return false;
        }
        let terminal =
            !(self.multi_response && response.status_type == StatusType::Pending);
        let _ = self.events.send(RequestEvent::Response(response));
        if terminal {
            self.state = RequestState::Completed;
        }
        terminal
    }

    /// Mark the request as timed out and notify the caller.
    /// A second terminal event is dropped.
    pub(crate) fn time_out(&mut self, timeout: Duration) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RequestState::TimedOut;
        let _ = self.events.send(RequestEvent::TimedOut { timeout });
    }

    /// Mark the request as failed and notify the caller.
    /// A second terminal event is dropped.
    pub(crate) fn fail(&mut self, reason: FailureReason) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RequestState::Failed;
        let _ = self.events.send(RequestEvent::Failed { reason });
    }
}
