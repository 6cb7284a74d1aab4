//! The client dispatcher.
//!
//! [`DicomClient`] owns a FIFO queue of [`DicomRequest`]s and,
//! upon [`send`](DicomClient::send),
//! drives them to completion over one or more sequential associations:
//! it negotiates presentation contexts for the queued SOP classes,
//! pipelines outstanding requests up to the negotiated
//! asynchronous operations window,
//! enforces the per-request timeout,
//! and re-associates when the per-association request cap is reached
//! or new SOP classes show up in the queue.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, Snafu};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use radlink_ul::association::client::{
    ClientAssociation, ClientAssociationOptions, Error as AssociationError,
};
use radlink_ul::association::AssociationState;
use radlink_ul::connection::{Connector, TcpConnector};
use radlink_ul::pdu::{
    AssociationRJResult, AssociationRJSource, Pdu, DEFAULT_MAX_PDU,
};

use crate::command::{DATA_SET_MISSING, DATA_SET_PRESENT};
use crate::message::{message_pdus, MessageAssembler};
use crate::request::{DicomRequest, DicomResponse, FailureReason};

/// An error terminating a dispatcher run.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the caller canceled the run
    Cancelled { backtrace: Backtrace },

    /// the association was rejected by the peer
    Rejected {
        association_result: AssociationRJResult,
        association_source: AssociationRJSource,
        backtrace: Backtrace,
    },

    /// could not establish an association after repeated attempts
    Connect {
        #[snafu(backtrace)]
        source: AssociationError,
    },

    /// associations kept aborting without making progress
    Aborted { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A cooperative cancellation handle for [`DicomClient::send`].
///
/// Cloning the token shares the same cancellation state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a token in the not-canceled state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelToken {
            inner: Arc::new(tx),
        }
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.inner.send_replace(true);
    }

    /// Whether cancellation was signaled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.borrow()
    }

    /// Suspend until cancellation is signaled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // the sender lives as long as this token, but play it safe
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// An observable event on the dispatcher.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// an association was accepted by the peer
    AssociationAccepted,
    /// an association was rejected by the peer
    AssociationRejected {
        /// whether the rejection is permanent or transient
        result: AssociationRJResult,
        /// who rejected the association and why
        source: AssociationRJSource,
    },
    /// an association ended through an orderly release
    AssociationReleased,
    /// a request exceeded the configured timeout
    RequestTimedOut {
        /// the message id of the request
        message_id: u16,
        /// the timeout that elapsed
        timeout: Duration,
    },
    /// a request received its final response
    RequestCompleted {
        /// the message id of the request
        message_id: u16,
        /// the final status code
        status: u16,
    },
    /// the active association changed state
    StateChanged {
        /// the new association state
        state: AssociationState,
    },
}

/// Configuration of a [`DicomClient`].
#[derive(Debug, Clone)]
pub struct DicomClientOptions {
    address: String,
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    request_timeout: Duration,
    write_timeout: Option<Duration>,
    max_pdu_length: u32,
    max_requests_per_association: usize,
    async_ops_invoked: u16,
    async_ops_performed: u16,
    linger: Duration,
    release_timeout: Duration,
    connect_timeout: Option<Duration>,
}

impl DicomClientOptions {
    /// Create options for a peer at `address`
    /// (such as `"pacs.example.com:104"`)
    /// with the given called AE title.
    pub fn new(address: impl Into<String>, called_ae_title: impl Into<Cow<'static, str>>) -> Self {
        DicomClientOptions {
            address: address.into(),
            calling_ae_title: "RADLINK-SCU".into(),
            called_ae_title: called_ae_title.into(),
            request_timeout: Duration::from_secs(30),
            write_timeout: Some(Duration::from_secs(30)),
            max_pdu_length: DEFAULT_MAX_PDU,
            max_requests_per_association: usize::MAX,
            async_ops_invoked: 1,
            async_ops_performed: 1,
            linger: Duration::ZERO,
            release_timeout: Duration::from_secs(5),
            connect_timeout: None,
        }
    }

    /// Create options from a full AE address (`AET@host:port`).
    pub fn for_ae_addr(addr: &radlink_ul::FullAeAddr) -> Self {
        Self::new(addr.address(), addr.ae_title().to_string())
    }

    /// Define the calling application entity title.
    pub fn calling_ae_title(mut self, calling_ae_title: impl Into<Cow<'static, str>>) -> Self {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// The maximum inbound silence tolerated per in-flight request:
    /// between a request leaving the client and its first response,
    /// and between consecutive responses of a multi-response operation.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The deadline for each single PDU write.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// The maximum inbound PDU length to advertise.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// How many requests one association may carry at most.
    /// When the cap is reached and requests remain queued,
    /// the dispatcher releases and re-associates.
    pub fn max_requests_per_association(mut self, value: usize) -> Self {
        self.max_requests_per_association = value.max(1);
        self
    }

    /// The asynchronous operations window to negotiate:
    /// how many requests may be outstanding at once
    /// on one association.
    /// A value of 0 means no pipelining, equivalent to 1.
    pub fn negotiate_async_ops(mut self, invoked: u16, performed: u16) -> Self {
        self.async_ops_invoked = invoked;
        self.async_ops_performed = performed;
        self
    }

    /// How long to keep an established association open
    /// after the queue runs empty,
    /// allowing rapid reuse by late
    /// [`add_request`](DicomClient::add_request) calls.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// How long to wait for the peer's reply to a release request
    /// before aborting the association instead.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Bound the time spent establishing the TCP connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build a client dispatching over plain TCP.
    pub fn into_client(self) -> DicomClient {
        let mut connector = TcpConnector::new(self.address.clone());
        if let Some(timeout) = self.connect_timeout {
            connector = connector.connect_timeout(timeout);
        }
        DicomClient::with_connector(self, connector)
    }
}

struct Shared {
    queue: std::sync::Mutex<VecDeque<DicomRequest>>,
    enqueued: Notify,
}

struct InFlightEntry {
    request: DicomRequest,
    last_activity: Instant,
}

enum TransmitOutcome {
    Sent { stalled: bool },
    NoContext,
    EncodeFailed,
    ConnectionLost,
}

enum ServeOutcome {
    Drained,
    Reassociate,
    Aborted { progressed: bool },
    Cancelled,
}

/// An association-oriented DIMSE client.
///
/// Requests enqueued through [`add_request`](Self::add_request)
/// are dispatched by [`send`](Self::send),
/// which runs until the queue is drained
/// and every in-flight request reached a terminal state.
pub struct DicomClient<C: Connector = TcpConnector> {
    options: DicomClientOptions,
    connector: C,
    shared: Arc<Shared>,
    events_tx: UnboundedSender<ClientEvent>,
    events_rx: std::sync::Mutex<Option<UnboundedReceiver<ClientEvent>>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl DicomClient<TcpConnector> {
    /// Create a client dispatching over plain TCP.
    pub fn new(options: DicomClientOptions) -> Self {
        options.into_client()
    }
}

impl<C: Connector> DicomClient<C> {
    /// Create a client dispatching over streams
    /// produced by the given connector.
    pub fn with_connector(options: DicomClientOptions, connector: C) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        DicomClient {
            options,
            connector,
            shared: Arc::new(Shared {
                queue: std::sync::Mutex::new(VecDeque::new()),
                enqueued: Notify::new(),
            }),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Take the client event receiver.
    ///
    /// Returns `None` if the receiver was already taken.
    pub fn take_events(&self) -> Option<UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Adjust the asynchronous operations window for future associations.
    pub fn negotiate_async_ops(&mut self, invoked: u16, performed: u16) {
        self.options.async_ops_invoked = invoked;
        self.options.async_ops_performed = performed;
    }

    /// Enqueue a request.
    ///
    /// Legal both before and while [`send`](Self::send) is running;
    /// a running dispatcher picks up new requests
    /// as association capacity permits.
    pub fn add_request(&self, request: DicomRequest) {
        self.shared.queue.lock().unwrap().push_back(request);
        self.shared.enqueued.notify_one();
    }

    /// Dispatch queued requests until the queue is drained
    /// and every in-flight request terminated.
    ///
    /// Canceling the token aborts the current association,
    /// fails outstanding and queued requests with
    /// [`FailureReason::Cancelled`],
    /// and resolves this call with [`Error::Cancelled`].
    /// A concurrent `send` joins the tail of the running drain.
    pub async fn send(&self, cancel: CancelToken) -> Result<()> {
        let _run = self.run_lock.lock().await;
        let mut consecutive_failures = 0_u32;

        loop {
            if cancel.is_cancelled() {
                self.fail_all_queued(FailureReason::Cancelled);
                return CancelledSnafu.fail();
            }
            if self.queue_is_empty() {
                return Ok(());
            }

            // negotiate one presentation context
            // per distinct SOP class currently queued
            let proposed = self.queued_sop_classes();
            let mut association_options = ClientAssociationOptions::new()
                .calling_ae_title(self.options.calling_ae_title.clone())
                .called_ae_title(self.options.called_ae_title.clone())
                .max_pdu_length(self.options.max_pdu_length)
                .release_timeout(self.options.release_timeout);
            if let Some(write_timeout) = self.options.write_timeout {
                association_options = association_options.write_timeout(write_timeout);
            }
            if self.options.async_ops_invoked > 1 || self.options.async_ops_performed > 1 {
                association_options = association_options.async_ops_window(
                    self.options.async_ops_invoked,
                    self.options.async_ops_performed,
                );
            }
            for sop_class_uid in &proposed {
                association_options =
                    association_options.with_abstract_syntax(sop_class_uid.clone());
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => {
                    self.fail_all_queued(FailureReason::Cancelled);
                    return CancelledSnafu.fail();
                }
                connected = self.connector.connect() => connected,
            };
            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("connection attempt failed: {}", e);
                    consecutive_failures += 1;
                    if consecutive_failures >= 2 {
                        self.fail_all_queued(FailureReason::Transport);
                        return Err(Error::Connect {
                            source: AssociationError::Connect { source: e },
                        });
                    }
                    continue;
                }
            };

            let established = tokio::select! {
                _ = cancel.cancelled() => {
                    self.fail_all_queued(FailureReason::Cancelled);
                    return CancelledSnafu.fail();
                }
                established = association_options.establish(stream) => established,
            };
            let mut association = match established {
                Ok(association) => association,
                Err(AssociationError::Rejected {
                    association_result,
                    association_source,
                    ..
                }) => {
                    info!("association rejected: {:?}/{:?}", association_result, association_source);
                    self.emit(ClientEvent::AssociationRejected {
                        result: association_result.clone(),
                        source: association_source.clone(),
                    });
                    self.fail_all_queued(FailureReason::AssociationRejected);
                    return RejectedSnafu {
                        association_result,
                        association_source,
                    }
                    .fail();
                }
                Err(e) => {
                    warn!("association establishment failed: {}", e);
                    consecutive_failures += 1;
                    if consecutive_failures >= 2 {
                        self.fail_all_queued(FailureReason::Transport);
                        return Err(Error::Connect { source: e });
                    }
                    continue;
                }
            };
            consecutive_failures = 0;
            self.emit(ClientEvent::AssociationAccepted);
            self.emit(ClientEvent::StateChanged {
                state: AssociationState::Established,
            });

            let proposed: HashSet<String> = proposed.into_iter().collect();
            match self
                .serve_association(&mut association, &proposed, &cancel)
                .await
            {
                ServeOutcome::Drained => {
                    if self.queue_is_empty() {
                        return Ok(());
                    }
                    // late arrivals during teardown, associate again
                }
                ServeOutcome::Reassociate => {}
                ServeOutcome::Aborted { progressed } => {
                    if progressed {
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                        if consecutive_failures >= 2 {
                            self.fail_all_queued(FailureReason::AssociationAborted);
                            return AbortedSnafu.fail();
                        }
                    }
                }
                ServeOutcome::Cancelled => {
                    self.fail_all_queued(FailureReason::Cancelled);
                    return CancelledSnafu.fail();
                }
            }
        }
    }

    /// Serve one association until the queue drains,
    /// its request cap is reached,
    /// or it dies.
    async fn serve_association<S>(
        &self,
        association: &mut ClientAssociation<S>,
        proposed: &HashSet<String>,
        cancel: &CancelToken,
    ) -> ServeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request_timeout = self.options.request_timeout;
        let max_requests = self.options.max_requests_per_association.max(1);
        // the effective pipelining window: bounded by our configuration
        // and by what the acceptor granted;
        // absent a granted window, operate synchronously
        let requested_window = self.options.async_ops_invoked.max(1) as usize;
        let window = match association.async_ops() {
            Some((0, _)) => requested_window,
            Some((invoked, _)) => requested_window.min(invoked as usize),
            None => 1,
        };

        let mut assembler = MessageAssembler::new(association.presentation_contexts());
        let mut inflight: HashMap<u16, InFlightEntry> = HashMap::new();
        let mut sent_count: usize = 0;
        let mut progressed = false;
        let mut needs_reassociation = false;

        loop {
            // keep the pipeline full
            while !needs_reassociation && inflight.len() < window && sent_count < max_requests {
                let Some(mut request) = self.pop_request() else {
                    break;
                };
                if !proposed.contains(request.sop_class_uid()) {
                    // this SOP class was queued after negotiation,
                    // it needs a fresh association
                    debug!(
                        sop_class_uid = request.sop_class_uid(),
                        "request needs a context this association did not propose"
                    );
                    self.requeue_front(request);
                    needs_reassociation = true;
                    break;
                }
                match self.transmit(association, &request).await {
                    TransmitOutcome::Sent { stalled } => {
                        sent_count += 1;
                        progressed = true;
                        if stalled {
                            // flushing alone exceeded the request timeout
                            let message_id = request.message_id();
                            request.time_out(request_timeout);
                            self.emit(ClientEvent::RequestTimedOut {
                                message_id,
                                timeout: request_timeout,
                            });
                        } else {
                            let message_id = request.message_id();
                            request.mark_in_flight();
                            inflight.insert(
                                message_id,
                                InFlightEntry {
                                    request,
                                    last_activity: Instant::now(),
                                },
                            );
                        }
                    }
                    TransmitOutcome::NoContext => {
                        request.fail(FailureReason::NoAcceptedPresentationContext);
                    }
                    TransmitOutcome::EncodeFailed => {
                        request.fail(FailureReason::ProtocolViolation);
                    }
                    TransmitOutcome::ConnectionLost => {
                        request.fail(FailureReason::AssociationAborted);
                        self.abort_association(
                            association,
                            &mut inflight,
                            FailureReason::AssociationAborted,
                        )
                        .await;
                        return ServeOutcome::Aborted { progressed };
                    }
                }
            }

            if inflight.is_empty() {
                if !needs_reassociation && self.queue_is_empty() {
                    let linger = self.options.linger;
                    if !linger.is_zero() {
                        let lingered = tokio::select! {
                            _ = cancel.cancelled() => None,
                            _ = tokio::time::sleep(linger) => Some(false),
                            _ = self.shared.enqueued.notified() => Some(true),
                        };
                        match lingered {
                            None => {
                                self.abort_association(
                                    association,
                                    &mut inflight,
                                    FailureReason::Cancelled,
                                )
                                .await;
                                return ServeOutcome::Cancelled;
                            }
                            Some(true) => continue,
                            Some(false) => {}
                        }
                    }
                    if self.queue_is_empty() {
                        self.release_association(association).await;
                        return ServeOutcome::Drained;
                    }
                    continue;
                }
                // requests remain but this association cannot carry them
                if needs_reassociation || sent_count >= max_requests {
                    self.release_association(association).await;
                    return ServeOutcome::Reassociate;
                }
                continue;
            }

            // wait for inbound traffic, the nearest deadline, or cancellation
            let deadline = inflight
                .values()
                .map(|entry| entry.last_activity + request_timeout)
                .min()
                .unwrap_or_else(|| Instant::now() + request_timeout);

            enum Wake {
                Cancelled,
                Inbound(std::result::Result<Pdu, AssociationError>),
                Deadline,
            }
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                received = association.receive() => Wake::Inbound(received),
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Cancelled => {
                    self.abort_association(association, &mut inflight, FailureReason::Cancelled)
                        .await;
                    return ServeOutcome::Cancelled;
                }
                Wake::Deadline => {
                    let now = Instant::now();
                    let expired: Vec<u16> = inflight
                        .iter()
                        .filter(|(_, entry)| now - entry.last_activity >= request_timeout)
                        .map(|(message_id, _)| *message_id)
                        .collect();
                    for message_id in expired {
                        if let Some(mut entry) = inflight.remove(&message_id) {
                            debug!(message_id, "request timed out");
                            entry.request.time_out(request_timeout);
                            self.emit(ClientEvent::RequestTimedOut {
                                message_id,
                                timeout: request_timeout,
                            });
                        }
                    }
                }
                Wake::Inbound(Ok(Pdu::PData { data })) => {
                    for pdv in data {
                        match assembler.push_pdv(pdv) {
                            Ok(Some(message)) => {
                                let Some(response) = DicomResponse::from_message(message) else {
                                    warn!("response lacks correlation or status fields");
                                    self.abort_association(
                                        association,
                                        &mut inflight,
                                        FailureReason::ProtocolViolation,
                                    )
                                    .await;
                                    return ServeOutcome::Aborted { progressed };
                                };
                                self.deliver(response, &mut inflight);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("inbound message reassembly failed: {}", e);
                                self.abort_association(
                                    association,
                                    &mut inflight,
                                    FailureReason::ProtocolViolation,
                                )
                                .await;
                                return ServeOutcome::Aborted { progressed };
                            }
                        }
                    }
                }
                Wake::Inbound(Ok(Pdu::AbortRQ { .. })) => {
                    debug!("association aborted by peer");
                    self.abort_association(
                        association,
                        &mut inflight,
                        FailureReason::AssociationAborted,
                    )
                    .await;
                    return ServeOutcome::Aborted { progressed };
                }
                Wake::Inbound(Ok(pdu)) => {
                    warn!("unexpected {} on established association", pdu.short_description());
                    self.abort_association(
                        association,
                        &mut inflight,
                        FailureReason::ProtocolViolation,
                    )
                    .await;
                    return ServeOutcome::Aborted { progressed };
                }
                Wake::Inbound(Err(e)) => {
                    let reason = match e {
                        AssociationError::UnexpectedResponse { .. } => {
                            FailureReason::ProtocolViolation
                        }
                        _ => FailureReason::AssociationAborted,
                    };
                    debug!("association receive failed: {}", e);
                    self.abort_association(association, &mut inflight, reason).await;
                    return ServeOutcome::Aborted { progressed };
                }
            }
        }
    }

    /// Transmit one request,
    /// measuring whether any single PDU write
    /// stalled past the request timeout.
    async fn transmit<S>(
        &self,
        association: &mut ClientAssociation<S>,
        request: &DicomRequest,
    ) -> TransmitOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        use radlink_ul::pdu::PresentationContextResultReason;

        let Some(context) = association
            .presentation_contexts()
            .iter()
            .find(|pc| {
                pc.reason == PresentationContextResultReason::Acceptance
                    && pc.abstract_syntax == request.sop_class_uid()
            })
            .cloned()
        else {
            debug!(
                sop_class_uid = request.sop_class_uid(),
                "no accepted presentation context"
            );
            return TransmitOutcome::NoContext;
        };
        let Some(transfer_syntax) = TransferSyntaxRegistry.get(&context.transfer_syntax) else {
            warn!(
                transfer_syntax = %context.transfer_syntax,
                "negotiated transfer syntax not in registry"
            );
            return TransmitOutcome::NoContext;
        };

        // the dispatcher owns the message id and data set type fields
        let mut command = request.command().clone();
        command.put(DataElement::new(
            tags::MESSAGE_ID,
            VR::US,
            dicom_value!(U16, [request.message_id()]),
        ));
        command.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if request.data().is_some() {
                    DATA_SET_PRESENT
                } else {
                    DATA_SET_MISSING
                }]
            ),
        ));

        let pdus = match message_pdus(
            &command,
            request.data(),
            transfer_syntax,
            context.id,
            association.acceptor_max_pdu_length(),
        ) {
            Ok(pdus) => pdus,
            Err(e) => {
                warn!(
                    message_id = request.message_id(),
                    "failed to encode request: {}", e
                );
                return TransmitOutcome::EncodeFailed;
            }
        };

        let mut stalled = false;
        for pdu in &pdus {
            let started = Instant::now();
            if let Err(e) = association.send(pdu).await {
                debug!("send failed mid-request: {}", e);
                return TransmitOutcome::ConnectionLost;
            }
            if started.elapsed() >= self.options.request_timeout {
                stalled = true;
            }
        }
        TransmitOutcome::Sent { stalled }
    }

    /// Route one response to its in-flight request by message id.
    fn deliver(&self, response: DicomResponse, inflight: &mut HashMap<u16, InFlightEntry>) {
        let message_id = response.message_id;
        let Some(mut entry) = inflight.remove(&message_id) else {
            // unknown or already timed out, drop it
            debug!(message_id, "discarding response with no in-flight request");
            return;
        };
        entry.last_activity = Instant::now();
        let status = response.status;
        if entry.request.deliver_response(response) {
            self.emit(ClientEvent::RequestCompleted { message_id, status });
        } else {
            inflight.insert(message_id, entry);
        }
    }

    async fn abort_association<S>(
        &self,
        association: &mut ClientAssociation<S>,
        inflight: &mut HashMap<u16, InFlightEntry>,
        reason: FailureReason,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (_, mut entry) in inflight.drain() {
            entry.request.fail(reason);
        }
        association.abort().await;
        self.emit(ClientEvent::StateChanged {
            state: association.state(),
        });
    }

    async fn release_association<S>(&self, association: &mut ClientAssociation<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match association.release().await {
            Ok(()) => {
                self.emit(ClientEvent::AssociationReleased);
                self.emit(ClientEvent::StateChanged {
                    state: AssociationState::Closed,
                });
            }
            Err(e) => {
                debug!("association release failed: {}", e);
                self.emit(ClientEvent::StateChanged {
                    state: association.state(),
                });
            }
        }
    }

    fn queued_sop_classes(&self) -> Vec<String> {
        let queue = self.shared.queue.lock().unwrap();
        let mut seen = HashSet::new();
        queue
            .iter()
            .map(|request| request.sop_class_uid().to_string())
            .filter(|uid| seen.insert(uid.clone()))
            // context identifiers are odd numbers in 1..=255
            .take(128)
            .collect()
    }

    fn pop_request(&self) -> Option<DicomRequest> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    fn requeue_front(&self, request: DicomRequest) {
        self.shared.queue.lock().unwrap().push_front(request);
    }

    fn queue_is_empty(&self) -> bool {
        self.shared.queue.lock().unwrap().is_empty()
    }

    fn fail_all_queued(&self, reason: FailureReason) {
        let mut queue = self.shared.queue.lock().unwrap();
        for mut request in queue.drain(..) {
            request.fail(reason);
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }
}
