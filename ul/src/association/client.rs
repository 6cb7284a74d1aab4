//! Association requester module
//!
//! The [`ClientAssociationOptions`] builder negotiates an association
//! with a service class provider,
//! resulting in a [`ClientAssociation`]:
//! the session object through which PDUs are exchanged
//! until the association is released or aborted.

use std::borrow::Cow;
use std::time::Duration;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::pdata::fragment_pdata;
use super::uid::trim_uid;
use super::AssociationState;
use crate::address::AeAddr;
use crate::connection::{self, Connection};
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult, AssociationRJSource,
    PDataValueType, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    PDV_HEADER_SIZE,
};

/// An error requesting or using a client association.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("too many presentation contexts proposed ({}, maximum is 128)", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    /// could not parse the peer address
    InvalidAddress {
        source: crate::address::AddressParseError,
        backtrace: Backtrace,
    },

    /// could not connect to the service class provider
    Connect {
        #[snafu(backtrace)]
        source: connection::Error,
    },

    /// failed to send association request
    SendRequest {
        #[snafu(backtrace)]
        source: connection::Error,
    },

    /// failed to receive association response
    ReceiveResponse {
        #[snafu(backtrace)]
        source: connection::Error,
    },

    #[snafu(display("association negotiation timed out after {:?}", timeout))]
    NegotiationTimeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected response from SCP `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedResponse {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// the association was rejected by the service class provider
    Rejected {
        association_result: AssociationRJResult,
        association_source: AssociationRJSource,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the service class provider
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("operation not permitted in association state {:?}", state))]
    NotReady {
        state: AssociationState,
        backtrace: Backtrace,
    },

    /// failed to send PDU message
    Send {
        #[snafu(backtrace)]
        source: connection::Error,
    },

    /// failed to receive PDU message
    Receive {
        #[snafu(backtrace)]
        source: connection::Error,
    },

    #[snafu(display("PDU is too large to send ({} bytes, maximum is {})", length, maximum))]
    SendTooLongPdu {
        length: usize,
        maximum: u32,
        backtrace: Backtrace,
    },

    /// the peer aborted the association
    PeerAborted { backtrace: Backtrace },

    #[snafu(display("release timed out after {:?}", timeout))]
    ReleaseTimeout {
        timeout: Duration,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DICOM association builder for a client node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use radlink_ul::association::client::ClientAssociationOptions;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .connect("129.168.0.5:104")
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// with [`with_abstract_syntax`](Self::with_abstract_syntax)
/// or [`with_presentation_context`](Self::with_presentation_context).
/// Contexts with no explicit transfer syntax list
/// propose _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the proposed presentation contexts
    /// (abstract syntax, candidate transfer syntaxes)
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length admitted inbound
    max_pdu_length: u32,
    /// whether to fail on PDUs exceeding the negotiated size
    strict: bool,
    /// the per-PDU write deadline
    write_timeout: Option<Duration>,
    /// how long to wait for the peer's verdict on the association request
    negotiation_timeout: Option<Duration>,
    /// how long to wait for the peer's reply to a release request
    release_timeout: Duration,
    /// the asynchronous operations window to propose, if any
    async_ops_window: Option<(u16, u16)>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "RADLINK-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            write_timeout: None,
            negotiation_timeout: Some(Duration::from_secs(30)),
            release_timeout: Duration::from_secs(5),
            async_ops_window: None,
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `RADLINK-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context for this abstract syntax
    /// with the default transfer syntaxes.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_presentation_context(abstract_syntax_uid, Vec::<Cow<'static, str>>::new())
    }

    /// Propose a presentation context for this abstract syntax
    /// with an explicit list of candidate transfer syntaxes.
    pub fn with_presentation_context<T, U>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<U>,
    ) -> Self
    where
        T: Into<Cow<'static, str>>,
        U: Into<Cow<'static, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax_uid.into(),
            transfer_syntax_uids.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Override the maximum inbound PDU length to advertise.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Set a deadline for each PDU write on the association.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Bound the wait for the peer's verdict
    /// on the association request.
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    /// Bound the wait for the peer's reply to a release request.
    /// Past the deadline the association is aborted instead.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Propose an asynchronous operations window:
    /// how many operations this node wishes to invoke
    /// without awaiting their responses,
    /// and how many it is willing to perform concurrently.
    pub fn async_ops_window(mut self, max_ops_invoked: u16, max_ops_performed: u16) -> Self {
        self.async_ops_window = Some((max_ops_invoked, max_ops_performed));
        self
    }

    /// Tolerate inbound PDUs exceeding the advertised maximum length,
    /// up to the absolute limit of the protocol.
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Open a TCP connection to `address`
    /// and negotiate the association over it.
    pub async fn connect<A>(self, address: A) -> Result<ClientAssociation<TcpStream>>
    where
        A: tokio::net::ToSocketAddrs + std::fmt::Debug,
    {
        let stream = connection::connect(address).await.context(ConnectSnafu)?;
        self.establish(stream).await
    }

    /// Connect to a peer written as `{ae_title}@{host}:{port}`
    /// or plain `{host}:{port}`.
    ///
    /// When the address carries an AE title,
    /// it becomes the called AE title of the association.
    pub async fn connect_with(self, peer: &str) -> Result<ClientAssociation<TcpStream>> {
        let peer: AeAddr = peer.parse().context(InvalidAddressSnafu)?;
        let address = peer.address().to_string();
        let options = match peer.ae_title() {
            Some(ae_title) => {
                let ae_title = ae_title.to_string();
                self.called_ae_title(ae_title)
            }
            None => self,
        };
        options.connect(address.as_str()).await
    }

    /// Negotiate the association over an already connected stream.
    pub async fn establish<S>(self, stream: S) -> Result<ClientAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            protocol_version,
            max_pdu_length,
            strict,
            write_timeout,
            negotiation_timeout,
            release_timeout,
            async_ops_window,
        } = self;

        // presentation contexts represent intent,
        // they must not be omitted by the user
        ensure!(!presentation_contexts.is_empty(), MissingAbstractSyntaxSnafu);
        // context identifiers are odd numbers in 1..=255
        ensure!(
            presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu {
                count: presentation_contexts.len()
            }
        );

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| {
                let transfer_syntaxes: Vec<String> = if transfer_syntaxes.is_empty() {
                    vec![
                        // Implicit VR Little Endian
                        "1.2.840.10008.1.2".to_string(),
                        // Explicit VR Little Endian
                        "1.2.840.10008.1.2.1".to_string(),
                    ]
                } else {
                    transfer_syntaxes.iter().map(|uid| uid.to_string()).collect()
                };
                PresentationContextProposed {
                    id: (2 * i + 1) as u8,
                    abstract_syntax: abstract_syntax.to_string(),
                    transfer_syntaxes,
                }
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ];
        if let Some((max_ops_invoked, max_ops_performed)) = async_ops_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow {
                max_ops_invoked,
                max_ops_performed,
            });
        }

        let msg = Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables,
        };

        let mut connection = Connection::new(stream, max_pdu_length, strict);

        connection
            .write_pdu(&msg, write_timeout)
            .await
            .context(SendRequestSnafu)?;

        let response = match negotiation_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, connection.read_pdu()).await {
                    Ok(response) => response,
                    Err(_) => {
                        abort_connection(&mut connection, write_timeout).await;
                        return NegotiationTimeoutSnafu { timeout }.fail();
                    }
                }
            }
            None => connection.read_pdu().await,
        }
        .context(ReceiveResponseSnafu)?;

        match response {
            Pdu::AssociationAC {
                protocol_version: protocol_version_scp,
                presentation_contexts: presentation_contexts_scp,
                user_variables,
                ..
            } => {
                if protocol_version != protocol_version_scp {
                    abort_connection(&mut connection, write_timeout).await;
                    return ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: protocol_version_scp,
                    }
                    .fail();
                }

                let negotiated: Vec<PresentationContextNegotiated> = presentation_contexts_scp
                    .iter()
                    .filter_map(|result| {
                        presentation_contexts
                            .iter()
                            .find(|proposed| proposed.id == result.id)
                            .map(|proposed| PresentationContextNegotiated {
                                id: result.id,
                                reason: result.reason,
                                abstract_syntax: proposed.abstract_syntax.clone(),
                                transfer_syntax: trim_uid(&result.transfer_syntax).to_string(),
                            })
                    })
                    .collect();

                if !negotiated
                    .iter()
                    .any(|c| c.reason == PresentationContextResultReason::Acceptance)
                {
                    abort_connection(&mut connection, write_timeout).await;
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                let acceptor_max_pdu_length = user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(length) => Some(*length),
                        _ => None,
                    })
                    .map(|length| {
                        // zero means "no limit specified"
                        if length == 0 {
                            MAXIMUM_PDU_SIZE
                        } else {
                            length
                        }
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);

                let async_ops = user_variables.iter().find_map(|item| match item {
                    UserVariableItem::AsyncOperationsWindow {
                        max_ops_invoked,
                        max_ops_performed,
                    } => Some((*max_ops_invoked, *max_ops_performed)),
                    _ => None,
                });

                Ok(ClientAssociation {
                    connection,
                    state: AssociationState::Established,
                    presentation_contexts: negotiated,
                    requestor_max_pdu_length: max_pdu_length,
                    acceptor_max_pdu_length,
                    async_ops,
                    write_timeout,
                    release_timeout,
                })
            }
            Pdu::AssociationRJ { result, source } => {
                connection.close().await;
                RejectedSnafu {
                    association_result: result,
                    association_source: source,
                }
                .fail()
            }
            pdu => {
                abort_connection(&mut connection, write_timeout).await;
                UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }
}

async fn abort_connection<S>(connection: &mut Connection<S>, write_timeout: Option<Duration>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    let _ = connection.write_pdu(&abort, write_timeout).await;
    connection.close().await;
}

/// A DICOM upper level association
/// from the perspective of the association requester.
///
/// The association exclusively owns its connection
/// and destroys it upon reaching a terminal state.
#[derive(Debug)]
pub struct ClientAssociation<S> {
    /// the connection to the peer node
    connection: Connection<S>,
    /// the current upper layer state
    state: AssociationState,
    /// the negotiated presentation contexts
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length this node admits inbound
    requestor_max_pdu_length: u32,
    /// the maximum PDU length the peer admits inbound
    acceptor_max_pdu_length: u32,
    /// the asynchronous operations window granted by the peer, if any
    async_ops: Option<(u16, u16)>,
    /// the per-PDU write deadline
    write_timeout: Option<Duration>,
    /// how long to wait for the reply to a release request
    release_timeout: Duration,
}

impl<S> ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Retrieve the negotiated presentation contexts,
    /// including the ones the peer did not accept.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// The maximum PDU length this node admits on the inbound direction.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The maximum PDU length the peer admits on its inbound direction.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// The asynchronous operations window granted by the peer,
    /// as (maximum operations invoked, maximum operations performed),
    /// or `None` if the peer did not negotiate one.
    pub fn async_ops(&self) -> Option<(u16, u16)> {
        self.async_ops
    }

    /// The current upper layer state of this association.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// Send a PDU message to the peer.
    pub async fn send(&mut self, msg: &Pdu) -> Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            NotReadySnafu { state: self.state }
        );
        if let Pdu::PData { data } = msg {
            let length: usize = data
                .iter()
                .map(|pdv| pdv.data.len() + PDV_HEADER_SIZE as usize)
                .sum();
            ensure!(
                length <= self.acceptor_max_pdu_length as usize,
                SendTooLongPduSnafu {
                    length,
                    maximum: self.acceptor_max_pdu_length,
                }
            );
        }
        match self.connection.write_pdu(msg, self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connection.close().await;
                self.state = AssociationState::Aborted;
                Err(e).context(SendSnafu)
            }
        }
    }

    /// Send one command or data stream as presentation data,
    /// fragmented to the PDU length granted by the peer.
    pub async fn send_pdata(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
        data: &[u8],
    ) -> Result<()> {
        let pdus = fragment_pdata(
            presentation_context_id,
            value_type,
            data,
            self.acceptor_max_pdu_length,
        );
        for pdu in &pdus {
            self.send(pdu).await?;
        }
        Ok(())
    }

    /// Read a PDU message from the peer,
    /// driving the upper layer state machine.
    ///
    /// An inbound A-ABORT is returned to the caller
    /// after the association transitions to
    /// [`Aborted`](AssociationState::Aborted)
    /// and the connection is torn down.
    /// A PDU which is not acceptable in the current state
    /// aborts the association and surfaces
    /// [`Error::UnexpectedResponse`].
    pub async fn receive(&mut self) -> Result<Pdu> {
        ensure!(self.state.is_live(), NotReadySnafu { state: self.state });
        match self.connection.read_pdu().await {
            Ok(pdu) => match self.state.on_pdu(&pdu) {
                Some(next) => {
                    self.state = next;
                    if matches!(pdu, Pdu::AbortRQ { .. }) {
                        debug!("association aborted by peer");
                        self.connection.close().await;
                    }
                    Ok(pdu)
                }
                None => {
                    warn!(
                        "unexpected {} in association state {:?}",
                        pdu.short_description(),
                        self.state
                    );
                    self.abort_with(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ))
                    .await;
                    UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail()
                }
            },
            Err(e) => {
                self.connection.close().await;
                self.state = AssociationState::Aborted;
                Err(e).context(ReceiveSnafu)
            }
        }
    }

    /// Gracefully release the association.
    ///
    /// If the peer does not answer the release request
    /// within the configured release timeout,
    /// the association is aborted instead
    /// and the call fails with [`Error::ReleaseTimeout`].
    pub async fn release(&mut self) -> Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            NotReadySnafu { state: self.state }
        );
        self.send(&Pdu::ReleaseRQ).await?;
        self.state = AssociationState::Releasing;

        let timeout = self.release_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pdu = match tokio::time::timeout_at(deadline, self.connection.read_pdu()).await {
                Err(_) => {
                    debug!("peer unresponsive to release request, aborting");
                    self.abort_with(AbortRQSource::ServiceUser).await;
                    return ReleaseTimeoutSnafu { timeout }.fail();
                }
                Ok(Err(e)) => {
                    self.connection.close().await;
                    self.state = AssociationState::Aborted;
                    return Err(e).context(ReceiveSnafu);
                }
                Ok(Ok(pdu)) => pdu,
            };
            match self.state.on_pdu(&pdu) {
                Some(AssociationState::Closed) => {
                    self.state = AssociationState::Closed;
                    self.connection.close().await;
                    return Ok(());
                }
                Some(AssociationState::Releasing) => {
                    // presentation data racing the release request is dropped
                    debug!("discarding {} received during release", pdu.short_description());
                }
                Some(AssociationState::Aborted) => {
                    self.state = AssociationState::Aborted;
                    self.connection.close().await;
                    return PeerAbortedSnafu.fail();
                }
                Some(state) => {
                    // no other transition leaves Releasing
                    self.state = state;
                }
                None => {
                    self.abort_with(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ))
                    .await;
                    return UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail();
                }
            }
        }
    }

    /// Abort the association,
    /// notifying the peer on a best effort basis
    /// and tearing down the connection.
    ///
    /// Aborting an association already in a terminal state is a no-op.
    pub async fn abort(&mut self) {
        self.abort_with(AbortRQSource::ServiceUser).await;
    }

    async fn abort_with(&mut self, source: AbortRQSource) {
        if self.state.is_terminal() {
            return;
        }
        if !self.connection.is_closed() {
            let abort = Pdu::AbortRQ { source };
            let _ = self.connection.write_pdu(&abort, self.write_timeout).await;
        }
        self.connection.close().await;
        self.state = AssociationState::Aborted;
    }
}
