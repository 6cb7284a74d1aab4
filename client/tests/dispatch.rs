//! End-to-end dispatcher tests against an in-process SCP
//! speaking raw PDUs over TCP.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use rstest::rstest;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant, Sleep};

use radlink_client::client::{CancelToken, ClientEvent, DicomClient, DicomClientOptions, Error};
use radlink_client::command::{self, CommandField, StatusType};
use radlink_client::message::{message_pdus, DicomMessage, MessageAssembler};
use radlink_client::request::{DicomRequest, FailureReason, RequestEvent, RequestEvents};
use radlink_client::Priority;
use radlink_ul::connection::{Connection, Connector, Result as ConnectionResult};
use radlink_ul::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, Pdu,
    PresentationContextNegotiated, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem,
};

static STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
static MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

const SCP_MAX_PDU: u32 = 4_096;

/// What the SCP does with each fully received request message.
#[derive(Debug, Clone)]
enum Behavior {
    /// accept the association, swallow every message
    Silent,
    /// reply to every message with this scripted sequence
    /// of (delay, status) responses
    Scripted(Vec<(Duration, u16)>),
    /// respond with success only to every second message
    RespondEvenOnly,
    /// batch mode: respond to all unanswered messages
    /// once the inbound direction goes idle,
    /// recording the high water mark of unanswered messages
    RespondAfterDrain,
    /// reject every association
    Reject,
}

#[derive(Debug, Default)]
struct ScpState {
    associations: AtomicUsize,
    received_message_ids: Mutex<Vec<u16>>,
    max_unanswered: AtomicUsize,
}

struct Scp {
    addr: std::net::SocketAddr,
    state: Arc<ScpState>,
}

async fn spawn_scp(behavior: Behavior) -> Scp {
    let listener = TcpListener::bind("localhost:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ScpState::default());
    let task_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            task_state.associations.fetch_add(1, Ordering::SeqCst);
            serve_one_association(stream, &behavior, &task_state).await;
        }
    });
    Scp { addr, state }
}

fn message_info(message: &DicomMessage) -> (u16, u16, String) {
    let field = message
        .command
        .get(tags::COMMAND_FIELD)
        .map(InMemElement::to_int::<u16>)
        .and_then(Result::ok)
        .expect("request should carry a command field");
    let message_id = message
        .command
        .get(tags::MESSAGE_ID)
        .map(InMemElement::to_int::<u16>)
        .and_then(Result::ok)
        .expect("request should carry a message id");
    let sop_class_uid = message
        .command
        .get(tags::AFFECTED_SOP_CLASS_UID)
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .unwrap_or_default();
    (field, message_id, sop_class_uid)
}

async fn send_response(
    conn: &mut Connection<TcpStream>,
    context_id: u8,
    request_field: u16,
    sop_class_uid: &str,
    message_id: u16,
    status: u16,
) {
    let field = CommandField::try_from(request_field | 0x8000)
        .expect("request field should have a response counterpart");
    let rsp = command::composite_rsp(field, sop_class_uid, message_id, status, false);
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let pdus = message_pdus(&rsp, None, &ts, context_id, SCP_MAX_PDU).unwrap();
    for pdu in &pdus {
        let _ = conn.write_pdu(pdu, None).await;
    }
}

async fn serve_one_association(stream: TcpStream, behavior: &Behavior, state: &Arc<ScpState>) {
    let mut conn = Connection::new(stream, SCP_MAX_PDU, true);

    let rq = match conn.read_pdu().await {
        Ok(pdu) => pdu,
        Err(_) => return,
    };
    let Pdu::AssociationRQ {
        called_ae_title,
        calling_ae_title,
        presentation_contexts,
        user_variables,
        ..
    } = rq
    else {
        return;
    };

    if matches!(behavior, Behavior::Reject) {
        let _ = conn
            .write_pdu(
                &Pdu::AssociationRJ {
                    result: AssociationRJResult::Permanent,
                    source: AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                    ),
                },
                None,
            )
            .await;
        return;
    }

    let results: Vec<PresentationContextResult> = presentation_contexts
        .iter()
        .map(|pc| PresentationContextResult {
            id: pc.id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: pc
                .transfer_syntaxes
                .first()
                .cloned()
                .unwrap_or_else(|| IMPLICIT_VR_LE.to_string()),
        })
        .collect();
    let negotiated: Vec<PresentationContextNegotiated> = presentation_contexts
        .iter()
        .zip(results.iter())
        .map(|(pc, result)| PresentationContextNegotiated {
            id: pc.id,
            reason: result.reason,
            abstract_syntax: pc.abstract_syntax.clone(),
            transfer_syntax: result.transfer_syntax.clone(),
        })
        .collect();

    let mut ac_user_variables = vec![UserVariableItem::MaxLength(SCP_MAX_PDU)];
    if let Some((invoked, performed)) = user_variables.iter().find_map(|item| match item {
        UserVariableItem::AsyncOperationsWindow {
            max_ops_invoked,
            max_ops_performed,
        } => Some((*max_ops_invoked, *max_ops_performed)),
        _ => None,
    }) {
        ac_user_variables.push(UserVariableItem::AsyncOperationsWindow {
            max_ops_invoked: invoked,
            max_ops_performed: performed,
        });
    }

    if conn
        .write_pdu(
            &Pdu::AssociationAC {
                protocol_version: 1,
                called_ae_title,
                calling_ae_title,
                application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
                presentation_contexts: results,
                user_variables: ac_user_variables,
            },
            None,
        )
        .await
        .is_err()
    {
        return;
    }

    let mut assembler = MessageAssembler::new(&negotiated);
    let mut unanswered: Vec<(u8, u16, u16, String)> = Vec::new();
    let mut message_index = 0usize;

    loop {
        let read = if matches!(behavior, Behavior::RespondAfterDrain) {
            match tokio::time::timeout(Duration::from_millis(50), conn.read_pdu()).await {
                Err(_) => {
                    // inbound went idle: answer everything received so far
                    for (context_id, field, message_id, sop) in unanswered.drain(..) {
                        send_response(&mut conn, context_id, field, &sop, message_id, 0x0000)
                            .await;
                    }
                    continue;
                }
                Ok(read) => read,
            }
        } else {
            conn.read_pdu().await
        };

        match read {
            Ok(Pdu::PData { data }) => {
                for pdv in data {
                    let Ok(Some(message)) = assembler.push_pdv(pdv) else {
                        continue;
                    };
                    let (field, message_id, sop_class_uid) = message_info(&message);
                    let context_id = message.presentation_context_id;
                    state
                        .received_message_ids
                        .lock()
                        .unwrap()
                        .push(message_id);
                    message_index += 1;

                    match behavior {
                        Behavior::Silent => {}
                        Behavior::Reject => unreachable!(),
                        Behavior::Scripted(responses) => {
                            for (delay, status) in responses {
                                if !delay.is_zero() {
                                    sleep(*delay).await;
                                }
                                send_response(
                                    &mut conn,
                                    context_id,
                                    field,
                                    &sop_class_uid,
                                    message_id,
                                    *status,
                                )
                                .await;
                            }
                        }
                        Behavior::RespondEvenOnly => {
                            if message_index % 2 == 0 {
                                send_response(
                                    &mut conn,
                                    context_id,
                                    field,
                                    &sop_class_uid,
                                    message_id,
                                    0x0000,
                                )
                                .await;
                            }
                        }
                        Behavior::RespondAfterDrain => {
                            unanswered.push((context_id, field, message_id, sop_class_uid));
                            let len = unanswered.len();
                            state.max_unanswered.fetch_max(len, Ordering::SeqCst);
                        }
                    }
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                let _ = conn.write_pdu(&Pdu::ReleaseRP, None).await;
                return;
            }
            _ => return,
        }
    }
}

/// A stream decorator delaying every write by a fixed latency.
struct SlowWrite<S> {
    inner: S,
    delay: Duration,
    timer: Option<Pin<Box<Sleep>>>,
}

impl<S> SlowWrite<S> {
    fn new(inner: S, delay: Duration) -> Self {
        SlowWrite {
            inner,
            delay,
            timer: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SlowWrite<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SlowWrite<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.delay.is_zero() {
            if this.timer.is_none() {
                this.timer = Some(Box::pin(sleep(this.delay)));
            }
            if let Some(timer) = this.timer.as_mut() {
                ready!(timer.as_mut().poll(cx));
            }
            this.timer = None;
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A connector decorating TCP streams with write latency.
struct SlowWriteConnector {
    address: String,
    delay: Duration,
}

impl Connector for SlowWriteConnector {
    type Stream = SlowWrite<TcpStream>;

    async fn connect(&self) -> ConnectionResult<Self::Stream> {
        let tcp = radlink_ul::connection::TcpConnector::new(self.address.clone());
        let stream = tcp.connect().await?;
        Ok(SlowWrite::new(stream, self.delay))
    }
}

fn find_identifier() -> InMemDicomObject {
    InMemDicomObject::from_element_iter([DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("STUDY"),
    )])
}

fn store_payload(len: usize) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4.5.6"),
        ),
        DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(vec![0x55_u8; len]),
        ),
    ])
}

fn client_for(scp: &Scp) -> DicomClient {
    DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .calling_ae_title("TEST-SCU")
        .into_client()
}

async fn drain_events(events: &mut RequestEvents) -> Vec<RequestEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

/// Scenario: C-FIND against a never-responding peer.
/// The request times out, `send` completes without error,
/// and the response callback never fires.
#[tokio::test(flavor = "multi_thread")]
async fn find_against_silent_peer_times_out() {
    let scp = spawn_scp(Behavior::Silent).await;
    let client = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_millis(300))
        .release_timeout(Duration::from_millis(200))
        .into_client();
    let mut client_events = client.take_events().unwrap();

    let (request, mut events) =
        DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
    let message_id = request.message_id();
    client.add_request(request);

    let started = Instant::now();
    client.send(CancelToken::new()).await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300),
        "send returned before the timeout ({:?})",
        elapsed
    );

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        RequestEvent::TimedOut { timeout } if timeout == Duration::from_millis(300)
    ));

    let mut saw_timeout_event = false;
    while let Ok(event) = client_events.try_recv() {
        if let ClientEvent::RequestTimedOut {
            message_id: id,
            timeout,
        } = event
        {
            assert_eq!(id, message_id);
            assert_eq!(timeout, Duration::from_millis(300));
            saw_timeout_event = true;
        }
    }
    assert!(saw_timeout_event);
}

/// Scenario: C-FIND with three pending responses and a final success,
/// each spaced well within the request timeout.
/// Every response is delivered and no timeout fires.
#[tokio::test(flavor = "multi_thread")]
async fn find_with_paced_pending_responses_completes() {
    let pace = Duration::from_millis(150);
    let scp = spawn_scp(Behavior::Scripted(vec![
        (pace, 0xFF00),
        (pace, 0xFF00),
        (pace, 0xFF00),
        (pace, 0x0000),
    ]))
    .await;
    let client = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_millis(400))
        .into_client();

    let (request, mut events) =
        DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
    client.add_request(request);
    client.send(CancelToken::new()).await.unwrap();

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 4, "expected four responses, got {:?}", events);
    for event in &events[..3] {
        assert!(matches!(
            event,
            RequestEvent::Response(response) if response.status_type == StatusType::Pending
        ));
    }
    assert!(matches!(
        &events[3],
        RequestEvent::Response(response) if response.status_type == StatusType::Success
    ));
}

/// Scenario: C-FIND with one pending response and then silence.
/// The pending response restarts the timeout clock once,
/// then the request times out.
#[tokio::test(flavor = "multi_thread")]
async fn find_with_pending_then_silence_times_out() {
    let scp = spawn_scp(Behavior::Scripted(vec![(Duration::from_millis(100), 0xFF00)])).await;
    let client = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_millis(300))
        .release_timeout(Duration::from_millis(200))
        .into_client();

    let (request, mut events) =
        DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
    client.add_request(request);

    let started = Instant::now();
    client.send(CancelToken::new()).await.unwrap();
    let elapsed = started.elapsed();
    // one pending response at ~100ms, then 300ms of silence
    assert!(
        elapsed >= Duration::from_millis(400),
        "send returned too early ({:?})",
        elapsed
    );

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 2, "unexpected events: {:?}", events);
    assert!(matches!(
        &events[0],
        RequestEvent::Response(response) if response.status_type == StatusType::Pending
    ));
    assert!(matches!(&events[1], RequestEvent::TimedOut { .. }));
}

/// Scenario: a large C-STORE over a slow link.
/// The flush takes several times the request timeout,
/// yet the request completes because the timeout clock
/// only starts after the final fragment is flushed.
#[tokio::test(flavor = "multi_thread")]
async fn slow_store_flush_does_not_trip_the_timeout() {
    let scp = spawn_scp(Behavior::Scripted(vec![(Duration::ZERO, 0x0000)])).await;
    let options = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_millis(75));
    let client = DicomClient::with_connector(
        options,
        SlowWriteConnector {
            address: scp.addr.to_string(),
            delay: Duration::from_millis(5),
        },
    );

    // ~30 data PDUs at 4 KiB each
    let (request, mut events) = DicomRequest::c_store(
        MR_IMAGE_STORAGE,
        "1.2.3.4.5.6",
        store_payload(120_000),
        Priority::Medium,
    );
    client.add_request(request);

    let started = Instant::now();
    client.send(CancelToken::new()).await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(150),
        "the slow link should dominate the elapsed time ({:?})",
        elapsed
    );

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 1, "unexpected events: {:?}", events);
    assert!(matches!(
        &events[0],
        RequestEvent::Response(response) if response.status_type == StatusType::Success
    ));
}

/// Scenario: a C-STORE whose individual PDU writes
/// stall past the request timeout.
/// The request fails with a timeout after the flush attempt completes.
#[tokio::test(flavor = "multi_thread")]
async fn stalled_store_flush_times_out() {
    let scp = spawn_scp(Behavior::Scripted(vec![(Duration::ZERO, 0x0000)])).await;
    let timeout = Duration::from_millis(100);
    let options = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(timeout)
        .release_timeout(Duration::from_millis(200));
    let client = DicomClient::with_connector(
        options,
        SlowWriteConnector {
            address: scp.addr.to_string(),
            delay: Duration::from_millis(150),
        },
    );
    let mut client_events = client.take_events().unwrap();

    let (request, mut events) = DicomRequest::c_store(
        MR_IMAGE_STORAGE,
        "1.2.3.4.5.6",
        store_payload(12_000),
        Priority::Medium,
    );
    let message_id = request.message_id();
    client.add_request(request);
    client.send(CancelToken::new()).await.unwrap();

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 1, "unexpected events: {:?}", events);
    assert!(matches!(
        events[0],
        RequestEvent::TimedOut { timeout: t } if t == timeout
    ));

    let mut saw_timeout_event = false;
    while let Ok(event) = client_events.try_recv() {
        if let ClientEvent::RequestTimedOut { message_id: id, .. } = event {
            assert_eq!(id, message_id);
            saw_timeout_event = true;
        }
    }
    assert!(saw_timeout_event);
}

/// Scenario: six C-FIND requests against a never-responding peer
/// with a batch cap of two requests per association.
/// All six are transmitted across three associations
/// and every one of them times out.
#[tokio::test(flavor = "multi_thread")]
async fn queue_outlasting_one_association_reassociates() {
    let scp = spawn_scp(Behavior::Silent).await;
    let client = Arc::new(
        DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
            .request_timeout(Duration::from_millis(200))
            .release_timeout(Duration::from_millis(100))
            .max_requests_per_association(2)
            .linger(Duration::from_millis(300))
            .into_client(),
    );

    let mut receivers = Vec::new();
    let mut submitted = Vec::new();

    // the first request is queued up front,
    // the rest arrive while the dispatcher is running
    let mut requests = Vec::new();
    for _ in 0..6 {
        let (request, events) =
            DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
        submitted.push(request.message_id());
        receivers.push(events);
        requests.push(request);
    }
    let mut requests = requests.into_iter();
    client.add_request(requests.next().unwrap());

    let adder = {
        let client = client.clone();
        tokio::spawn(async move {
            for request in requests {
                sleep(Duration::from_millis(100)).await;
                client.add_request(request);
            }
        })
    };

    client.send(CancelToken::new()).await.unwrap();
    adder.await.unwrap();

    for events in &mut receivers {
        let events = drain_events(events).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RequestEvent::TimedOut { .. }));
    }

    // every submitted request reached the peer, in three associations
    let mut received = scp.state.received_message_ids.lock().unwrap().clone();
    let mut expected = submitted.clone();
    received.sort_unstable();
    expected.sort_unstable();
    assert_eq!(received, expected);
    assert_eq!(scp.state.associations.load(Ordering::SeqCst), 3);
}

/// A timed-out request does not penalize its pipelined sibling:
/// the sibling completes and the association survives.
#[tokio::test(flavor = "multi_thread")]
async fn sibling_requests_survive_a_timeout() {
    let scp = spawn_scp(Behavior::RespondEvenOnly).await;
    let client = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_millis(300))
        .release_timeout(Duration::from_millis(200))
        .negotiate_async_ops(2, 1)
        .into_client();

    let (first, mut first_events) =
        DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
    let (second, mut second_events) =
        DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
    client.add_request(first);
    client.add_request(second);

    client.send(CancelToken::new()).await.unwrap();

    let first_events = drain_events(&mut first_events).await;
    assert_eq!(first_events.len(), 1);
    assert!(matches!(first_events[0], RequestEvent::TimedOut { .. }));

    let second_events = drain_events(&mut second_events).await;
    assert_eq!(second_events.len(), 1);
    assert!(matches!(
        &second_events[0],
        RequestEvent::Response(response) if response.status_type == StatusType::Success
    ));

    // both requests traveled on a single association
    assert_eq!(scp.state.associations.load(Ordering::SeqCst), 1);
}

/// The number of outstanding requests on one association
/// never exceeds the negotiated asynchronous operations window.
#[rstest]
#[case(1, 6)]
#[case(2, 5)]
#[case(4, 9)]
#[case(8, 8)]
#[tokio::test(flavor = "multi_thread")]
async fn outstanding_requests_respect_the_window(#[case] window: u16, #[case] count: usize) {
    let scp = spawn_scp(Behavior::RespondAfterDrain).await;
    let client = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_secs(2))
        .negotiate_async_ops(window, 1)
        .into_client();

    let mut receivers = Vec::new();
    for _ in 0..count {
        let (request, events) = DicomRequest::c_echo();
        receivers.push(events);
        client.add_request(request);
    }
    client.send(CancelToken::new()).await.unwrap();

    for events in &mut receivers {
        let events = drain_events(events).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RequestEvent::Response(response) if response.status_type == StatusType::Success
        ));
    }

    let max_unanswered = scp.state.max_unanswered.load(Ordering::SeqCst);
    assert!(
        max_unanswered <= window as usize,
        "{} outstanding with a window of {}",
        max_unanswered,
        window
    );
    if window > 1 && count > 2 {
        // the pipeline actually filled beyond synchronous operation
        assert!(
            max_unanswered >= 2,
            "no pipelining observed with a window of {}",
            window
        );
    }
}

/// An association rejection fails every queued request
/// and surfaces through `send`.
#[tokio::test(flavor = "multi_thread")]
async fn rejection_fails_all_queued_requests() {
    let scp = spawn_scp(Behavior::Reject).await;
    let ae_addr: radlink_ul::FullAeAddr = format!("TEST-SCP@{}", scp.addr).parse().unwrap();
    let client = DicomClientOptions::for_ae_addr(&ae_addr).into_client();
    let mut client_events = client.take_events().unwrap();

    let (first, mut first_events) = DicomRequest::c_echo();
    let (second, mut second_events) = DicomRequest::c_echo();
    client.add_request(first);
    client.add_request(second);

    match client.send(CancelToken::new()).await {
        Err(Error::Rejected {
            association_result: AssociationRJResult::Permanent,
            ..
        }) => {}
        other => panic!("expected Rejected, got {:?}", other.map(|_| ())),
    }

    for events in [&mut first_events, &mut second_events] {
        let events = drain_events(events).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RequestEvent::Failed {
                reason: FailureReason::AssociationRejected
            }
        ));
    }

    let mut saw_rejection = false;
    while let Ok(event) = client_events.try_recv() {
        if matches!(event, ClientEvent::AssociationRejected { .. }) {
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);
}

/// Cancellation aborts the association
/// and fails outstanding requests.
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_fails_outstanding_requests() {
    let scp = spawn_scp(Behavior::Silent).await;
    let client = DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
        .request_timeout(Duration::from_secs(30))
        .into_client();

    let (request, mut events) =
        DicomRequest::c_find(STUDY_ROOT_FIND, find_identifier(), Priority::Medium);
    client.add_request(request);

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    match client.send(cancel).await {
        Err(Error::Cancelled { .. }) => {}
        other => panic!("expected Cancelled, got {:?}", other.map(|_| ())),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    canceller.await.unwrap();

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        RequestEvent::Failed {
            reason: FailureReason::Cancelled
        }
    ));
}

/// A second concurrent `send` joins the running drain:
/// both calls resolve once the queue is empty.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_send_calls_join_the_same_run() {
    let scp = spawn_scp(Behavior::Scripted(vec![(Duration::from_millis(50), 0x0000)])).await;
    let client = Arc::new(client_for(&scp));

    let (request, mut events) = DicomRequest::c_echo();
    client.add_request(request);

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.send(CancelToken::new()).await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.send(CancelToken::new()).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let events = drain_events(&mut events).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], RequestEvent::Response(_)));
}

/// A lingering association is reused by requests
/// arriving shortly after the queue drained.
#[tokio::test(flavor = "multi_thread")]
async fn linger_allows_association_reuse() {
    let scp = spawn_scp(Behavior::Scripted(vec![(Duration::ZERO, 0x0000)])).await;
    let client = Arc::new(
        DicomClientOptions::new(scp.addr.to_string(), "TEST-SCP")
            .linger(Duration::from_millis(500))
            .into_client(),
    );

    let (first, mut first_events) = DicomRequest::c_echo();
    client.add_request(first);

    let late_adder = {
        let client = client.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            let (second, events) = DicomRequest::c_echo();
            client.add_request(second);
            events
        })
    };

    client.send(CancelToken::new()).await.unwrap();
    let mut second_events = late_adder.await.unwrap();

    for events in [&mut first_events, &mut second_events] {
        let events = drain_events(events).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RequestEvent::Response(_)));
    }

    // both requests went through one association
    assert_eq!(scp.state.associations.load(Ordering::SeqCst), 1);
}
