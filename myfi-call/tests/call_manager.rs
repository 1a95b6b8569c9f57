use async_trait::async_trait;
use myfi_call::manager::DEFAULT_NO_ANSWER_TIMEOUT;
use myfi_call::{
    CallConfig, CallDeps, CallDirection, CallError, CallHandle, CallHistorySink, CallManager,
    CallObserver, CallRecord, CallSnapshot, CallState, CallStatus, Connectivity, Contact,
    ContactDirectory, EndReason, MediaAccessKind, MediaBackend, MediaError, MediaEvent,
    MediaSession, SignalingOutbox,
};
use myfi_protocol::{CallerInfo, IceCandidate, SdpKind, SessionDescription, SignalingMessage};
use myfi_signaling::client::SignalingEvent;
use myfi_signaling::error::SignalingRuntimeError;
use parking_lot::Mutex;
use pretty_assertions::{assert_eq, assert_matches};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_log::test;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum MediaOp {
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Mute(bool),
    Close,
}

struct MockSession {
    ops: Arc<Mutex<Vec<MediaOp>>>,
    remote_gate: Option<Arc<Notify>>,
}

#[async_trait]
impl MediaSession for MockSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ops.lock().push(MediaOp::CreateOffer);
        Ok(SessionDescription::offer("v=0 local offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ops.lock().push(MediaOp::CreateAnswer);
        Ok(SessionDescription::answer("v=0 local answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let malformed = desc.sdp == "garbage";
        self.ops.lock().push(MediaOp::SetRemote(desc));
        if let Some(gate) = &self.remote_gate {
            gate.notified().await;
        }
        if malformed {
            return Err(MediaError::Negotiation("unparsable sdp".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.ops.lock().push(MediaOp::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) {
        self.ops.lock().push(MediaOp::Close);
    }

    fn set_muted(&self, muted: bool) {
        self.ops.lock().push(MediaOp::Mute(muted));
    }
}

#[derive(Default)]
struct MockBackend {
    ops: Arc<Mutex<Vec<MediaOp>>>,
    creates: AtomicUsize,
    fail: Option<MediaError>,
    gate: Option<Arc<Notify>>,
    remote_gate: Option<Arc<Notify>>,
    initial_candidate: Option<IceCandidate>,
    events_tx: Mutex<Option<mpsc::Sender<MediaEvent>>>,
}

impl MockBackend {
    fn failing(err: MediaError) -> Self {
        Self {
            fail: Some(err),
            ..Default::default()
        }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    async fn emit(&self, event: MediaEvent) {
        let tx = self.events_tx.lock().clone().expect("no media session created");
        tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::Receiver<MediaEvent>), MediaError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::channel(16);
        if let Some(candidate) = &self.initial_candidate {
            tx.try_send(MediaEvent::LocalCandidate(candidate.clone()))
                .unwrap();
        }
        *self.events_tx.lock() = Some(tx);

        let session = MockSession {
            ops: self.ops.clone(),
            remote_gate: self.remote_gate.clone(),
        };
        Ok((Arc::new(session), rx))
    }
}

struct RecordingOutbox(mpsc::UnboundedSender<SignalingMessage>);

#[async_trait]
impl SignalingOutbox for RecordingOutbox {
    async fn send(&self, msg: SignalingMessage) {
        let _ = self.0.send(msg);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Observed {
    State(CallState),
    Incoming(String),
    Error(EndReason),
}

struct RecordingObserver(mpsc::UnboundedSender<Observed>);

impl CallObserver for RecordingObserver {
    fn on_state_change(&self, state: CallState, session: Option<&CallSnapshot>) {
        assert_eq!(session.is_none(), state == CallState::Idle);
        let _ = self.0.send(Observed::State(state));
    }

    fn on_incoming_call(&self, session: &CallSnapshot) {
        let _ = self.0.send(Observed::Incoming(session.peer_id.clone()));
    }

    fn on_error(&self, kind: &EndReason, _message: &str) {
        let _ = self.0.send(Observed::Error(kind.clone()));
    }
}

#[derive(Default)]
struct History(Mutex<Vec<CallRecord>>);

impl CallHistorySink for History {
    fn record(&self, record: CallRecord) {
        self.0.lock().push(record);
    }
}

impl History {
    fn records(&self) -> Vec<CallRecord> {
        self.0.lock().clone()
    }
}

struct StaticDirectory(Vec<Contact>);

#[async_trait]
impl ContactDirectory for StaticDirectory {
    async fn lookup(&self, peer_id: &str) -> anyhow::Result<Option<Contact>> {
        Ok(self.0.iter().find(|c| c.id == peer_id).cloned())
    }
}

struct Harness {
    handle: CallHandle,
    backend: Arc<MockBackend>,
    history: Arc<History>,
    signaling_tx: broadcast::Sender<SignalingEvent>,
    outbox_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    observed_rx: mpsc::UnboundedReceiver<Observed>,
    _shutdown: CancellationToken,
}

impl Harness {
    fn start(backend: MockBackend) -> Self {
        Self::with(backend, CallConfig::default(), None)
    }

    fn with(
        backend: MockBackend,
        config: CallConfig,
        directory: Option<Arc<dyn ContactDirectory>>,
    ) -> Self {
        let backend = Arc::new(backend);
        let history = Arc::new(History::default());
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (observed_tx, observed_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = broadcast::channel(32);
        let shutdown = CancellationToken::new();

        let deps = CallDeps {
            media: backend.clone(),
            outbox: Arc::new(RecordingOutbox(outbox_tx)),
            observer: Arc::new(RecordingObserver(observed_tx)),
            directory,
            history: history.clone(),
        };
        let (handle, _task) = CallManager::spawn(config, deps, signaling_rx, shutdown.clone());

        Self {
            handle,
            backend,
            history,
            signaling_tx,
            outbox_rx,
            observed_rx,
            _shutdown: shutdown,
        }
    }

    fn deliver(&self, msg: SignalingMessage) {
        self.signaling_tx
            .send(SignalingEvent::Message(msg))
            .unwrap();
    }

    async fn sent(&mut self) -> SignalingMessage {
        tokio::time::timeout(TIMEOUT, self.outbox_rx.recv())
            .await
            .expect("timed out waiting for outbound signaling message")
            .expect("outbox closed")
    }

    fn assert_nothing_sent(&mut self) {
        assert_matches!(self.outbox_rx.try_recv(), Err(_));
    }

    async fn wait_for(&mut self, expected: Observed) {
        tokio::time::timeout(TIMEOUT, async {
            while let Some(observed) = self.observed_rx.recv().await {
                if observed == expected {
                    return;
                }
            }
            panic!("observer channel closed");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
    }

    async fn wait_state(&mut self, state: CallState) {
        self.wait_for(Observed::State(state)).await;
    }

    fn ops(&self) -> Vec<MediaOp> {
        self.backend.ops.lock().clone()
    }

    async fn wait_ops(&self, len: usize) -> Vec<MediaOp> {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let ops = self.ops();
                if ops.len() >= len {
                    return ops;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for media operations")
    }

    /// Places a call to `42` and drives it to active.
    async fn establish_outgoing(&mut self) {
        self.handle.initiate("42").await.unwrap();
        assert_matches!(self.sent().await, SignalingMessage::CallUser { .. });
        self.deliver(SignalingMessage::CallAnswered {
            callee_id: Some("42".to_string()),
            call_id: Some("7".to_string()),
            answer: remote_answer(),
        });
        self.wait_state(CallState::Active).await;
    }
}

fn remote_offer() -> SessionDescription {
    SessionDescription::offer("v=0 remote offer")
}

fn remote_answer() -> SessionDescription {
    SessionDescription::answer("v=0 remote answer")
}

fn candidate(n: u8) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

fn incoming_call(caller_id: &str) -> SignalingMessage {
    SignalingMessage::IncomingCall {
        caller_id: caller_id.to_string(),
        caller: CallerInfo {
            caller_name: Some("Alice".to_string()),
            caller_phone: Some("+43 660 1234".to_string()),
            caller_avatar: None,
        },
        call_id: Some("99".to_string()),
        offer: remote_offer(),
    }
}

#[test(tokio::test)]
async fn outgoing_call_lifecycle() {
    let mut h = Harness::start(MockBackend::default());

    h.handle.initiate("42").await.unwrap();
    h.wait_state(CallState::OutgoingPending).await;
    assert_matches!(
        h.sent().await,
        SignalingMessage::CallUser { callee_id, offer }
            if callee_id == "42" && offer.kind == SdpKind::Offer
    );

    h.deliver(SignalingMessage::CallAnswered {
        callee_id: Some("42".to_string()),
        call_id: Some("7".to_string()),
        answer: remote_answer(),
    });
    h.wait_state(CallState::Connecting).await;
    h.wait_state(CallState::Active).await;

    let snapshot = h.handle.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Active);
    assert_eq!(snapshot.session_id.as_deref(), Some("7"));
    assert_eq!(snapshot.direction, CallDirection::Outgoing);
    assert!(snapshot.elapsed().is_some());

    h.handle.hang_up().await.unwrap();
    assert_matches!(
        h.sent().await,
        SignalingMessage::HangUp { other_user_id, call_id: Some(call_id), .. }
            if other_user_id == "42" && call_id == "7"
    );
    h.wait_state(CallState::Ended).await;
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();

    assert_eq!(
        h.ops(),
        vec![
            MediaOp::CreateOffer,
            MediaOp::SetRemote(remote_answer()),
            MediaOp::Close
        ]
    );
    assert_eq!(h.handle.snapshot(), None);

    let records = h.history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Completed);
    assert_eq!(records[0].peer_identity, "42");
}

#[test(tokio::test)]
async fn early_candidates_are_applied_once_in_order() {
    let mut h = Harness::start(MockBackend::default());

    h.deliver(incoming_call("7"));
    h.wait_for(Observed::Incoming("7".to_string())).await;
    assert_eq!(
        h.handle.snapshot().map(|s| s.display_name().to_string()),
        Some("Alice".to_string())
    );

    for (sender, n) in [("7", 1), ("8", 9), ("7", 2)] {
        h.deliver(SignalingMessage::IceCandidate {
            recipient_id: None,
            sender_id: Some(sender.to_string()),
            candidate: candidate(n),
        });
    }

    h.handle.accept().await.unwrap();
    assert_matches!(
        h.sent().await,
        SignalingMessage::AnswerCall { caller_id, call_id: Some(call_id), answer }
            if caller_id == "7" && call_id == "99" && answer.kind == SdpKind::Answer
    );
    h.wait_state(CallState::Active).await;
    assert_eq!(
        h.handle.snapshot().and_then(|s| s.session_id),
        Some("99".to_string())
    );

    h.deliver(SignalingMessage::IceCandidate {
        recipient_id: None,
        sender_id: Some("7".to_string()),
        candidate: candidate(3),
    });

    let ops = h.wait_ops(5).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ops, h.ops());
    assert_eq!(
        ops,
        vec![
            MediaOp::SetRemote(remote_offer()),
            MediaOp::CreateAnswer,
            MediaOp::AddCandidate(candidate(1)),
            MediaOp::AddCandidate(candidate(2)),
            MediaOp::AddCandidate(candidate(3)),
        ]
    );
}

#[test(tokio::test)]
async fn local_candidates_follow_the_offer() {
    let mut h = Harness::start(MockBackend {
        initial_candidate: Some(candidate(5)),
        ..Default::default()
    });

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });
    assert_matches!(
        h.sent().await,
        SignalingMessage::IceCandidate { recipient_id: Some(recipient), sender_id: None, candidate: c }
            if recipient == "42" && c == candidate(5)
    );
}

#[test(tokio::test)]
async fn hang_up_while_ringing_sends_single_hang_up() {
    let mut h = Harness::start(MockBackend::default());

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });

    h.handle.hang_up().await.unwrap();
    assert_matches!(
        h.sent().await,
        SignalingMessage::HangUp { other_user_id, call_id: None, duration: 0 }
            if other_user_id == "42"
    );
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();

    assert_eq!(h.ops().last(), Some(&MediaOp::Close));
    assert_eq!(h.history.records()[0].status, CallStatus::Missed);
    assert_matches!(h.handle.hang_up().await, Err(CallError::NoCall));
}

#[test(tokio::test)]
async fn reject_incoming_call() {
    let mut h = Harness::start(MockBackend::default());

    h.deliver(incoming_call("7"));
    h.wait_for(Observed::Incoming("7".to_string())).await;

    h.handle.reject().await.unwrap();
    assert_matches!(
        h.sent().await,
        SignalingMessage::RejectCall { caller_id, call_id: Some(call_id) }
            if caller_id == "7" && call_id == "99"
    );
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();

    assert_eq!(h.backend.creates.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.history.records(),
        vec![CallRecord {
            peer_identity: "7".to_string(),
            direction: CallDirection::Incoming,
            duration_seconds: 0,
            status: CallStatus::Rejected,
        }]
    );
}

#[test(tokio::test)]
async fn hang_up_incoming_call_rejects_it() {
    let mut h = Harness::start(MockBackend::default());

    h.deliver(incoming_call("7"));
    h.wait_for(Observed::Incoming("7".to_string())).await;

    h.handle.hang_up().await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::RejectCall { .. });
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();
}

#[test(tokio::test)]
async fn second_incoming_call_is_rejected_while_active() {
    let mut h = Harness::start(MockBackend::default());
    h.establish_outgoing().await;

    h.deliver(incoming_call("8"));
    assert_matches!(
        h.sent().await,
        SignalingMessage::RejectCall { caller_id, .. } if caller_id == "8"
    );

    let snapshot = h.handle.snapshot().unwrap();
    assert_eq!(snapshot.peer_id, "42");
    assert_eq!(snapshot.state, CallState::Active);
    assert_eq!(
        h.history.records(),
        vec![CallRecord {
            peer_identity: "8".to_string(),
            direction: CallDirection::Incoming,
            duration_seconds: 0,
            status: CallStatus::Missed,
        }]
    );
    assert_matches!(h.handle.initiate("9").await, Err(CallError::Busy));
}

#[test(tokio::test(start_paused = true))]
async fn unanswered_call_times_out() {
    let mut h = Harness::start(MockBackend::default());

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });

    tokio::time::advance(DEFAULT_NO_ANSWER_TIMEOUT).await;
    h.wait_for(Observed::Error(EndReason::NoAnswer)).await;
    assert_matches!(h.sent().await, SignalingMessage::HangUp { duration: 0, .. });
    h.wait_state(CallState::Idle).await;

    assert_eq!(h.handle.snapshot(), None);
    assert_eq!(h.history.records()[0].status, CallStatus::Missed);
}

#[test(tokio::test(start_paused = true))]
async fn duration_is_reported_in_whole_seconds() {
    let mut h = Harness::start(MockBackend::default());
    h.establish_outgoing().await;

    tokio::time::advance(Duration::from_millis(3_400)).await;
    h.handle.hang_up().await.unwrap();

    assert_matches!(h.sent().await, SignalingMessage::HangUp { duration: 3, .. });
    h.wait_state(CallState::Idle).await;
    assert_eq!(h.history.records()[0].duration_seconds, 3);
}

#[test(tokio::test)]
async fn media_access_denied_sends_nothing() {
    let mut h = Harness::start(MockBackend::failing(MediaError::MediaAccess {
        kind: MediaAccessKind::Denied,
        message: "permission denied".to_string(),
    }));

    h.handle.initiate("42").await.unwrap();
    h.wait_for(Observed::Error(EndReason::MediaAccess(MediaAccessKind::Denied)))
        .await;
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();

    assert_eq!(h.history.records()[0].status, CallStatus::Failed);
}

#[test(tokio::test)]
async fn media_failure_on_accept_rejects_caller() {
    let mut h = Harness::start(MockBackend::failing(MediaError::MediaAccess {
        kind: MediaAccessKind::NotFound,
        message: "no input device".to_string(),
    }));

    h.deliver(incoming_call("7"));
    h.wait_for(Observed::Incoming("7".to_string())).await;
    h.handle.accept().await.unwrap();

    h.wait_for(Observed::Error(EndReason::MediaAccess(MediaAccessKind::NotFound)))
        .await;
    assert_matches!(h.sent().await, SignalingMessage::RejectCall { .. });
    h.wait_state(CallState::Idle).await;
}

#[test(tokio::test)]
async fn signaling_disconnect_ends_active_call() {
    let mut h = Harness::start(MockBackend::default());
    h.establish_outgoing().await;

    h.signaling_tx
        .send(SignalingEvent::Error(SignalingRuntimeError::Disconnected))
        .unwrap();
    h.wait_for(Observed::Error(EndReason::ConnectionLost)).await;
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();
    assert_eq!(h.ops().last(), Some(&MediaOp::Close));

    // reconnecting does not bring the call back
    h.signaling_tx.send(SignalingEvent::Connected).unwrap();
    h.deliver(SignalingMessage::CallEnded {
        user_id: Some("42".to_string()),
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.handle.snapshot(), None);
    assert_matches!(h.observed_rx.try_recv(), Err(_));
}

#[test(tokio::test)]
async fn late_offer_after_hang_up_is_discarded() {
    let gate = Arc::new(Notify::new());
    let mut h = Harness::start(MockBackend::gated(gate.clone()));

    h.handle.initiate("42").await.unwrap();
    h.wait_state(CallState::OutgoingPending).await;
    h.handle.hang_up().await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::HangUp { .. });
    h.wait_state(CallState::Idle).await;

    gate.notify_one();
    assert_eq!(
        h.wait_ops(2).await,
        vec![MediaOp::CreateOffer, MediaOp::Close]
    );
    h.assert_nothing_sent();
    assert_eq!(h.handle.snapshot(), None);
}

#[test(tokio::test)]
async fn relay_failure_reason_is_surfaced() {
    let mut h = Harness::start(MockBackend::default());

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });

    h.deliver(SignalingMessage::CallFailed {
        reason: "User is offline".to_string(),
    });
    h.wait_for(Observed::Error(EndReason::PeerFailed(
        "User is offline".to_string(),
    )))
    .await;
    h.wait_state(CallState::Idle).await;
    h.assert_nothing_sent();
}

#[test(tokio::test)]
async fn peer_rejection_ends_call() {
    let mut h = Harness::start(MockBackend::default());

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });

    h.deliver(SignalingMessage::CallRejected {});
    h.wait_for(Observed::Error(EndReason::PeerRejected)).await;
    h.wait_state(CallState::Idle).await;
    assert_eq!(h.history.records()[0].status, CallStatus::Rejected);

    // stale terminal events are ignored
    h.deliver(SignalingMessage::CallEnded { user_id: None });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_matches!(h.observed_rx.try_recv(), Err(_));
}

#[test(tokio::test)]
async fn offline_contact_fails_before_media() {
    let directory = StaticDirectory(vec![Contact {
        id: "42".to_string(),
        display_name: "Bob".to_string(),
        phone: None,
        online: false,
    }]);
    let mut h = Harness::with(
        MockBackend::default(),
        CallConfig::default(),
        Some(Arc::new(directory)),
    );

    h.handle.initiate("42").await.unwrap();
    h.wait_for(Observed::Error(EndReason::PeerOffline)).await;
    h.wait_state(CallState::Idle).await;

    h.assert_nothing_sent();
    assert_eq!(h.backend.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.history.records()[0].status, CallStatus::Missed);
}

#[test(tokio::test)]
async fn transport_failure_ends_active_call() {
    let mut h = Harness::start(MockBackend::default());
    h.establish_outgoing().await;

    h.backend
        .emit(MediaEvent::Connectivity(Connectivity::Failed))
        .await;
    h.wait_for(Observed::Error(EndReason::TransportFailed(
        "failed".to_string(),
    )))
    .await;
    assert_matches!(h.sent().await, SignalingMessage::HangUp { .. });
    h.wait_state(CallState::Idle).await;
}

#[test(tokio::test)]
async fn malformed_answer_aborts_call() {
    let mut h = Harness::start(MockBackend::default());

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });
    h.deliver(SignalingMessage::CallAnswered {
        callee_id: None,
        call_id: None,
        answer: SessionDescription::answer("garbage"),
    });

    h.wait_for(Observed::Error(EndReason::NegotiationFailed(
        "unparsable sdp".to_string(),
    )))
    .await;
    assert_matches!(h.sent().await, SignalingMessage::HangUp { .. });
    h.wait_state(CallState::Idle).await;
}

#[test(tokio::test)]
async fn mute_toggles_transport() {
    let mut h = Harness::start(MockBackend::default());
    assert_matches!(h.handle.toggle_mute().await, Err(CallError::NoCall));

    h.establish_outgoing().await;
    assert_eq!(h.handle.toggle_mute().await, Ok(true));
    assert!(h.handle.snapshot().unwrap().muted);
    assert_eq!(h.handle.toggle_mute().await, Ok(false));

    assert_eq!(
        h.ops()[2..],
        [MediaOp::Mute(true), MediaOp::Mute(false)]
    );
}

#[test(tokio::test)]
async fn invalid_commands_are_rejected() {
    let mut h = Harness::start(MockBackend::default());
    assert_matches!(h.handle.accept().await, Err(CallError::NoIncomingCall));
    assert_matches!(h.handle.reject().await, Err(CallError::NoIncomingCall));
    assert_matches!(h.handle.hang_up().await, Err(CallError::NoCall));

    h.establish_outgoing().await;
    assert_matches!(h.handle.accept().await, Err(CallError::NoIncomingCall));
}

#[test(tokio::test)]
async fn crossed_calls_yield_to_higher_ranked_caller() {
    let config = CallConfig {
        local_id: Some("9".to_string()),
        ..Default::default()
    };
    let mut h = Harness::with(MockBackend::default(), config, None);

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });

    h.deliver(incoming_call("42"));
    h.wait_for(Observed::Incoming("42".to_string())).await;

    let snapshot = h.handle.snapshot().unwrap();
    assert_eq!(snapshot.direction, CallDirection::Incoming);
    assert_eq!(snapshot.state, CallState::IncomingPending);
    assert_eq!(h.ops(), vec![MediaOp::CreateOffer, MediaOp::Close]);
    h.assert_nothing_sent();
}

#[test(tokio::test)]
async fn crossed_calls_keep_outgoing_call_for_lower_id() {
    let config = CallConfig {
        local_id: Some("1".to_string()),
        ..Default::default()
    };
    let mut h = Harness::with(MockBackend::default(), config, None);

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });

    h.deliver(incoming_call("42"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshot = h.handle.snapshot().unwrap();
    assert_eq!(snapshot.direction, CallDirection::Outgoing);
    assert_eq!(snapshot.state, CallState::OutgoingPending);
    h.assert_nothing_sent();
}

#[test(tokio::test)]
async fn candidates_during_answer_are_applied_in_order() {
    let remote_gate = Arc::new(Notify::new());
    let mut h = Harness::start(MockBackend {
        remote_gate: Some(remote_gate.clone()),
        ..Default::default()
    });

    h.handle.initiate("42").await.unwrap();
    assert_matches!(h.sent().await, SignalingMessage::CallUser { .. });
    h.deliver(SignalingMessage::CallAnswered {
        callee_id: Some("42".to_string()),
        call_id: Some("7".to_string()),
        answer: remote_answer(),
    });
    h.wait_state(CallState::Connecting).await;
    h.wait_ops(2).await;

    for n in [1, 2] {
        h.deliver(SignalingMessage::IceCandidate {
            recipient_id: None,
            sender_id: Some("42".to_string()),
            candidate: candidate(n),
        });
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        h.ops(),
        vec![MediaOp::CreateOffer, MediaOp::SetRemote(remote_answer())]
    );

    remote_gate.notify_one();
    h.wait_state(CallState::Active).await;
    h.deliver(SignalingMessage::IceCandidate {
        recipient_id: None,
        sender_id: Some("42".to_string()),
        candidate: candidate(3),
    });

    let ops = h.wait_ops(5).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ops, h.ops());
    assert_eq!(
        ops,
        vec![
            MediaOp::CreateOffer,
            MediaOp::SetRemote(remote_answer()),
            MediaOp::AddCandidate(candidate(1)),
            MediaOp::AddCandidate(candidate(2)),
            MediaOp::AddCandidate(candidate(3)),
        ]
    );
}

#[test(tokio::test)]
async fn lagged_signaling_ends_call() {
    let mut h = Harness::start(MockBackend::default());

    h.deliver(incoming_call("7"));
    h.wait_for(Observed::Incoming("7".to_string())).await;

    // More messages than the event channel holds, sent before the manager runs again.
    for n in 0..40 {
        h.deliver(SignalingMessage::IceCandidate {
            recipient_id: None,
            sender_id: Some("7".to_string()),
            candidate: candidate(n),
        });
    }

    h.wait_for(Observed::Error(EndReason::ConnectionLost)).await;
    assert_matches!(
        h.sent().await,
        SignalingMessage::RejectCall { caller_id, call_id: Some(call_id) }
            if caller_id == "7" && call_id == "99"
    );
    h.wait_state(CallState::Idle).await;
    assert_eq!(h.handle.snapshot(), None);
    assert_matches!(h.handle.accept().await, Err(CallError::NoIncomingCall));
    assert!(!h.ops().contains(&MediaOp::CreateAnswer));
}
