use crate::error::{CallError, EndReason};
use crate::media::{Connectivity, MediaBackend, MediaEvent, MediaSession};
use crate::observer::{CallHistorySink, CallObserver, CallRecord, CallStatus, ContactDirectory};
use crate::outbox::SignalingOutbox;
use crate::session::{CallDirection, CallSession, CallSnapshot, CallState};
use myfi_protocol::{CallerInfo, IceCandidate, SessionDescription, SignalingMessage};
use myfi_signaling::client::SignalingEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const COMMAND_CHANNEL_SIZE: usize = 32;
pub const DEFAULT_NO_ANSWER_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an outgoing call may ring before it ends with [`EndReason::NoAnswer`].
    pub no_answer_timeout: Duration,
    /// Own user ID. Used to settle calls both sides place at each other at the same time; without
    /// it such calls are treated like any other call while busy.
    pub local_id: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            no_answer_timeout: DEFAULT_NO_ANSWER_TIMEOUT,
            local_id: None,
        }
    }
}

/// Collaborators the call manager drives.
#[derive(Clone)]
pub struct CallDeps {
    pub media: Arc<dyn MediaBackend>,
    pub outbox: Arc<dyn SignalingOutbox>,
    pub observer: Arc<dyn CallObserver>,
    pub directory: Option<Arc<dyn ContactDirectory>>,
    pub history: Arc<dyn CallHistorySink>,
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate { peer_id: String, reply: Reply<()> },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    HangUp { reply: Reply<()> },
    ToggleMute { reply: Reply<bool> },
}

/// Cloneable handle for issuing user actions to a running [`CallManager`].
#[derive(Clone)]
pub struct CallHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<Option<CallSnapshot>>,
}

impl CallHandle {
    /// Starts an outgoing call. Returns once the attempt is registered; its outcome is reported
    /// through the observer.
    pub async fn initiate(&self, peer_id: impl Into<String>) -> Result<(), CallError> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::Initiate { peer_id, reply })
            .await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    /// Returns the new mute state.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CallSnapshot>> {
        self.snapshot_rx.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| CallError::Stopped)?;
        reply_rx.await.map_err(|_| CallError::Stopped)?
    }
}

enum Outcome {
    OfferReady {
        transport: Arc<dyn MediaSession>,
        events: mpsc::Receiver<MediaEvent>,
        offer: SessionDescription,
    },
    AnswerReady {
        transport: Arc<dyn MediaSession>,
        events: mpsc::Receiver<MediaEvent>,
        answer: SessionDescription,
    },
    RemoteApplied,
    Failed {
        reason: EndReason,
        transport: Option<Arc<dyn MediaSession>>,
    },
}

impl Outcome {
    fn into_transport(self) -> Option<Arc<dyn MediaSession>> {
        match self {
            Outcome::OfferReady { transport, .. } | Outcome::AnswerReady { transport, .. } => {
                Some(transport)
            }
            Outcome::Failed { transport, .. } => transport,
            Outcome::RemoteApplied => None,
        }
    }
}

/// Call state machine.
///
/// Runs as a single task owning the current [`CallSession`]. User commands, signaling events,
/// media events and the results of asynchronous media operations are all processed in that task.
/// Operation results are tagged with the attempt that started them; results arriving after their
/// attempt ended are discarded and any transport they produced is closed.
pub struct CallManager {
    config: CallConfig,
    deps: CallDeps,
    session: Option<CallSession>,
    last_attempt: u64,
    outcome_tx: mpsc::UnboundedSender<(u64, Outcome)>,
    media_tx: mpsc::UnboundedSender<(u64, MediaEvent)>,
    snapshot_tx: watch::Sender<Option<CallSnapshot>>,
}

impl CallManager {
    pub fn spawn(
        config: CallConfig,
        deps: CallDeps,
        signaling_rx: broadcast::Receiver<SignalingEvent>,
        shutdown_token: CancellationToken,
    ) -> (CallHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let manager = Self {
            config,
            deps,
            session: None,
            last_attempt: 0,
            outcome_tx,
            media_tx,
            snapshot_tx,
        };

        let task = tokio::spawn(manager.run(
            cmd_rx,
            signaling_rx,
            outcome_rx,
            media_rx,
            shutdown_token,
        ));

        (
            CallHandle {
                cmd_tx,
                snapshot_rx,
            },
            task,
        )
    }

    #[instrument(level = "debug", name = "call_manager", skip_all)]
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut signaling_rx: broadcast::Receiver<SignalingEvent>,
        mut outcome_rx: mpsc::UnboundedReceiver<(u64, Outcome)>,
        mut media_rx: mpsc::UnboundedReceiver<(u64, MediaEvent)>,
        shutdown_token: CancellationToken,
    ) {
        tracing::debug!("Call manager started");

        loop {
            let deadline = self
                .session
                .as_ref()
                .and_then(|session| session.no_answer_deadline);

            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Shutdown requested");
                    if self.session.is_some() {
                        self.end_call(EndReason::HungUp, true).await;
                    }
                    break;
                }

                Some((attempt, outcome)) = outcome_rx.recv() => {
                    self.handle_outcome(attempt, outcome).await;
                }

                Some((attempt, event)) = media_rx.recv() => {
                    self.handle_media_event(attempt, event).await;
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::debug!("All call handles dropped");
                        if self.session.is_some() {
                            self.end_call(EndReason::HungUp, true).await;
                        }
                        break;
                    }
                },

                event = signaling_rx.recv() => match event {
                    Ok(event) => self.handle_signaling_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(?skipped, "Signaling events lagged");
                        // Dropped messages may include candidates or the remote end.
                        if self.session.is_some() {
                            self.end_call(EndReason::ConnectionLost, true).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Signaling event stream closed");
                        if self.session.is_some() {
                            self.end_call(EndReason::ConnectionLost, false).await;
                        }
                        break;
                    }
                },

                _ = sleep_until(deadline) => self.on_no_answer().await,
            }
        }

        tracing::debug!("Call manager stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Initiate { peer_id, reply } => {
                let _ = reply.send(self.initiate(peer_id));
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept());
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
        }
    }

    fn next_attempt(&mut self) -> u64 {
        self.last_attempt += 1;
        self.last_attempt
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.attempt == attempt)
    }

    #[instrument(level = "debug", skip(self), err)]
    fn initiate(&mut self, peer_id: String) -> Result<(), CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }

        let attempt = self.next_attempt();
        let deadline = Instant::now() + self.config.no_answer_timeout;
        self.session = Some(CallSession::outgoing(attempt, peer_id.clone(), deadline));
        self.notify_state();

        let media = self.deps.media.clone();
        let directory = self.deps.directory.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(
            async move {
                let outcome = prepare_offer(media, directory, &peer_id).await;
                let _ = outcome_tx.send((attempt, outcome));
            }
            .in_current_span(),
        );

        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    fn accept(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoIncomingCall);
        };
        if session.direction != CallDirection::Incoming {
            return Err(CallError::NoIncomingCall);
        }
        if session.state != CallState::IncomingPending {
            return Err(CallError::InvalidState(session.state));
        }
        let Some(offer) = session.pending_remote_description.take() else {
            return Err(CallError::MissingOffer);
        };

        session.state = CallState::Connecting;
        let attempt = session.attempt;
        self.notify_state();

        let media = self.deps.media.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(
            async move {
                let outcome = prepare_answer(media, offer).await;
                let _ = outcome_tx.send((attempt, outcome));
            }
            .in_current_span(),
        );

        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn reject(&mut self) -> Result<(), CallError> {
        match &self.session {
            None => return Err(CallError::NoIncomingCall),
            Some(session) if session.direction != CallDirection::Incoming => {
                return Err(CallError::NoIncomingCall);
            }
            Some(session) if session.state != CallState::IncomingPending => {
                return Err(CallError::InvalidState(session.state));
            }
            Some(_) => {}
        }

        self.end_call(EndReason::Rejected, true).await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn hang_up(&mut self) -> Result<(), CallError> {
        let Some(session) = &self.session else {
            return Err(CallError::NoCall);
        };

        let reason = if session.state == CallState::IncomingPending {
            EndReason::Rejected
        } else {
            EndReason::HungUp
        };
        self.end_call(reason, true).await;
        Ok(())
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoCall);
        };

        session.muted = !session.muted;
        if let Some(transport) = &session.transport {
            transport.set_muted(session.muted);
        }
        let muted = session.muted;
        tracing::debug!(?muted, "Toggled microphone mute");
        self.publish();
        Ok(muted)
    }

    async fn handle_outcome(&mut self, attempt: u64, outcome: Outcome) {
        if !self.is_current(attempt) {
            tracing::debug!(?attempt, "Discarding result of a superseded call attempt");
            if let Some(transport) = outcome.into_transport() {
                transport.close().await;
            }
            return;
        }

        match outcome {
            Outcome::OfferReady {
                transport,
                events,
                offer,
            } => self.on_offer_ready(transport, events, offer).await,
            Outcome::AnswerReady {
                transport,
                events,
                answer,
            } => self.on_answer_ready(transport, events, answer).await,
            Outcome::RemoteApplied => self.on_remote_applied(),
            Outcome::Failed { reason, transport } => {
                tracing::warn!(%reason, "Call setup failed");
                if let Some(transport) = transport {
                    transport.close().await;
                }
                let notify_peer = self
                    .session
                    .as_ref()
                    .is_some_and(CallSession::peer_aware);
                self.end_call(reason, notify_peer).await;
            }
        }
    }

    async fn on_offer_ready(
        &mut self,
        transport: Arc<dyn MediaSession>,
        events: mpsc::Receiver<MediaEvent>,
        offer: SessionDescription,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        adopt_transport(session, transport, events, self.media_tx.clone());
        session.signaled = true;

        let mut outbound = vec![SignalingMessage::CallUser {
            callee_id: session.peer_id.clone(),
            offer,
        }];
        outbound.extend(
            session
                .take_local_candidates()
                .into_iter()
                .map(|candidate| candidate_message(&session.peer_id, candidate)),
        );

        tracing::debug!(peer_id = %session.peer_id, "Sending call offer");
        self.send_all(outbound).await;
    }

    async fn on_answer_ready(
        &mut self,
        transport: Arc<dyn MediaSession>,
        events: mpsc::Receiver<MediaEvent>,
        answer: SessionDescription,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        adopt_transport(session, transport.clone(), events, self.media_tx.clone());
        session.signaled = true;
        session.set_session_id(session.offered_call_id.clone());
        session.start_candidate_pump(spawn_candidate_pump(transport));
        session.activate(Instant::now());

        let mut outbound = vec![SignalingMessage::AnswerCall {
            caller_id: session.peer_id.clone(),
            answer,
            call_id: session.offered_call_id.clone(),
        }];
        outbound.extend(
            session
                .take_local_candidates()
                .into_iter()
                .map(|candidate| candidate_message(&session.peer_id, candidate)),
        );

        tracing::info!(peer_id = %session.peer_id, "Call answered");
        self.notify_state();
        self.send_all(outbound).await;
    }

    fn on_remote_applied(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(transport) = session.transport.clone() else {
            tracing::warn!("Remote description applied without transport");
            return;
        };

        session.start_candidate_pump(spawn_candidate_pump(transport));
        session.activate(Instant::now());
        tracing::info!(peer_id = %session.peer_id, "Call connected");
        self.notify_state();
    }

    async fn handle_media_event(&mut self, attempt: u64, event: MediaEvent) {
        if !self.is_current(attempt) {
            tracing::trace!(?attempt, ?event, "Ignoring media event of a superseded attempt");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = session.push_local_candidate(candidate) {
                    let msg = candidate_message(&session.peer_id, candidate);
                    self.deps.outbox.send(msg).await;
                }
            }
            MediaEvent::Connectivity(state) => {
                tracing::debug!(?state, "Media connectivity changed");
                let live = matches!(session.state, CallState::Connecting | CallState::Active);
                match state {
                    Connectivity::Disconnected | Connectivity::Failed if live => {
                        let reason = EndReason::TransportFailed(
                            format!("{state:?}").to_lowercase(),
                        );
                        self.end_call(reason, true).await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => tracing::debug!("Signaling connected"),
            SignalingEvent::Message(msg) => self.handle_message(msg).await,
            SignalingEvent::Error(err) => {
                if err.is_fatal() && self.session.is_some() {
                    tracing::warn!(?err, "Signaling connection lost during call");
                    self.end_call(EndReason::ConnectionLost, false).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: SignalingMessage) {
        tracing::trace!(message_type = msg.message_type(), "Handling signaling message");
        match msg {
            SignalingMessage::IncomingCall {
                caller_id,
                caller,
                call_id,
                offer,
            } => self.on_incoming_call(caller_id, caller, call_id, offer).await,
            SignalingMessage::CallAnswered {
                callee_id,
                call_id,
                answer,
            } => self.on_call_answered(callee_id, call_id, answer),
            SignalingMessage::IceCandidate {
                sender_id,
                candidate,
                ..
            } => self.on_remote_candidate(sender_id, candidate),
            SignalingMessage::CallRejected {} => {
                self.on_remote_end(None, EndReason::PeerRejected).await;
            }
            SignalingMessage::CallEnded { user_id } => {
                self.on_remote_end(user_id, EndReason::PeerEnded).await;
            }
            SignalingMessage::CallFailed { reason } => {
                self.on_remote_end(None, EndReason::PeerFailed(reason))
                    .await;
            }
            other => {
                tracing::debug!(
                    message_type = other.message_type(),
                    "Ignoring unexpected signaling message"
                );
            }
        }
    }

    async fn on_incoming_call(
        &mut self,
        caller_id: String,
        caller: CallerInfo,
        call_id: Option<String>,
        offer: SessionDescription,
    ) {
        if let Some(session) = &self.session {
            let glare = session.direction == CallDirection::Outgoing
                && session.state == CallState::OutgoingPending
                && session.peer_id == caller_id;

            match (&self.config.local_id, glare) {
                (Some(local_id), true) if *local_id < caller_id => {
                    // our own call reaches the peer and wins there
                    tracing::debug!(peer_id = %caller_id, "Crossed calls, keeping outgoing call");
                    return;
                }
                (Some(_), true) => {
                    tracing::debug!(peer_id = %caller_id, "Crossed calls, yielding to incoming call");
                    if let Some(mut superseded) = self.session.take() {
                        superseded.stop_candidate_pump();
                        if let Some(transport) = superseded.transport.take() {
                            transport.close().await;
                        }
                    }
                }
                _ => {
                    tracing::info!(peer_id = %caller_id, "Busy, rejecting incoming call");
                    self.deps
                        .outbox
                        .send(SignalingMessage::RejectCall {
                            caller_id: caller_id.clone(),
                            call_id,
                        })
                        .await;
                    self.deps.history.record(CallRecord {
                        peer_identity: caller_id,
                        direction: CallDirection::Incoming,
                        duration_seconds: 0,
                        status: CallStatus::Missed,
                    });
                    return;
                }
            }
        }

        let attempt = self.next_attempt();
        tracing::info!(peer_id = %caller_id, ?call_id, "Incoming call");
        let session = CallSession::incoming(attempt, caller_id, caller, call_id, offer);
        let snapshot = session.snapshot();
        self.session = Some(session);
        self.notify_state();
        self.deps.observer.on_incoming_call(&snapshot);
    }

    fn on_call_answered(
        &mut self,
        callee_id: Option<String>,
        call_id: Option<String>,
        answer: SessionDescription,
    ) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("Ignoring answer without call");
            return;
        };
        if session.direction != CallDirection::Outgoing
            || session.state != CallState::OutgoingPending
            || !session.signaled
        {
            tracing::debug!(state = %session.state, "Ignoring unexpected answer");
            return;
        }
        if callee_id.as_ref().is_some_and(|id| *id != session.peer_id) {
            tracing::debug!(?callee_id, "Ignoring answer from another user");
            return;
        }
        let Some(transport) = session.transport.clone() else {
            return;
        };

        session.set_session_id(call_id);
        session.no_answer_deadline = None;
        session.state = CallState::Connecting;
        let attempt = session.attempt;
        self.notify_state();

        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(
            async move {
                let outcome = match transport.set_remote_description(answer).await {
                    Ok(()) => Outcome::RemoteApplied,
                    Err(err) => Outcome::Failed {
                        reason: err.into(),
                        transport: None,
                    },
                };
                let _ = outcome_tx.send((attempt, outcome));
            }
            .in_current_span(),
        );
    }

    fn on_remote_candidate(&mut self, sender_id: Option<String>, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            tracing::trace!("Ignoring ICE candidate without call");
            return;
        };
        if sender_id.as_ref().is_some_and(|id| *id != session.peer_id) {
            tracing::debug!(?sender_id, "Ignoring ICE candidate from another user");
            return;
        }
        session.push_remote_candidate(candidate);
    }

    async fn on_remote_end(&mut self, from: Option<String>, reason: EndReason) {
        let Some(session) = &self.session else {
            tracing::debug!(%reason, "Ignoring remote end without call");
            return;
        };
        if from.as_ref().is_some_and(|id| *id != session.peer_id) {
            tracing::debug!(?from, "Ignoring call end from another user");
            return;
        }
        self.end_call(reason, false).await;
    }

    async fn on_no_answer(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if session.state != CallState::OutgoingPending {
            return;
        }
        tracing::info!(peer_id = %session.peer_id, "Outgoing call not answered in time");
        let notify_peer = session.peer_aware();
        self.end_call(EndReason::NoAnswer, notify_peer).await;
    }

    /// Tears the current attempt down and returns to idle. No-op without a call.
    #[instrument(level = "debug", skip(self, reason), fields(reason = %reason))]
    async fn end_call(&mut self, reason: EndReason, notify_peer: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let duration = session.duration_secs(Instant::now());
        tracing::info!(peer_id = %session.peer_id, ?duration, "Call ended");

        session.state = CallState::Ended;
        session.stop_candidate_pump();
        if notify_peer {
            self.deps.outbox.send(session.farewell(duration)).await;
        }
        if let Some(transport) = session.transport.take() {
            transport.close().await;
        }

        let mut snapshot = session.snapshot();
        snapshot.end_reason = Some(reason.clone());
        self.snapshot_tx.send_replace(Some(snapshot.clone()));
        self.deps
            .observer
            .on_state_change(CallState::Ended, Some(&snapshot));
        if reason.is_failure() {
            self.deps.observer.on_error(&reason, &reason.to_string());
        }

        self.deps.history.record(CallRecord::new(
            session.peer_id,
            session.direction,
            duration,
            session.started_at.is_some(),
            &reason,
        ));

        self.snapshot_tx.send_replace(None);
        self.deps.observer.on_state_change(CallState::Idle, None);
    }

    async fn send_all(&self, messages: Vec<SignalingMessage>) {
        for msg in messages {
            self.deps.outbox.send(msg).await;
        }
    }

    fn publish(&self) {
        let snapshot = self.session.as_ref().map(CallSession::snapshot);
        self.snapshot_tx.send_replace(snapshot);
    }

    fn notify_state(&self) {
        self.publish();
        if let Some(session) = &self.session {
            let snapshot = session.snapshot();
            self.deps
                .observer
                .on_state_change(snapshot.state, Some(&snapshot));
        }
    }
}

async fn prepare_offer(
    media: Arc<dyn MediaBackend>,
    directory: Option<Arc<dyn ContactDirectory>>,
    peer_id: &str,
) -> Outcome {
    if let Some(directory) = directory {
        match directory.lookup(peer_id).await {
            Ok(Some(contact)) if !contact.online => {
                return Outcome::Failed {
                    reason: EndReason::PeerOffline,
                    transport: None,
                };
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(?err, "Contact lookup failed, calling anyway"),
        }
    }

    let (transport, events) = match media.create().await {
        Ok(created) => created,
        Err(err) => {
            return Outcome::Failed {
                reason: err.into(),
                transport: None,
            };
        }
    };

    match transport.create_offer().await {
        Ok(offer) => Outcome::OfferReady {
            transport,
            events,
            offer,
        },
        Err(err) => Outcome::Failed {
            reason: err.into(),
            transport: Some(transport),
        },
    }
}

async fn prepare_answer(media: Arc<dyn MediaBackend>, offer: SessionDescription) -> Outcome {
    let (transport, events) = match media.create().await {
        Ok(created) => created,
        Err(err) => {
            return Outcome::Failed {
                reason: err.into(),
                transport: None,
            };
        }
    };

    let answer = match transport.set_remote_description(offer).await {
        Ok(()) => transport.create_answer().await,
        Err(err) => Err(err),
    };

    match answer {
        Ok(answer) => Outcome::AnswerReady {
            transport,
            events,
            answer,
        },
        Err(err) => Outcome::Failed {
            reason: err.into(),
            transport: Some(transport),
        },
    }
}

fn adopt_transport(
    session: &mut CallSession,
    transport: Arc<dyn MediaSession>,
    mut events: mpsc::Receiver<MediaEvent>,
    media_tx: mpsc::UnboundedSender<(u64, MediaEvent)>,
) {
    if session.muted {
        transport.set_muted(true);
    }
    session.transport = Some(transport);

    let attempt = session.attempt;
    tokio::spawn(
        async move {
            while let Some(event) = events.recv().await {
                if media_tx.send((attempt, event)).is_err() {
                    break;
                }
            }
            tracing::trace!(?attempt, "Media event stream ended");
        }
        .in_current_span(),
    );
}

/// Applies remote candidates one at a time in the order they were handed over.
fn spawn_candidate_pump(transport: Arc<dyn MediaSession>) -> mpsc::UnboundedSender<IceCandidate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
    tokio::spawn(
        async move {
            while let Some(candidate) = rx.recv().await {
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    tracing::warn!(?err, "Failed to apply remote ICE candidate");
                }
            }
        }
        .in_current_span(),
    );
    tx
}

fn candidate_message(peer_id: &str, candidate: IceCandidate) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        recipient_id: Some(peer_id.to_string()),
        sender_id: None,
        candidate,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
