use crate::error::EndReason;
use crate::media::MediaSession;
use myfi_protocol::{CallerInfo, IceCandidate, SessionDescription, SignalingMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    OutgoingPending,
    IncomingPending,
    Connecting,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::OutgoingPending => "outgoing_pending",
            CallState::IncomingPending => "incoming_pending",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Read-only view of the current call handed to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub peer_id: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub session_id: Option<String>,
    pub caller: Option<CallerInfo>,
    pub started_at: Option<Instant>,
    pub muted: bool,
    pub end_reason: Option<EndReason>,
}

impl CallSnapshot {
    /// Running duration of an active call, `None` before it became active.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|started| started.elapsed())
    }

    /// Caller name or phone for incoming calls, the peer ID otherwise.
    pub fn display_name(&self) -> &str {
        self.caller
            .as_ref()
            .and_then(CallerInfo::display_name)
            .unwrap_or(&self.peer_id)
    }
}

/// Formats a call duration as `mm:ss`. Minutes are not wrapped into hours.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// The single mutable call attempt owned by the call manager.
pub(crate) struct CallSession {
    pub(crate) attempt: u64,
    pub(crate) peer_id: String,
    pub(crate) direction: CallDirection,
    pub(crate) state: CallState,
    session_id: Option<String>,
    /// Call record ID announced with `incoming_call`, confirmed by sending `answer_call`.
    pub(crate) offered_call_id: Option<String>,
    pub(crate) caller: Option<CallerInfo>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) pending_remote_description: Option<SessionDescription>,
    queued_candidates: Vec<IceCandidate>,
    pending_local_candidates: Vec<IceCandidate>,
    /// Whether `call_user` or `answer_call` went out for this attempt.
    pub(crate) signaled: bool,
    pub(crate) transport: Option<Arc<dyn MediaSession>>,
    candidate_tx: Option<mpsc::UnboundedSender<IceCandidate>>,
    pub(crate) no_answer_deadline: Option<Instant>,
    pub(crate) muted: bool,
}

impl CallSession {
    pub(crate) fn outgoing(attempt: u64, peer_id: String, no_answer_deadline: Instant) -> Self {
        Self::new(
            attempt,
            peer_id,
            CallDirection::Outgoing,
            CallState::OutgoingPending,
            Some(no_answer_deadline),
        )
    }

    pub(crate) fn incoming(
        attempt: u64,
        peer_id: String,
        caller: CallerInfo,
        call_id: Option<String>,
        offer: SessionDescription,
    ) -> Self {
        let mut session = Self::new(
            attempt,
            peer_id,
            CallDirection::Incoming,
            CallState::IncomingPending,
            None,
        );
        session.caller = Some(caller);
        session.offered_call_id = call_id;
        session.pending_remote_description = Some(offer);
        session
    }

    fn new(
        attempt: u64,
        peer_id: String,
        direction: CallDirection,
        state: CallState,
        no_answer_deadline: Option<Instant>,
    ) -> Self {
        Self {
            attempt,
            peer_id,
            direction,
            state,
            session_id: None,
            offered_call_id: None,
            caller: None,
            started_at: None,
            pending_remote_description: None,
            queued_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            signaled: false,
            transport: None,
            candidate_tx: None,
            no_answer_deadline,
            muted: false,
        }
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Records the relay's call ID. Only the first ID is kept.
    pub(crate) fn set_session_id(&mut self, id: Option<String>) {
        match (&self.session_id, id) {
            (None, Some(id)) => self.session_id = Some(id),
            (Some(current), Some(id)) if *current != id => {
                tracing::warn!(%current, ignored = %id, "Session ID already set");
            }
            _ => {}
        }
    }

    pub(crate) fn activate(&mut self, now: Instant) {
        self.state = CallState::Active;
        self.started_at.get_or_insert(now);
        self.no_answer_deadline = None;
    }

    /// Whole seconds spent active, `0` if the call never became active.
    pub(crate) fn duration_secs(&self, now: Instant) -> u64 {
        self.started_at
            .map(|started| now.saturating_duration_since(started).as_secs())
            .unwrap_or(0)
    }

    /// Whether the peer knows about this attempt and must be told when it ends.
    pub(crate) fn peer_aware(&self) -> bool {
        self.direction == CallDirection::Incoming || self.signaled
    }

    /// Routes a remote candidate: applied live once the remote description is in place, queued
    /// before that.
    pub(crate) fn push_remote_candidate(&mut self, candidate: IceCandidate) {
        match &self.candidate_tx {
            Some(tx) => {
                if let Err(err) = tx.send(candidate) {
                    tracing::debug!(?err, "Candidate pump closed, dropping candidate");
                }
            }
            None => self.queued_candidates.push(candidate),
        }
    }

    pub(crate) fn queued_candidates(&self) -> &[IceCandidate] {
        &self.queued_candidates
    }

    /// Switches to live candidate application. Queued candidates are handed to the pump first so
    /// they are applied before any later arrival.
    pub(crate) fn start_candidate_pump(&mut self, tx: mpsc::UnboundedSender<IceCandidate>) {
        for candidate in self.queued_candidates.drain(..) {
            if tx.send(candidate).is_err() {
                tracing::debug!("Candidate pump closed while draining queue");
                break;
            }
        }
        self.candidate_tx = Some(tx);
    }

    pub(crate) fn stop_candidate_pump(&mut self) {
        self.candidate_tx = None;
        self.queued_candidates.clear();
    }

    /// Holds back local candidates until the peer has been told about the call.
    pub(crate) fn push_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.signaled {
            Some(candidate)
        } else {
            self.pending_local_candidates.push(candidate);
            None
        }
    }

    pub(crate) fn take_local_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_local_candidates)
    }

    /// Message telling the peer this attempt is over: a rejection if an incoming call was never
    /// answered, a hang up otherwise.
    pub(crate) fn farewell(&self, duration: u64) -> SignalingMessage {
        if self.direction == CallDirection::Incoming && !self.signaled {
            SignalingMessage::RejectCall {
                caller_id: self.peer_id.clone(),
                call_id: self.offered_call_id.clone(),
            }
        } else {
            SignalingMessage::HangUp {
                other_user_id: self.peer_id.clone(),
                call_id: self.session_id.clone(),
                duration,
            }
        }
    }

    pub(crate) fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            state: self.state,
            session_id: self.session_id.clone(),
            caller: self.caller.clone(),
            started_at: self.started_at,
            muted: self.muted,
            end_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_matches};

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn format_mm_ss() {
        assert_eq!(format_duration(Duration::ZERO), "00:00");
        assert_eq!(format_duration(Duration::from_millis(65_900)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(75 * 60 + 3)), "75:03");
    }

    #[test]
    fn duration_zero_if_never_active() {
        let now = Instant::now();
        let mut session = CallSession::outgoing(1, "42".to_string(), now);
        assert_eq!(session.duration_secs(now + Duration::from_secs(30)), 0);

        session.activate(now);
        assert_eq!(session.duration_secs(now + Duration::from_millis(2_999)), 2);
        assert_eq!(session.no_answer_deadline, None);
    }

    #[test]
    fn session_id_is_set_once() {
        let mut session = CallSession::outgoing(1, "42".to_string(), Instant::now());
        session.set_session_id(None);
        assert_eq!(session.session_id(), None);

        session.set_session_id(Some("7".to_string()));
        session.set_session_id(Some("8".to_string()));
        assert_eq!(session.session_id(), Some("7"));
    }

    #[test]
    fn queued_candidates_drain_before_live_ones() {
        let mut session = CallSession::outgoing(1, "42".to_string(), Instant::now());
        session.push_remote_candidate(candidate(1));
        session.push_remote_candidate(candidate(2));
        assert_eq!(session.queued_candidates().len(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start_candidate_pump(tx);
        session.push_remote_candidate(candidate(3));

        assert!(session.queued_candidates().is_empty());
        assert_eq!(rx.try_recv().unwrap(), candidate(1));
        assert_eq!(rx.try_recv().unwrap(), candidate(2));
        assert_eq!(rx.try_recv().unwrap(), candidate(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn local_candidates_held_until_signaled() {
        let mut session = CallSession::outgoing(1, "42".to_string(), Instant::now());
        assert_eq!(session.push_local_candidate(candidate(1)), None);

        session.signaled = true;
        assert_eq!(session.take_local_candidates(), vec![candidate(1)]);
        assert_eq!(session.push_local_candidate(candidate(2)), Some(candidate(2)));
    }

    #[test]
    fn unanswered_incoming_call_is_rejected() {
        let mut session = CallSession::incoming(
            1,
            "7".to_string(),
            CallerInfo::default(),
            Some("99".to_string()),
            SessionDescription::offer("v=0"),
        );
        assert!(session.peer_aware());
        assert_matches!(
            session.farewell(0),
            SignalingMessage::RejectCall { caller_id, call_id: Some(call_id) }
                if caller_id == "7" && call_id == "99"
        );

        session.signaled = true;
        session.set_session_id(Some("99".to_string()));
        assert_matches!(
            session.farewell(12),
            SignalingMessage::HangUp { other_user_id, duration: 12, .. } if other_user_id == "7"
        );
    }

    #[test]
    fn display_name_falls_back_to_peer_id() {
        let mut snapshot = CallSession::outgoing(1, "42".to_string(), Instant::now()).snapshot();
        assert_eq!(snapshot.display_name(), "42");

        snapshot.caller = Some(CallerInfo {
            caller_name: None,
            caller_phone: Some("+43 1234".to_string()),
            caller_avatar: None,
        });
        assert_eq!(snapshot.display_name(), "+43 1234");
    }
}
