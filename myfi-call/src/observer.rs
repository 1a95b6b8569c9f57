use crate::error::EndReason;
use crate::session::{CallDirection, CallState, CallSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// UI-facing callbacks. Invoked from the call manager task, so implementations must not block.
pub trait CallObserver: Send + Sync + 'static {
    /// `session` is `None` once the manager is back to idle.
    fn on_state_change(&self, state: CallState, session: Option<&CallSnapshot>);

    fn on_incoming_call(&self, session: &CallSnapshot);

    /// Called exactly once for every attempt that ended in failure.
    fn on_error(&self, kind: &EndReason, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub online: bool,
}

/// Lookup of a peer's contact entry.
#[async_trait]
pub trait ContactDirectory: Send + Sync + 'static {
    /// `Ok(None)` if the peer is not a known contact.
    async fn lookup(&self, peer_id: &str) -> anyhow::Result<Option<Contact>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Completed,
    Rejected,
    Missed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub peer_identity: String,
    pub direction: CallDirection,
    pub duration_seconds: u64,
    pub status: CallStatus,
}

impl CallRecord {
    pub fn new(
        peer_identity: String,
        direction: CallDirection,
        duration_seconds: u64,
        was_active: bool,
        reason: &EndReason,
    ) -> Self {
        let status = if was_active {
            CallStatus::Completed
        } else {
            match (direction, reason) {
                (_, EndReason::Rejected | EndReason::PeerRejected) => CallStatus::Rejected,
                (_, EndReason::NoAnswer | EndReason::PeerOffline) => CallStatus::Missed,
                (CallDirection::Outgoing, EndReason::HungUp) => CallStatus::Missed,
                (CallDirection::Incoming, EndReason::PeerEnded) => CallStatus::Missed,
                _ => CallStatus::Failed,
            }
        };

        Self {
            peer_identity,
            direction,
            duration_seconds,
            status,
        }
    }
}

/// Receives a record for every ended attempt.
pub trait CallHistorySink: Send + Sync + 'static {
    fn record(&self, record: CallRecord);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn status(direction: CallDirection, was_active: bool, reason: EndReason) -> CallStatus {
        CallRecord::new("42".to_string(), direction, 0, was_active, &reason).status
    }

    #[test]
    fn status_mapping() {
        use CallDirection::*;
        assert_eq!(status(Outgoing, true, EndReason::PeerEnded), CallStatus::Completed);
        assert_eq!(
            status(Incoming, true, EndReason::ConnectionLost),
            CallStatus::Completed
        );
        assert_eq!(status(Incoming, false, EndReason::Rejected), CallStatus::Rejected);
        assert_eq!(status(Outgoing, false, EndReason::PeerRejected), CallStatus::Rejected);
        assert_eq!(status(Outgoing, false, EndReason::NoAnswer), CallStatus::Missed);
        assert_eq!(status(Outgoing, false, EndReason::PeerOffline), CallStatus::Missed);
        assert_eq!(status(Outgoing, false, EndReason::HungUp), CallStatus::Missed);
        assert_eq!(status(Incoming, false, EndReason::PeerEnded), CallStatus::Missed);
        assert_eq!(
            status(Outgoing, false, EndReason::PeerFailed("x".to_string())),
            CallStatus::Failed
        );
    }

    #[test]
    fn record_serializes_lowercase_status() {
        let record = CallRecord::new(
            "42".to_string(),
            CallDirection::Outgoing,
            61,
            true,
            &EndReason::HungUp,
        );
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::json!({
                "peer_identity": "42",
                "direction": "outgoing",
                "duration_seconds": 61,
                "status": "completed",
            })
        );
    }
}
