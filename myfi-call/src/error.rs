use crate::session::CallState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection of a user command. The call itself is unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("another call is already in progress")]
    Busy,
    #[error("no call in progress")]
    NoCall,
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("incoming call has no offer to answer")]
    MissingOffer,
    #[error("operation not allowed while {0}")]
    InvalidState(CallState),
    #[error("call manager is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAccessKind {
    Denied,
    NotFound,
}

impl std::fmt::Display for MediaAccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaAccessKind::Denied => f.write_str("permission denied"),
            MediaAccessKind::NotFound => f.write_str("no audio device found"),
        }
    }
}

/// Failure reported by a media backend or session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("microphone unavailable: {kind}: {message}")]
    MediaAccess {
        kind: MediaAccessKind,
        message: String,
    },
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport failed: {0}")]
    Transport(String),
}

impl From<MediaError> for EndReason {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::MediaAccess { kind, .. } => EndReason::MediaAccess(kind),
            MediaError::Negotiation(msg) => EndReason::NegotiationFailed(msg),
            MediaError::Transport(msg) => EndReason::TransportFailed(msg),
        }
    }
}

/// Why a call attempt ended.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndReason {
    #[error("call ended")]
    HungUp,
    #[error("call declined")]
    Rejected,
    #[error("call was rejected")]
    PeerRejected,
    #[error("other side hung up")]
    PeerEnded,
    #[error("call failed: {0}")]
    PeerFailed(String),
    #[error("user is offline")]
    PeerOffline,
    #[error("no answer")]
    NoAnswer,
    #[error("connection lost")]
    ConnectionLost,
    #[error("microphone unavailable: {0}")]
    MediaAccess(MediaAccessKind),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("media connection failed: {0}")]
    TransportFailed(String),
}

impl EndReason {
    /// Whether the end is reported to the user as an error rather than a normal hang up.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            EndReason::HungUp | EndReason::Rejected | EndReason::PeerEnded
        )
    }
}
