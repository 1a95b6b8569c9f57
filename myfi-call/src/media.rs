use crate::error::MediaError;
use async_trait::async_trait;
use myfi_protocol::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
}

/// Acquires local audio and creates the peer-to-peer session for one call attempt.
#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    /// Fails with [`MediaError::MediaAccess`] if the microphone is refused or missing. The
    /// receiver yields local candidates and connectivity changes until the session is closed.
    async fn create(
        &self,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::Receiver<MediaEvent>), MediaError>;
}

/// Handle to a live media session. Each description operation is used once per session.
#[async_trait]
pub trait MediaSession: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Requires the remote offer to be applied first.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// No-op once the session is closed.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Stops local media and releases the remote audio sink. Idempotent.
    async fn close(&self);

    fn set_muted(&self, muted: bool);
}
