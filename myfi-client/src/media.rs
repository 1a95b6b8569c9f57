use async_trait::async_trait;
use myfi_audio::config::AudioConfig;
use myfi_audio::{AudioError, AudioPipeline};
use myfi_call::{Connectivity, MediaAccessKind, MediaBackend, MediaError, MediaEvent, MediaSession};
use myfi_protocol::{IceCandidate, SessionDescription};
use myfi_webrtc::{IceConfig, Peer, PeerConnectionState, PeerEvent, WebrtcError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;

const MEDIA_EVENTS_CAPACITY: usize = 64;

/// Microphone, speaker and a WebRTC peer per call attempt.
pub struct PeerMediaBackend {
    ice: IceConfig,
    audio: AudioConfig,
}

impl PeerMediaBackend {
    pub fn new(ice: IceConfig, audio: AudioConfig) -> Self {
        Self { ice, audio }
    }
}

#[async_trait]
impl MediaBackend for PeerMediaBackend {
    #[instrument(level = "debug", skip(self), err)]
    async fn create(
        &self,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::Receiver<MediaEvent>), MediaError> {
        let (mut pipeline, channels) = AudioPipeline::start(&self.audio).map_err(audio_error)?;

        let (peer, peer_events) = match Peer::new(self.ice.clone()).await {
            Ok(peer) => peer,
            Err(err) => {
                pipeline.stop().await;
                return Err(MediaError::Transport(err.to_string()));
            }
        };

        if let Err(err) = peer.start(channels.input_rx, channels.output_tx) {
            if let Err(close_err) = peer.close().await {
                tracing::warn!(?close_err, "Failed to close peer after start failure");
            }
            pipeline.stop().await;
            return Err(MediaError::Transport(err.to_string()));
        }

        let (events_tx, events_rx) = mpsc::channel(MEDIA_EVENTS_CAPACITY);
        tokio::spawn(forward_events(
            peer_events,
            pipeline.take_error_rx(),
            events_tx,
        ));

        tracing::debug!("Created media session");
        let session = PeerMediaSession {
            peer,
            pipeline: Mutex::new(Some(pipeline)),
        };
        Ok((Arc::new(session), events_rx))
    }
}

struct PeerMediaSession {
    peer: Peer,
    pipeline: Mutex<Option<AudioPipeline>>,
}

#[async_trait]
impl MediaSession for PeerMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.peer.create_offer().await.map_err(negotiation_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.peer.create_answer().await.map_err(negotiation_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.peer
            .set_remote_description(desc)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.peer
            .add_remote_ice_candidate(candidate)
            .await
            .map_err(|err| MediaError::Transport(err.to_string()))
    }

    #[instrument(level = "debug", skip(self))]
    async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            tracing::warn!(?err, "Failed to close peer");
        }

        let pipeline = self.pipeline.lock().take();
        if let Some(mut pipeline) = pipeline {
            pipeline.stop().await;
        }
    }

    fn set_muted(&self, muted: bool) {
        if let Some(pipeline) = self.pipeline.lock().as_ref() {
            pipeline.set_muted(muted);
        }
    }
}

async fn forward_events(
    mut peer_events: broadcast::Receiver<PeerEvent>,
    mut audio_errors: Option<mpsc::Receiver<AudioError>>,
    events_tx: mpsc::Sender<MediaEvent>,
) {
    loop {
        let event = tokio::select! {
            event = peer_events.recv() => match event {
                Ok(PeerEvent::IceCandidate(candidate)) => MediaEvent::LocalCandidate(candidate),
                Ok(PeerEvent::ConnectionState(state)) => {
                    MediaEvent::Connectivity(connectivity(state))
                }
                Ok(PeerEvent::Error(err)) => {
                    tracing::warn!(%err, "Peer reported an error");
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Media event forwarder lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(err) = next_audio_error(&mut audio_errors) => {
                tracing::warn!(?err, "Audio stream failed");
                MediaEvent::Connectivity(Connectivity::Failed)
            }
        };

        if events_tx.send(event).await.is_err() {
            break;
        }
    }
    tracing::trace!("Media event forwarder finished");
}

async fn next_audio_error(rx: &mut Option<mpsc::Receiver<AudioError>>) -> Option<AudioError> {
    match rx {
        Some(inner) => {
            let err = inner.recv().await;
            if err.is_none() {
                *rx = None;
            }
            err
        }
        None => std::future::pending().await,
    }
}

fn connectivity(state: PeerConnectionState) -> Connectivity {
    match state {
        PeerConnectionState::Unspecified | PeerConnectionState::New => Connectivity::New,
        PeerConnectionState::Connecting => Connectivity::Connecting,
        PeerConnectionState::Connected => Connectivity::Connected,
        PeerConnectionState::Disconnected => Connectivity::Disconnected,
        PeerConnectionState::Failed => Connectivity::Failed,
        PeerConnectionState::Closed => Connectivity::Closed,
    }
}

/// Every audio start failure means the call cannot have a microphone.
fn audio_error(err: AudioError) -> MediaError {
    let kind = match err.media_access_kind() {
        Some(myfi_audio::MediaAccessKind::Denied) => MediaAccessKind::Denied,
        _ => MediaAccessKind::NotFound,
    };
    MediaError::MediaAccess {
        kind,
        message: err.to_string(),
    }
}

fn negotiation_error(err: WebrtcError) -> MediaError {
    match err {
        WebrtcError::Closed => MediaError::Transport(err.to_string()),
        err => MediaError::Negotiation(err.to_string()),
    }
}
