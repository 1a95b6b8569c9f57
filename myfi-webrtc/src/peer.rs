use crate::config::{
    IntoRtc, PEER_EVENTS_CAPACITY, WEBRTC_CHANNELS, WEBRTC_TRACK_ID, WEBRTC_TRACK_STREAM_ID,
    candidate_from_rtc, description_from_rtc, description_to_rtc,
};
use crate::error::WebrtcError;
use crate::{IceConfig, Receiver, Sender};
use anyhow::Context;
use myfi_audio::{EncodedAudioFrame, TARGET_SAMPLE_RATE};
use myfi_protocol::{IceCandidate, SessionDescription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub type PeerConnectionState = RTCPeerConnectionState;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    IceCandidate(IceCandidate),
    Error(String),
}

/// A single peer-to-peer audio session.
///
/// All operations take `&self` so the peer can be shared between the task driving negotiation and
/// the one tearing the call down. Once closed, every negotiation operation fails with
/// [`WebrtcError::Closed`] and remote candidates are ignored.
pub struct Peer {
    peer_connection: RTCPeerConnection,
    track: Arc<TrackLocalStaticSample>,
    sender: Mutex<Option<Sender>>,
    receiver: Mutex<Option<Receiver>>,
    closed: AtomicBool,
}

impl Peer {
    #[instrument(level = "debug", err)]
    pub async fn new(
        config: IceConfig,
    ) -> Result<(Self, broadcast::Receiver<PeerEvent>), WebrtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: TARGET_SAMPLE_RATE,
                channels: WEBRTC_CHANNELS,
                ..Default::default()
            },
            WEBRTC_TRACK_ID.to_owned(),
            WEBRTC_TRACK_STREAM_ID.to_owned(),
        ));

        peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add track to peer connection")?;

        let (events_tx, events_rx) = broadcast::channel(PEER_EVENTS_CAPACITY);

        let state_tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                tracing::trace!(?state, "Peer connection state changed");
                if state_tx.send(PeerEvent::ConnectionState(state)).is_err() {
                    tracing::trace!("No subscribers for peer connection state");
                }
                Box::pin(async {})
            },
        ));

        let candidate_tx = events_tx;
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            if let Some(candidate) = candidate {
                let event = match candidate.to_json() {
                    Ok(init) => PeerEvent::IceCandidate(candidate_from_rtc(init)),
                    Err(err) => {
                        tracing::warn!(?err, "Failed to serialize local ICE candidate");
                        PeerEvent::Error(err.to_string())
                    }
                };
                if candidate_tx.send(event).is_err() {
                    tracing::trace!("No subscribers for local ICE candidate");
                }
            }
            Box::pin(async {})
        }));

        Ok((
            Self {
                peer_connection,
                track,
                sender: Mutex::new(None),
                receiver: Mutex::new(None),
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), WebrtcError> {
        if self.is_closed() {
            Err(WebrtcError::Closed)
        } else {
            Ok(())
        }
    }

    /// Wires encoded microphone frames into the local track and remote track payloads into
    /// `output_tx`.
    #[instrument(level = "debug", skip_all, err)]
    pub fn start(
        &self,
        input_rx: mpsc::Receiver<EncodedAudioFrame>,
        output_tx: mpsc::Sender<EncodedAudioFrame>,
    ) -> Result<(), WebrtcError> {
        self.ensure_open()?;

        let mut sender = self.sender.lock();
        if sender.is_some() {
            tracing::warn!("Peer media already started");
            return Err(WebrtcError::AlreadyStarted);
        }

        *self.receiver.lock() = Some(Receiver::new(&self.peer_connection, output_tx));
        *sender = Some(Sender::new(Arc::clone(&self.track), input_rx));

        tracing::trace!("Started peer media");
        Ok(())
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn create_offer(&self) -> Result<SessionDescription, WebrtcError> {
        self.ensure_open()?;

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set offer as local description")?;

        self.local_description().await
    }

    /// Must be called after the remote offer has been applied.
    #[instrument(level = "trace", skip(self), err)]
    pub async fn create_answer(&self) -> Result<SessionDescription, WebrtcError> {
        self.ensure_open()?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set answer as local description")?;

        self.local_description().await
    }

    #[instrument(level = "trace", skip_all, fields(kind = ?desc.kind), err)]
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), WebrtcError> {
        self.ensure_open()?;

        let desc = description_to_rtc(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|err| WebrtcError::InvalidSessionDescription(err.to_string()))
    }

    /// Applies a remote candidate. Ignored once the peer is closed.
    #[instrument(level = "trace", skip_all, err)]
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), WebrtcError> {
        if self.is_closed() {
            tracing::trace!("Ignoring remote ICE candidate for closed peer");
            return Ok(());
        }

        self.peer_connection
            .add_ice_candidate(candidate.into_rtc())
            .await
            .context("Failed to add remote ICE candidate")?;
        Ok(())
    }

    /// Stops local media, releases the remote sink and closes the connection. Later calls are
    /// no-ops.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn close(&self) -> Result<(), WebrtcError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!("Peer already closed");
            return Ok(());
        }

        let sender = self.sender.lock().take();
        if let Some(sender) = sender
            && let Err(err) = sender.stop().await
        {
            tracing::warn!(?err, "Failed to stop sender, continuing teardown");
        }
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.shutdown();
        }

        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;

        tracing::debug!("Closed peer connection");
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription, WebrtcError> {
        let desc = self
            .peer_connection
            .local_description()
            .await
            .context("Local description missing after negotiation")?;
        description_from_rtc(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myfi_protocol::SdpKind;
    use pretty_assertions::{assert_eq, assert_matches};
    use test_log::test;

    async fn peer() -> Peer {
        let (peer, _events) = Peer::new(IceConfig { ice_servers: vec![] }).await.unwrap();
        peer
    }

    #[test(tokio::test)]
    async fn offer_carries_opus_audio() {
        let peer = peer().await;
        let offer = peer.create_offer().await.unwrap();

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus/48000"));
        peer.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn offer_answer_between_peers() {
        let caller = peer().await;
        let callee = peer().await;

        let offer = caller.create_offer().await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn malformed_remote_description() {
        let peer = peer().await;
        let res = peer
            .set_remote_description(SessionDescription::answer("not sdp"))
            .await;
        assert_matches!(res, Err(WebrtcError::InvalidSessionDescription(_)));
        peer.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn close_is_idempotent() {
        let peer = peer().await;
        peer.close().await.unwrap();
        peer.close().await.unwrap();

        assert!(peer.is_closed());
        assert_matches!(peer.create_offer().await, Err(WebrtcError::Closed));
    }

    #[test(tokio::test)]
    async fn close_started_peer() {
        let peer = peer().await;
        let (input_tx, input_rx) = mpsc::channel(4);
        let (output_tx, _output_rx) = mpsc::channel(4);
        peer.start(input_rx, output_tx.clone()).unwrap();
        drop(input_tx);

        peer.close().await.unwrap();

        assert!(peer.is_closed());
        let (_input_tx, input_rx) = mpsc::channel(4);
        assert_matches!(peer.start(input_rx, output_tx), Err(WebrtcError::Closed));
        assert_matches!(peer.create_offer().await, Err(WebrtcError::Closed));
    }

    #[test(tokio::test)]
    async fn candidate_after_close_is_ignored() {
        let peer = peer().await;
        peer.close().await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        assert_matches!(peer.add_remote_ice_candidate(candidate).await, Ok(()));
    }

    #[test(tokio::test)]
    async fn start_twice_fails() {
        let peer = peer().await;
        let (_input_tx, input_rx) = mpsc::channel(4);
        let (output_tx, _output_rx) = mpsc::channel(4);
        peer.start(input_rx, output_tx.clone()).unwrap();

        let (_input_tx, input_rx) = mpsc::channel(4);
        assert_matches!(
            peer.start(input_rx, output_tx),
            Err(WebrtcError::AlreadyStarted)
        );
        peer.close().await.unwrap();
    }
}
