use myfi_audio::EncodedAudioFrame;
use tokio::sync::{mpsc, watch};
use tracing::instrument;
use webrtc::peer_connection::RTCPeerConnection;

/// Forwards RTP payloads of the remote audio track to the playback sink.
pub struct Receiver {
    shutdown_tx: watch::Sender<bool>,
}

impl Receiver {
    #[instrument(level = "trace", skip_all)]
    pub fn new(
        peer_connection: &RTCPeerConnection,
        output_tx: mpsc::Sender<EncodedAudioFrame>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        peer_connection.on_track(Box::new(move |track, _, _| {
            let output_tx = output_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tracing::debug!(codec = ?track.codec().capability.mime_type, "Remote track attached");

            Box::pin(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = async { let _ = shutdown_rx.wait_for(|stopped| *stopped).await; } => {
                            tracing::trace!("Shutdown signalled, stopping receiver");
                            break;
                        }
                        rtp = track.read_rtp() => {
                            match rtp {
                                Ok((packet, _)) => {
                                    if output_tx.send(packet.payload).await.is_err() {
                                        tracing::warn!("Playback sink closed, stopping receiver");
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::debug!(?err, "Remote track ended");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        }));

        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
