use anyhow::Context;
use myfi_audio::{EncodedAudioFrame, FRAME_DURATION_MS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, instrument};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Pumps encoded microphone frames into the local audio track.
pub struct Sender {
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl Sender {
    #[instrument(level = "trace", skip_all)]
    pub fn new(
        track: Arc<TrackLocalStaticSample>,
        mut input_rx: mpsc::Receiver<EncodedAudioFrame>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping sending");
                            break;
                        }
                        frame = input_rx.recv() => {
                            let Some(frame) = frame else {
                                tracing::trace!("Input closed, stopping sending");
                                break;
                            };
                            let sample = Sample {
                                data: frame,
                                duration: Duration::from_millis(FRAME_DURATION_MS),
                                ..Default::default()
                            };
                            if let Err(err) = track.write_sample(&sample).await {
                                tracing::warn!(?err, "Failed to write sample to track");
                            }
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );

        Self { shutdown_tx, task }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown();
        self.task.await.context("Failed to join sender task")
    }
}
