use crate::config::AudioConfig;
use crate::device::{DeviceSelector, DeviceType};
use crate::dsp::FarEndLevel;
use crate::error::AudioError;
use crate::stream::capture::CaptureStream;
use crate::stream::playback::PlaybackStream;
use crate::EncodedAudioFrame;
use tokio::sync::mpsc;
use tracing::instrument;

const ENCODED_AUDIO_FRAME_BUFFER_SIZE: usize = 512;
const AUDIO_ERROR_BUFFER_SIZE: usize = 16;

/// Local audio for one call: microphone capture and remote audio playback sharing a far-end level
/// for echo suppression.
pub struct AudioPipeline {
    capture: Option<CaptureStream>,
    playback: Option<PlaybackStream>,
    error_rx: Option<mpsc::Receiver<AudioError>>,
}

/// Channel ends handed to the transport: encoded microphone frames to send, and a sink for
/// encoded frames received from the peer.
pub struct AudioChannels {
    pub input_rx: mpsc::Receiver<EncodedAudioFrame>,
    pub output_tx: mpsc::Sender<EncodedAudioFrame>,
}

impl AudioPipeline {
    /// Acquires the microphone first so a missing or refused device fails before anything else
    /// is started.
    #[instrument(level = "debug", err)]
    pub fn start(config: &AudioConfig) -> Result<(Self, AudioChannels), AudioError> {
        let (input_device, input_fallback) = DeviceSelector::open(
            DeviceType::Input,
            config.host_name.as_deref(),
            config.input_device_name.as_deref(),
        )?;
        let (output_device, output_fallback) = DeviceSelector::open(
            DeviceType::Output,
            config.host_name.as_deref(),
            config.output_device_name.as_deref(),
        )?;
        tracing::debug!(
            input = %input_device.name(),
            ?input_fallback,
            output = %output_device.name(),
            ?output_fallback,
            "Opened audio devices"
        );

        let far_end = FarEndLevel::default();
        let (error_tx, error_rx) = mpsc::channel(AUDIO_ERROR_BUFFER_SIZE);
        let (input_tx, input_rx) = mpsc::channel(ENCODED_AUDIO_FRAME_BUFFER_SIZE);
        let (output_tx, output_rx) = mpsc::channel(ENCODED_AUDIO_FRAME_BUFFER_SIZE);

        let capture = CaptureStream::start(
            input_device,
            input_tx,
            config.input_volume,
            far_end.clone(),
            error_tx.clone(),
        )?;
        let playback = PlaybackStream::start(
            output_device,
            output_rx,
            config.output_volume,
            far_end,
            error_tx,
        )?;

        Ok((
            Self {
                capture: Some(capture),
                playback: Some(playback),
                error_rx: Some(error_rx),
            },
            AudioChannels {
                input_rx,
                output_tx,
            },
        ))
    }

    /// Runtime stream errors (e.g. device unplugged). Can be taken once.
    pub fn take_error_rx(&mut self) -> Option<mpsc::Receiver<AudioError>> {
        self.error_rx.take()
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(capture) = &self.capture {
            capture.set_muted(muted);
        }
    }

    /// Stops capture and playback. Safe to call more than once.
    #[instrument(level = "debug", skip(self))]
    pub async fn stop(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop().await;
        }
        if let Some(playback) = self.playback.take() {
            playback.stop().await;
        }
    }
}
