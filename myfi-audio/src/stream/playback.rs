use crate::device::{DeviceType, StreamDevice};
use crate::dsp::{FarEndLevel, rms};
use crate::error::AudioError;
use crate::stream::StreamThread;
use crate::{EncodedAudioFrame, FRAME_SIZE, TARGET_SAMPLE_RATE};
use anyhow::Context;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rubato::Resampler;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, instrument};

// 10 frames, 200 ms at 48 kHz
const PLAYBACK_BUFFER_FRAMES: usize = 10;

/// Remote audio sink: Opus frames → decode → (resample) → ring buffer → speaker.
pub struct PlaybackStream {
    stream: StreamThread,
    decoder_task: JoinHandle<()>,
}

impl PlaybackStream {
    #[instrument(level = "debug", skip(rx, far_end, error_tx), err)]
    pub fn start(
        device: StreamDevice,
        rx: mpsc::Receiver<EncodedAudioFrame>,
        volume: f32,
        far_end: FarEndLevel,
        error_tx: mpsc::Sender<AudioError>,
    ) -> Result<Self, AudioError> {
        tracing::debug!("Starting output playback stream");
        debug_assert!(matches!(device.device_type, DeviceType::Output));

        let ring_size = FRAME_SIZE * PLAYBACK_BUFFER_FRAMES * device.sample_rate() as usize
            / TARGET_SAMPLE_RATE as usize;
        let (prod, mut cons): (HeapProd<f32>, HeapCons<f32>) =
            HeapRb::new(ring_size.max(FRAME_SIZE)).split();

        let resampler = device.resampler(Some(FRAME_SIZE))?;
        let decoder = opus::Decoder::new(TARGET_SAMPLE_RATE, opus::Channels::Mono)
            .context("Failed to create Opus decoder")?;

        let decoder_task = tokio::spawn(
            decode_task(rx, decoder, resampler, prod).instrument(tracing::Span::current()),
        );

        let channels = device.channels().max(1) as usize;
        let volume = volume.clamp(0.0, 1.0);
        let stream = StreamThread::spawn("myfi-playback", move || {
            device.build_output_stream(
                move |output: &mut [f32], _| {
                    output.fill(0.0);
                    // duplicate each mono sample across all channels of the frame
                    for (frame, sample) in output.chunks_mut(channels).zip(cons.pop_iter()) {
                        frame.fill(sample * volume);
                    }
                    far_end.store(rms(output));
                },
                move |err| {
                    tracing::error!(?err, "CPAL playback stream error");
                    if let Err(err) = error_tx.try_send(err.into()) {
                        tracing::warn!(?err, "Failed to send playback stream error");
                    }
                },
            )
        });

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                decoder_task.abort();
                return Err(err);
            }
        };

        tracing::info!("Output playback stream started");
        Ok(Self {
            stream,
            decoder_task,
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn stop(mut self) {
        tracing::info!("Stopping output playback stream");
        self.decoder_task.abort();
        self.stream.stop();
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        self.decoder_task.abort();
    }
}

async fn decode_task(
    mut rx: mpsc::Receiver<EncodedAudioFrame>,
    mut decoder: opus::Decoder,
    mut resampler: Option<rubato::SincFixedIn<f32>>,
    mut prod: HeapProd<f32>,
) {
    tracing::debug!("Starting Opus decoder task");

    let mut decoded = vec![0.0f32; FRAME_SIZE];
    let mut pending = Vec::<f32>::with_capacity(FRAME_SIZE * 2);
    let mut overflows = 0usize;

    while let Some(frame) = rx.recv().await {
        let n = match decoder.decode_float(&frame, &mut decoded, false) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(?err, "Failed to decode Opus frame");
                continue;
            }
        };

        let overflowed = match resampler.as_mut() {
            None => prod.push_slice(&decoded[..n]) < n,
            Some(resampler) => {
                pending.extend_from_slice(&decoded[..n]);
                let mut dropped = false;
                while pending.len() >= resampler.input_frames_next() {
                    let need = resampler.input_frames_next();
                    match resampler.process(&[&pending[..need]], None) {
                        Ok(out) => dropped |= prod.push_slice(&out[0]) < out[0].len(),
                        Err(err) => tracing::warn!(?err, "Failed to resample output"),
                    }
                    pending.drain(..need);
                }
                dropped
            }
        };

        if overflowed {
            overflows += 1;
            if overflows % 100 == 1 {
                tracing::debug!(?overflows, "Playback ring overflow (tail samples dropped)");
            }
        }
    }

    tracing::debug!("Opus decoder task ended");
}
