use crate::device::{DeviceType, StreamDevice};
use crate::dsp::{FarEndLevel, MicProcessor, downmix_interleaved_to_mono};
use crate::error::AudioError;
use crate::stream::StreamThread;
use crate::{EncodedAudioFrame, FRAME_SIZE, TARGET_SAMPLE_RATE};
use anyhow::Context;
use bytes::Bytes;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use rubato::Resampler;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const MAX_OPUS_FRAME_SIZE: usize = 1275; // max size of an Opus frame according to RFC 6716 3.2.1.
const MIN_INPUT_BUFFER_SIZE: usize = 4096;
const INPUT_POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Microphone capture: device callback → ring buffer → resample to 48 kHz → DSP → Opus frames.
pub struct CaptureStream {
    stream: StreamThread,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CaptureStream {
    #[instrument(level = "debug", skip(tx, far_end, error_tx), err)]
    pub fn start(
        device: StreamDevice,
        tx: mpsc::Sender<EncodedAudioFrame>,
        volume: f32,
        far_end: FarEndLevel,
        error_tx: mpsc::Sender<AudioError>,
    ) -> Result<Self, AudioError> {
        tracing::debug!("Starting input capture stream");
        debug_assert!(matches!(device.device_type, DeviceType::Input));

        let muted = Arc::new(AtomicBool::new(false));
        let muted_clone = muted.clone();

        // buffer for ~100ms of input data
        let (mut input_prod, mut input_cons) =
            HeapRb::<f32>::new(((device.sample_rate() / 10) as usize).max(MIN_INPUT_BUFFER_SIZE))
                .split();

        let mut resampler = device.resampler(None)?;
        let mut opus_framer = OpusFramer::new(tx, MicProcessor::new(far_end))?;
        let channels = device.channels() as usize;

        let stream = StreamThread::spawn("myfi-capture", move || {
            let mut mono_buf: Vec<f32> = Vec::with_capacity(MIN_INPUT_BUFFER_SIZE);
            device.build_input_stream(
                move |input: &[f32], _| {
                    let mono: &[f32] = if channels > 1 {
                        downmix_interleaved_to_mono(input, channels, &mut mono_buf);
                        &mono_buf
                    } else {
                        input
                    };

                    let muted = muted_clone.load(Ordering::Relaxed);
                    let mut overflows = 0usize;
                    for &sample in mono {
                        if input_prod
                            .try_push(if muted { 0.0f32 } else { sample })
                            .is_err()
                        {
                            overflows += 1;
                        }
                    }
                    if overflows > 0 {
                        tracing::warn!(?overflows, "Dropped input samples during this callback");
                    }
                },
                move |err| {
                    tracing::error!(?err, "CPAL capture stream error");
                    if let Err(err) = error_tx.try_send(err.into()) {
                        tracing::warn!(?err, "Failed to send capture stream error");
                    }
                },
            )
        })?;

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let task = tokio::runtime::Handle::current().spawn_blocking(move || {
            tracing::trace!("Input capture stream task started");

            let mut resampler_buf = vec![Vec::<f32>::with_capacity(FRAME_SIZE * 2)];

            while !cancel_clone.is_cancelled() {
                if let Some(resampler) = &mut resampler {
                    // buffer input data until we've reached enough to resample into the next frame
                    let need = resampler.input_frames_next();
                    while resampler_buf[0].len() < need && !cancel_clone.is_cancelled() {
                        if let Some(sample) = input_cons.try_pop() {
                            resampler_buf[0].push(sample);
                        } else {
                            std::thread::sleep(INPUT_POLL_INTERVAL);
                        }
                    }
                    if resampler_buf[0].len() < need {
                        break;
                    }

                    match resampler.process(&resampler_buf, None) {
                        Ok(resampled) => opus_framer.push_slice(&resampled[0], volume),
                        Err(err) => tracing::warn!(?err, "Failed to resample input"),
                    }
                    resampler_buf[0].clear();
                } else {
                    let mut stash = [0.0f32; 1024];
                    let n = input_cons.pop_slice(&mut stash);
                    if n > 0 {
                        opus_framer.push_slice(&stash[..n], volume);
                    } else {
                        std::thread::sleep(INPUT_POLL_INTERVAL);
                    }
                }
            }

            tracing::trace!("Input capture stream task completed");
        });

        tracing::info!("Input capture stream started");
        Ok(Self {
            stream,
            muted,
            cancel,
            task: Some(task),
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn stop(mut self) {
        tracing::info!("Stopping input capture stream");
        self.cancel.cancel();
        self.stream.stop();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            tracing::warn!(?err, "Input capture stream task failed");
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Collects mono 48 kHz samples into 20 ms frames and encodes them.
pub(crate) struct OpusFramer {
    frame: [f32; FRAME_SIZE],
    pos: usize,
    processor: MicProcessor,
    encoder: opus::Encoder,
    encoded: Vec<u8>,
    tx: mpsc::Sender<EncodedAudioFrame>,
}

impl OpusFramer {
    pub(crate) fn new(
        tx: mpsc::Sender<EncodedAudioFrame>,
        processor: MicProcessor,
    ) -> Result<Self, AudioError> {
        let mut encoder = opus::Encoder::new(
            TARGET_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .context("Failed to create opus encoder")?;
        encoder
            .set_inband_fec(true)
            .context("Failed to set opus inband fec")?;

        Ok(Self {
            frame: [0.0f32; FRAME_SIZE],
            pos: 0usize,
            processor,
            encoder,
            encoded: vec![0u8; MAX_OPUS_FRAME_SIZE],
            tx,
        })
    }

    #[inline]
    pub(crate) fn push_slice(&mut self, mut samples: &[f32], gain: f32) {
        while !samples.is_empty() {
            let take = (FRAME_SIZE - self.pos).min(samples.len());

            for (dst, sample) in self.frame[self.pos..self.pos + take]
                .iter_mut()
                .zip(samples)
            {
                *dst = sample * gain;
            }
            self.pos += take;
            samples = &samples[take..];

            if self.pos == FRAME_SIZE {
                self.processor.process_frame(&mut self.frame);

                match self.encoder.encode_float(&self.frame, &mut self.encoded) {
                    Ok(len) => {
                        let bytes = Bytes::copy_from_slice(&self.encoded[..len]);
                        if let Err(err) = self.tx.try_send(bytes) {
                            tracing::warn!(?err, "Failed to send encoded input audio frame");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, "Failed to encode input audio frame");
                    }
                }

                self.pos = 0;
            }
        }
    }
}
