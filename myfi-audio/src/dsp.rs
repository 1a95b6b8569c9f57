use crate::TARGET_SAMPLE_RATE;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, Q_BUTTERWORTH_F32, ToHertz, Type};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

pub fn downmix_interleaved_to_mono(interleaved: &[f32], channels: usize, mono: &mut Vec<f32>) {
    debug_assert!(channels > 0);
    debug_assert_eq!(interleaved.len() % channels, 0);

    mono.clear();
    mono.reserve(interleaved.len() / channels);
    for frame in interleaved.chunks(channels) {
        mono.push(downmix_frame_to_mono(frame));
    }
}

#[inline]
fn downmix_frame_to_mono(frame: &[f32]) -> f32 {
    match frame.len() {
        0 => 0.0f32,
        1 => frame[0],
        2 => {
            let (l, r) = (frame[0], frame[1]);
            if (l - r).abs() < 1e-4 { l } else { (l + r) * 0.5f32 }
        }
        n => frame.iter().copied().sum::<f32>() / (n as f32),
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// RMS level of the audio most recently played to the speaker, shared between the playback
/// callback (writer) and the microphone processor (reader).
#[derive(Debug, Clone, Default)]
pub struct FarEndLevel(Arc<AtomicU32>);

impl FarEndLevel {
    pub fn store(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

const HIGH_PASS_CUTOFF_HZ: f32 = 100.0;

const GATE_OPEN_THRESHOLD: f32 = 0.003; // ~ -50 dBFS
const GATE_CLOSE_THRESHOLD: f32 = 0.002;
const GATE_HOLD_FRAMES: u32 = 10;
const GATE_FLOOR_GAIN: f32 = 0.05;

const AGC_TARGET_RMS: f32 = 0.1; // -20 dBFS
const AGC_MIN_GAIN: f32 = 0.25;
const AGC_MAX_GAIN: f32 = 4.0;
const AGC_ATTACK: f32 = 0.5;
const AGC_RELEASE: f32 = 0.05;

const ECHO_FAR_END_ACTIVE: f32 = 0.01;
const ECHO_DUCK_GAIN: f32 = 0.3;

/// Per-frame microphone chain: high-pass (rumble and DC removal), noise gate, automatic gain
/// control, and echo suppression that ducks the microphone while the far end is talking louder
/// than the near end.
pub struct MicProcessor {
    high_pass: DirectForm2Transposed<f32>,
    gate_gain: f32,
    gate_hold: u32,
    agc_gain: f32,
    far_end: FarEndLevel,
}

impl MicProcessor {
    pub fn new(far_end: FarEndLevel) -> Self {
        let coefficients = Coefficients::<f32>::from_params(
            Type::HighPass,
            (TARGET_SAMPLE_RATE as f32).hz(),
            HIGH_PASS_CUTOFF_HZ.hz(),
            Q_BUTTERWORTH_F32,
        )
        .unwrap_or(Coefficients {
            a1: 0.0,
            a2: 0.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
        });

        Self {
            high_pass: DirectForm2Transposed::<f32>::new(coefficients),
            gate_gain: 1.0,
            gate_hold: 0,
            agc_gain: 1.0,
            far_end,
        }
    }

    pub fn process_frame(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            *sample = self.high_pass.run(*sample);
        }

        let level = rms(frame);

        // gate with hysteresis, held open for a few frames to not chop word endings
        let target_gate = if level >= GATE_OPEN_THRESHOLD {
            self.gate_hold = GATE_HOLD_FRAMES;
            1.0
        } else if level < GATE_CLOSE_THRESHOLD && self.gate_hold == 0 {
            GATE_FLOOR_GAIN
        } else {
            self.gate_hold = self.gate_hold.saturating_sub(1);
            1.0
        };

        // only adapt the agc on frames carrying speech
        if target_gate >= 1.0 && level > 0.0 {
            let desired = (AGC_TARGET_RMS / level).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            let alpha = if desired < self.agc_gain {
                AGC_ATTACK
            } else {
                AGC_RELEASE
            };
            self.agc_gain += alpha * (desired - self.agc_gain);
        }

        let far_end = self.far_end.load();
        let echo_gain = if far_end > ECHO_FAR_END_ACTIVE && level < far_end {
            ECHO_DUCK_GAIN
        } else {
            1.0
        };

        let start_gate = self.gate_gain;
        let len = frame.len().max(1) as f32;
        for (i, sample) in frame.iter_mut().enumerate() {
            // ramp the gate across the frame to avoid clicks
            let gate = start_gate + (target_gate - start_gate) * (i as f32 + 1.0) / len;
            *sample = (*sample * gate * self.agc_gain * echo_gain).clamp(-1.0, 1.0);
        }
        self.gate_gain = target_gate;
    }
}
