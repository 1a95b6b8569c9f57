pub mod config;
mod device;
mod dsp;
pub mod error;
pub mod pipeline;
pub mod stream;

pub use device::{DeviceSelector, DeviceType, StreamDevice};
pub use dsp::FarEndLevel;
pub use error::{AudioError, MediaAccessKind};
pub use pipeline::{AudioChannels, AudioPipeline};

use bytes::Bytes;

pub type EncodedAudioFrame = Bytes;

/// Capture is always mono at this rate, whatever the device runs at.
pub const TARGET_SAMPLE_RATE: u32 = 48_000;
pub const FRAME_DURATION_MS: u64 = 20;
pub const FRAME_SIZE: usize = TARGET_SAMPLE_RATE as usize * FRAME_DURATION_MS as usize / 1000;
