use crate::TARGET_SAMPLE_RATE;
use crate::error::AudioError;
use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Sample, SampleFormat, SupportedStreamConfig, SupportedStreamConfigRange};
use rubato::{SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::cell::RefCell;
use std::fmt::{Debug, Display, Formatter};
use tracing::instrument;

const DEFAULT_RESAMPLER_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Input,
    Output,
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Input => write!(f, "input"),
            DeviceType::Output => write!(f, "output"),
        }
    }
}

/// An opened device together with the stream config picked for it.
pub struct StreamDevice {
    pub(crate) device_type: DeviceType,
    pub(crate) device: cpal::Device,
    pub(crate) config: cpal::StreamConfig,
    pub(crate) sample_format: SampleFormat,
}

impl StreamDevice {
    #[inline]
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    #[inline]
    pub fn name(&self) -> String {
        self.device.name().unwrap_or_default()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    #[instrument(level = "trace", skip(data_callback, error_callback), err)]
    pub(crate) fn build_input_stream<D, E>(
        &self,
        data_callback: D,
        error_callback: E,
    ) -> Result<cpal::Stream, AudioError>
    where
        D: FnMut(&[f32], &cpal::InputCallbackInfo) + Send + 'static,
        E: FnMut(cpal::StreamError) + Send + 'static,
    {
        debug_assert!(matches!(self.device_type, DeviceType::Input));

        match self.sample_format {
            SampleFormat::F32 => self
                .device
                .build_input_stream::<f32, _, _>(&self.config, data_callback, error_callback, None)
                .map_err(Into::into),
            SampleFormat::I16 => {
                self.build_f32_input_stream::<i16, _, _>(data_callback, error_callback)
            }
            SampleFormat::U16 => {
                self.build_f32_input_stream::<u16, _, _>(data_callback, error_callback)
            }
            other => {
                tracing::warn!(?other, "Unsupported input sample format");
                Err(AudioError::UnsupportedConfig)
            }
        }
    }

    fn build_f32_input_stream<T, D, E>(
        &self,
        mut data_callback: D,
        error_callback: E,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: Sample<Float = f32> + cpal::SizedSample + 'static,
        D: FnMut(&[f32], &cpal::InputCallbackInfo) + Send + 'static,
        E: FnMut(cpal::StreamError) + Send + 'static,
    {
        let buf: RefCell<Vec<f32>> = RefCell::new(Vec::new());
        if let cpal::BufferSize::Fixed(n) = self.config.buffer_size {
            buf.borrow_mut().reserve(n as usize);
        }

        self.device
            .build_input_stream::<T, _, _>(
                &self.config,
                move |input: &[T], info| {
                    let mut b = buf.borrow_mut();
                    if b.len() != input.len() {
                        b.resize(input.len(), 0.0f32);
                    }
                    for (dst, &src) in b.iter_mut().zip(input.iter()) {
                        *dst = src.to_float_sample();
                    }
                    data_callback(&b, info);
                },
                error_callback,
                None,
            )
            .map_err(Into::into)
    }

    #[instrument(level = "trace", skip(data_callback, error_callback), err)]
    pub(crate) fn build_output_stream<D, E>(
        &self,
        data_callback: D,
        error_callback: E,
    ) -> Result<cpal::Stream, AudioError>
    where
        D: FnMut(&mut [f32], &cpal::OutputCallbackInfo) + Send + 'static,
        E: FnMut(cpal::StreamError) + Send + 'static,
    {
        debug_assert!(matches!(self.device_type, DeviceType::Output));

        match self.sample_format {
            SampleFormat::F32 => self
                .device
                .build_output_stream::<f32, _, _>(&self.config, data_callback, error_callback, None)
                .map_err(Into::into),
            SampleFormat::I16 => {
                self.build_f32_output_stream::<i16, _, _>(data_callback, error_callback)
            }
            SampleFormat::U16 => {
                self.build_f32_output_stream::<u16, _, _>(data_callback, error_callback)
            }
            other => {
                tracing::warn!(?other, "Unsupported output sample format");
                Err(AudioError::UnsupportedConfig)
            }
        }
    }

    fn build_f32_output_stream<T, D, E>(
        &self,
        mut data_callback: D,
        error_callback: E,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: cpal::SizedSample + cpal::FromSample<f32> + 'static,
        D: FnMut(&mut [f32], &cpal::OutputCallbackInfo) + Send + 'static,
        E: FnMut(cpal::StreamError) + Send + 'static,
    {
        let buf: RefCell<Vec<f32>> = RefCell::new(Vec::new());
        if let cpal::BufferSize::Fixed(n) = self.config.buffer_size {
            buf.borrow_mut().reserve(n as usize);
        }

        self.device
            .build_output_stream::<T, _, _>(
                &self.config,
                move |output: &mut [T], info| {
                    let mut b = buf.borrow_mut();
                    if b.len() != output.len() {
                        b.resize(output.len(), 0.0f32);
                    }
                    data_callback(&mut b, info);
                    for (dst, &src) in output.iter_mut().zip(b.iter()) {
                        *dst = src.to_sample::<T>();
                    }
                },
                error_callback,
                None,
            )
            .map_err(Into::into)
    }

    /// Resampler converting between the device rate and [`TARGET_SAMPLE_RATE`], in the direction
    /// matching the device type. `None` if the device already runs at the target rate.
    pub(crate) fn resampler(&self, chunk_size: Option<usize>) -> Result<Option<SincFixedIn<f32>>, AudioError> {
        if self.sample_rate() == TARGET_SAMPLE_RATE {
            return Ok(None);
        }

        let ratio = match self.device_type {
            DeviceType::Input => TARGET_SAMPLE_RATE as f64 / self.sample_rate() as f64,
            DeviceType::Output => self.sample_rate() as f64 / TARGET_SAMPLE_RATE as f64,
        };
        let chunk_size = chunk_size.unwrap_or(
            if let cpal::BufferSize::Fixed(n) = self.config.buffer_size {
                n as usize
            } else {
                DEFAULT_RESAMPLER_CHUNK
            },
        );

        let resampler_params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, resampler_params, chunk_size, 1)
            .context("Failed to create resampler")?;
        Ok(Some(resampler))
    }
}

impl Debug for StreamDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StreamDevice {{ device_type: {}, device: {}, config: {:?}, sample_format: {:?} }}",
            self.device_type,
            self.device.name().unwrap_or_default(),
            self.config,
            self.sample_format
        )
    }
}

pub struct DeviceSelector {}

impl DeviceSelector {
    /// Opens the preferred device, falling back to the default device and then to the best
    /// scoring one. The returned flag is `true` if a fallback was used.
    #[instrument(level = "debug", err)]
    pub fn open(
        device_type: DeviceType,
        preferred_host: Option<&str>,
        preferred_device_name: Option<&str>,
    ) -> Result<(StreamDevice, bool), AudioError> {
        tracing::debug!("Opening device");

        let host = Self::select_host(preferred_host);
        let (device, stream_config, is_fallback) =
            Self::pick_device_with_stream_config(device_type, &host, preferred_device_name)?;

        tracing::debug!(?stream_config, device = ?DeviceDebug(&device), ?is_fallback, "Opened device");
        Ok((
            StreamDevice {
                device_type,
                device,
                config: stream_config.config(),
                sample_format: stream_config.sample_format(),
            },
            is_fallback,
        ))
    }

    #[instrument(level = "trace")]
    fn select_host(preferred_host: Option<&str>) -> cpal::Host {
        let hosts = cpal::available_hosts();

        if let Some(name) = preferred_host {
            if let Some(id) = hosts.iter().find(|id| id.name().eq_ignore_ascii_case(name)) {
                tracing::trace!(?id, "Selected preferred audio host");
                return cpal::host_from_id(*id).unwrap_or(cpal::default_host());
            }
            if let Some(id) = hosts
                .iter()
                .find(|id| id.name().to_lowercase().contains(&name.to_lowercase()))
            {
                tracing::trace!(?id, "Selected preferred audio host (substring match)");
                return cpal::host_from_id(*id).unwrap_or(cpal::default_host());
            }
            tracing::warn!(?name, "Preferred audio host not available, using default");
        }

        cpal::default_host()
    }

    #[instrument(level = "trace", err, skip(host), fields(host = ?HostDebug(host)))]
    fn pick_device_with_stream_config(
        device_type: DeviceType,
        host: &cpal::Host,
        preferred_device_name: Option<&str>,
    ) -> Result<(cpal::Device, SupportedStreamConfig, bool), AudioError> {
        let (device, is_fallback) = Self::select_device(device_type, host, preferred_device_name)?;

        match Self::pick_best_stream_config(&device, device_type) {
            Ok((config, _)) => Ok((device, config, is_fallback)),
            Err(err @ AudioError::MediaAccess { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(?err, device = ?DeviceDebug(&device), "Failed to pick stream config, picking best fallback device");

                let best = Self::host_devices(device_type, host)?
                    .into_iter()
                    .filter_map(|dev| {
                        Self::pick_best_stream_config(&dev, device_type)
                            .ok()
                            .map(|(config, score)| (dev, config, score))
                    })
                    .min_by_key(|(_, _, score)| *score);

                match best {
                    Some((dev, config, _)) => {
                        tracing::info!(device = ?DeviceDebug(&dev), ?config, "Selected fallback device");
                        Ok((dev, config, true))
                    }
                    None => Err(AudioError::not_found(format!(
                        "no {device_type} device with a supported stream config"
                    ))),
                }
            }
        }
    }

    fn host_devices(
        device_type: DeviceType,
        host: &cpal::Host,
    ) -> Result<Vec<cpal::Device>, AudioError> {
        Ok(match device_type {
            DeviceType::Input => host.input_devices()?.collect(),
            DeviceType::Output => host.output_devices()?.collect(),
        })
    }

    #[instrument(level = "trace", err, skip(host), fields(host = ?HostDebug(host)))]
    fn select_device(
        device_type: DeviceType,
        host: &cpal::Host,
        preferred_device_name: Option<&str>,
    ) -> Result<(cpal::Device, bool), AudioError> {
        if let Some(name) = preferred_device_name {
            let devices = Self::host_devices(device_type, host)?;
            let lower = name.to_lowercase();

            if let Some(device) = devices
                .iter()
                .find(|d| d.name().is_ok_and(|n| n.eq_ignore_ascii_case(name)))
                .or_else(|| {
                    devices
                        .iter()
                        .find(|d| d.name().is_ok_and(|n| n.to_lowercase().contains(&lower)))
                })
            {
                tracing::trace!(device = ?DeviceDebug(device), "Selected preferred device");
                return Ok((device.clone(), false));
            }
            tracing::warn!(?name, "Preferred device not found, using default");
        }

        let device = match device_type {
            DeviceType::Input => host.default_input_device(),
            DeviceType::Output => host.default_output_device(),
        }
        .ok_or_else(|| AudioError::not_found(format!("no default {device_type} device")))?;

        tracing::trace!(device = ?DeviceDebug(&device), "Selected default device");
        Ok((device, preferred_device_name.is_some()))
    }

    #[instrument(level = "trace", err, skip(device), fields(device = ?DeviceDebug(device)))]
    fn pick_best_stream_config(
        device: &cpal::Device,
        device_type: DeviceType,
    ) -> Result<(SupportedStreamConfig, StreamConfigScore), AudioError> {
        let (configs, preferred_channels): (Vec<SupportedStreamConfigRange>, u16) =
            match device_type {
                DeviceType::Input => (device.supported_input_configs()?.collect(), 1),
                DeviceType::Output => (device.supported_output_configs()?.collect(), 2),
            };

        let (range, score) = configs
            .into_iter()
            .map(|range| {
                let score = score_stream_config_range(
                    range.min_sample_rate().0,
                    range.max_sample_rate().0,
                    range.channels(),
                    range.sample_format(),
                    preferred_channels,
                );
                (range, score)
            })
            .min_by_key(|(_, score)| *score)
            .ok_or(AudioError::UnsupportedConfig)?;

        let sample_rate = closest_sample_rate(range.min_sample_rate().0, range.max_sample_rate().0);

        tracing::trace!(?range, ?score, ?sample_rate, "Picked best stream config");
        Ok((range.with_sample_rate(cpal::SampleRate(sample_rate)), score))
    }
}

/// Lower is better: sample rate distance first, then channel distance, then sample format.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct StreamConfigScore(u32, u16, u8);

fn score_stream_config_range(
    min_rate: u32,
    max_rate: u32,
    channels: u16,
    format: SampleFormat,
    preferred_channels: u16,
) -> StreamConfigScore {
    let format_preference = match format {
        SampleFormat::F32 => 0,
        SampleFormat::I16 => 1,
        SampleFormat::U16 => 2,
        _ => 3,
    };

    StreamConfigScore(
        sample_rate_distance(min_rate, max_rate),
        channels.abs_diff(preferred_channels),
        format_preference,
    )
}

fn sample_rate_distance(min: u32, max: u32) -> u32 {
    if min <= TARGET_SAMPLE_RATE && max >= TARGET_SAMPLE_RATE {
        0
    } else if TARGET_SAMPLE_RATE < min {
        min - TARGET_SAMPLE_RATE
    } else {
        TARGET_SAMPLE_RATE - max
    }
}

fn closest_sample_rate(min: u32, max: u32) -> u32 {
    TARGET_SAMPLE_RATE.clamp(min, max.max(min))
}

struct DeviceDebug<'a>(&'a cpal::Device);

impl Debug for DeviceDebug<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&self.0.name().unwrap_or_default())
            .finish()
    }
}

struct HostDebug<'a>(&'a cpal::Host);

impl Debug for HostDebug<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Host").field(&self.0.id().name()).finish()
    }
}
