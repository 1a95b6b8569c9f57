use cpal::{BuildStreamError, DevicesError, PlayStreamError, StreamError, SupportedStreamConfigsError};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Why the local microphone (or speaker) could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAccessKind {
    /// The device exists but the OS or another application refused access.
    Denied,
    /// No usable device is present.
    NotFound,
}

impl Display for MediaAccessKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaAccessKind::Denied => write!(f, "denied"),
            MediaAccessKind::NotFound => write!(f, "not found"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("media access {kind}: {message}")]
    MediaAccess {
        kind: MediaAccessKind,
        message: String,
    },
    #[error("unsupported stream config")]
    UnsupportedConfig,
    #[error("audio device was disconnected")]
    DeviceLost,
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl AudioError {
    pub fn denied(message: impl Into<String>) -> Self {
        AudioError::MediaAccess {
            kind: MediaAccessKind::Denied,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AudioError::MediaAccess {
            kind: MediaAccessKind::NotFound,
            message: message.into(),
        }
    }

    pub fn media_access_kind(&self) -> Option<MediaAccessKind> {
        match self {
            AudioError::MediaAccess { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Backends report permission problems only as free text.
    fn from_backend(description: String) -> Self {
        let lower = description.to_lowercase();
        if ["permission", "denied", "not allowed", "unauthorized", "busy"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            AudioError::denied(description)
        } else if ["not found", "no such", "no device"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            AudioError::not_found(description)
        } else {
            AudioError::from(anyhow::anyhow!(description))
        }
    }
}

impl From<anyhow::Error> for AudioError {
    fn from(err: anyhow::Error) -> Self {
        AudioError::Other(Box::new(err))
    }
}

impl From<BuildStreamError> for AudioError {
    fn from(e: BuildStreamError) -> Self {
        use BuildStreamError::*;
        match e {
            DeviceNotAvailable => AudioError::not_found("audio device is not available"),
            StreamConfigNotSupported | InvalidArgument => AudioError::UnsupportedConfig,
            StreamIdOverflow => AudioError::from(anyhow::anyhow!("Stream ID overflow")),
            BackendSpecific { err } => {
                tracing::debug!(?err, "Backend specific cpal build stream error");
                AudioError::from_backend(err.description)
            }
        }
    }
}

impl From<PlayStreamError> for AudioError {
    fn from(e: PlayStreamError) -> Self {
        use PlayStreamError::*;
        match e {
            DeviceNotAvailable => AudioError::not_found("audio device is not available"),
            BackendSpecific { err } => {
                tracing::debug!(?err, "Backend specific cpal play stream error");
                AudioError::from_backend(err.description)
            }
        }
    }
}

impl From<DevicesError> for AudioError {
    fn from(e: DevicesError) -> Self {
        match e {
            DevicesError::BackendSpecific { err } => AudioError::from_backend(err.description),
        }
    }
}

impl From<SupportedStreamConfigsError> for AudioError {
    fn from(e: SupportedStreamConfigsError) -> Self {
        use SupportedStreamConfigsError::*;
        match e {
            DeviceNotAvailable => AudioError::not_found("audio device is not available"),
            InvalidArgument => AudioError::UnsupportedConfig,
            BackendSpecific { err } => AudioError::from_backend(err.description),
        }
    }
}

impl From<StreamError> for AudioError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::DeviceNotAvailable => AudioError::DeviceLost,
            StreamError::BackendSpecific { err } => {
                tracing::debug!(?err, "Backend specific cpal stream error");
                AudioError::from(anyhow::anyhow!(err.description))
            }
        }
    }
}
