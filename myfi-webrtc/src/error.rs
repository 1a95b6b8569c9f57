use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebrtcError {
    #[error("peer connection is closed")]
    Closed,
    #[error("peer media is already started")]
    AlreadyStarted,
    #[error("invalid session description: {0}")]
    InvalidSessionDescription(String),
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for WebrtcError {
    fn from(err: anyhow::Error) -> Self {
        WebrtcError::Other(Box::new(err))
    }
}
