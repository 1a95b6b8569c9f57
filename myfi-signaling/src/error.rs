use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Runtime(#[from] SignalingRuntimeError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

/// Errors raised while a connection to the relay is (supposed to be) live.
///
/// These are broadcast as [`crate::client::SignalingEvent::Error`] so consumers can react to a lost
/// connection, e.g. by failing calls that were in flight.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingRuntimeError {
    #[error("disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(TransportFailureReason),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),
}

impl SignalingRuntimeError {
    /// Whether the error terminated the current connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SignalingRuntimeError::SerializationError(_))
    }

    /// Whether the client should try to re-establish the connection after this error.
    pub fn can_reconnect(&self) -> bool {
        matches!(
            self,
            SignalingRuntimeError::Disconnected | SignalingRuntimeError::Transport(_)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailureReason {
    #[error("connect: {0}")]
    Connect(String),
    #[error("send: {0}")]
    Send(String),
    #[error("receive: {0}")]
    Receive(String),
    #[error("close: {0}")]
    Close(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(SignalingRuntimeError::Disconnected.is_fatal());
        assert!(SignalingRuntimeError::Disconnected.can_reconnect());

        let transport = SignalingRuntimeError::Transport(TransportFailureReason::Receive(
            "connection reset".to_string(),
        ));
        assert!(transport.is_fatal());
        assert!(transport.can_reconnect());

        let serialization = SignalingRuntimeError::SerializationError("bad json".to_string());
        assert!(!serialization.is_fatal());
        assert!(!serialization.can_reconnect());

        let reconnect = SignalingRuntimeError::ReconnectFailed("gave up".to_string());
        assert!(reconnect.is_fatal());
        assert!(!reconnect.can_reconnect());
    }
}
