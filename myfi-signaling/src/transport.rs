#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod tokio;

use crate::error::{SignalingError, SignalingRuntimeError};
use ::tokio::sync::mpsc;
use async_trait::async_trait;
use myfi_protocol::SignalingMessage;
use tokio_tungstenite::tungstenite;

#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    type Sender: SignalingSender;
    type Receiver: SignalingReceiver;

    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError>;
}

#[async_trait]
pub trait SignalingSender: Send + Sync + 'static {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingRuntimeError>;
    async fn close(&mut self) -> Result<(), SignalingRuntimeError>;
}

#[async_trait]
pub trait SignalingReceiver: Send + Sync + 'static {
    /// Waits for the next call-control message. Control frames are handled internally, pongs are
    /// written through `send_tx`.
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingRuntimeError>;
}
