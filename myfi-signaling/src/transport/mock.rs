use crate::error::{SignalingError, SignalingRuntimeError, TransportFailureReason};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use myfi_protocol::SignalingMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

const CHANNEL_SIZE: usize = 32;

/// In-process transport standing in for the relay.
///
/// Frames written by the client show up on `outgoing_tx` (subscribe to observe them), frames sent
/// into `incoming_tx` are delivered to the client. Cancelling [`MockTransport::disconnect_token`]
/// simulates the relay dropping the connection; the next `connect` starts a fresh one.
#[derive(Clone)]
pub struct MockTransport {
    pub outgoing_tx: broadcast::Sender<tungstenite::Message>,
    pub incoming_tx: broadcast::Sender<tungstenite::Message>,
    pub ready: Arc<Notify>,
    disconnect_token: Arc<Mutex<CancellationToken>>,
    connects: Arc<AtomicUsize>,
    fail_connect: Arc<AtomicBool>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            outgoing_tx: broadcast::channel(CHANNEL_SIZE).0,
            incoming_tx: broadcast::channel(CHANNEL_SIZE).0,
            ready: Arc::new(Notify::new()),
            disconnect_token: Arc::new(Mutex::new(CancellationToken::new())),
            connects: Arc::new(AtomicUsize::new(0)),
            fail_connect: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MockTransport {
    /// Token of the current (or next) connection.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect_token.lock().clone()
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Delivers a message to the client as if the relay had sent it.
    pub fn deliver(&self, msg: &SignalingMessage) {
        if let Ok(serialized) = SignalingMessage::serialize(msg) {
            let _ = self
                .incoming_tx
                .send(tungstenite::Message::Text(serialized.into()));
        }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    #[tracing::instrument(level = "info", skip(self), err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            tracing::warn!("Mock connect failure");
            return Err(SignalingError::Runtime(SignalingRuntimeError::Transport(
                TransportFailureReason::Connect("mock connect failure".to_string()),
            )));
        }

        let token = {
            let mut token = self.disconnect_token.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        let sender = MockSender {
            tx: Some(self.outgoing_tx.clone()),
            token: token.clone(),
        };
        let receiver = MockReceiver {
            rx: self.incoming_tx.subscribe(),
            token,
        };

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.ready.notify_one();
        Ok((sender, receiver))
    }
}

pub struct MockSender {
    tx: Option<broadcast::Sender<tungstenite::Message>>,
    token: CancellationToken,
}

pub struct MockReceiver {
    rx: broadcast::Receiver<tungstenite::Message>,
    token: CancellationToken,
}

#[async_trait]
impl SignalingSender for MockSender {
    #[tracing::instrument(level = "debug", skip(self, msg), err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingRuntimeError> {
        match self.tx.as_ref() {
            Some(tx) if !self.token.is_cancelled() => {
                // No subscribers is fine, the test simply doesn't care about outgoing frames.
                let _ = tx.send(msg);
                Ok(())
            }
            _ => Err(SignalingRuntimeError::Transport(
                TransportFailureReason::Send("sender closed".to_string()),
            )),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingRuntimeError> {
        tracing::debug!("Closing MockSender");
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl SignalingReceiver for MockReceiver {
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingRuntimeError> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::warn!("Mock connection dropped");
                    return Err(SignalingRuntimeError::Disconnected);
                }
                msg = self.rx.recv() => msg,
            };

            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    return SignalingMessage::deserialize(&text).map_err(|err| {
                        tracing::warn!(?err, "Failed to deserialize message");
                        SignalingRuntimeError::SerializationError(err.to_string())
                    });
                }
                Ok(tungstenite::Message::Close(reason)) => {
                    tracing::warn!(?reason, "Received Close WebSocket frame");
                    return Err(SignalingRuntimeError::Disconnected);
                }
                Ok(tungstenite::Message::Ping(data)) => {
                    if let Err(err) = send_tx.send(tungstenite::Message::Pong(data)).await {
                        tracing::warn!(?err, "Failed to send mock Pong");
                        return Err(SignalingRuntimeError::Disconnected);
                    }
                }
                Ok(other) => {
                    tracing::debug!(?other, "Skipping non-text WebSocket frame");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(?skipped, "Mock receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Channel closed");
                    return Err(SignalingRuntimeError::Disconnected);
                }
            }
        }
    }
}
