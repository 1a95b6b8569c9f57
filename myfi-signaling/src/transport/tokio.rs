use crate::error::{SignalingError, SignalingRuntimeError, TransportFailureReason};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use myfi_protocol::SignalingMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_PING_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_PONG_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport to the signaling relay.
#[derive(Debug, Clone)]
pub struct TokioTransport {
    url: String,
}

impl TokioTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl SignalingTransport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::info!("Connecting to signaling relay");
        let (websocket_stream, response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&self.url))
                .await
                .map_err(|_| {
                    tracing::warn!("Timed out connecting to signaling relay");
                    SignalingError::Timeout("Timeout connecting to signaling relay".to_string())
                })?
                .map_err(|err| {
                    tracing::error!(?err, "Failed to connect to signaling relay");
                    SignalingError::Runtime(SignalingRuntimeError::Transport(
                        TransportFailureReason::Connect(err.to_string()),
                    ))
                })?;
        tracing::debug!(?response, "WebSocket handshake response");

        let (websocket_tx, websocket_rx) = websocket_stream.split();

        tracing::info!("Successfully established connection to signaling relay");
        Ok((
            TokioSender::new(websocket_tx),
            TokioReceiver::new(websocket_rx),
        ))
    }
}

pub struct TokioSender {
    websocket_tx: SplitSink<WsStream, tungstenite::Message>,
}

pub struct TokioReceiver {
    websocket_rx: SplitStream<WsStream>,
    cancel: CancellationToken,
    liveness: Arc<Liveness>,
    heartbeat_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl SignalingSender for TokioSender {
    #[tracing::instrument(level = "debug", skip(self, msg), err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingRuntimeError> {
        if !matches!(
            msg,
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)
        ) {
            tracing::trace!("Sending message to relay");
        }
        self.websocket_tx.send(msg).await.map_err(|err| {
            tracing::warn!(?err, "Failed to send message");
            SignalingRuntimeError::Transport(TransportFailureReason::Send(err.to_string()))
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingRuntimeError> {
        let _ = self
            .websocket_tx
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "Failed to send Close frame");
            });

        self.websocket_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            SignalingRuntimeError::Transport(TransportFailureReason::Close(err.to_string()))
        })
    }
}

#[async_trait]
impl SignalingReceiver for TokioReceiver {
    #[tracing::instrument(level = "debug", skip(self, send_tx), err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingRuntimeError> {
        if self.heartbeat_task.is_none() {
            let heartbeat = Heartbeat {
                liveness: self.liveness.clone(),
                send_tx: send_tx.clone(),
                cancel: self.cancel.clone(),
            };
            self.heartbeat_task = Some(tokio::spawn(heartbeat.run()));
        }

        loop {
            let frame = tokio::select! {
                _ = self.liveness.lost.notified() => {
                    tracing::warn!("Disconnecting, relay stopped answering heartbeats");
                    return Err(SignalingRuntimeError::Disconnected);
                }
                frame = self.websocket_rx.next() => frame,
            };

            let Some(frame) = frame else {
                tracing::warn!("WebSocket stream closed");
                return Err(SignalingRuntimeError::Disconnected);
            };
            if let Some(result) = self.handle_frame(frame, send_tx).await {
                return result;
            }
        }
    }
}

impl TokioSender {
    fn new(websocket_tx: SplitSink<WsStream, tungstenite::Message>) -> Self {
        Self { websocket_tx }
    }
}

impl TokioReceiver {
    fn new(websocket_rx: SplitStream<WsStream>) -> Self {
        Self {
            websocket_rx,
            cancel: CancellationToken::new(),
            liveness: Arc::new(Liveness::new()),
            heartbeat_task: None,
        }
    }

    /// Returns `None` for control frames that were consumed here.
    async fn handle_frame(
        &self,
        frame: Result<tungstenite::Message, tungstenite::Error>,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Option<Result<SignalingMessage, SignalingRuntimeError>> {
        match frame {
            Ok(tungstenite::Message::Text(text)) => {
                tracing::debug!("Received message");
                self.liveness.saw_traffic();
                Some(SignalingMessage::deserialize(&text).map_err(|err| {
                    tracing::warn!(?err, "Failed to deserialize message");
                    SignalingRuntimeError::SerializationError(err.to_string())
                }))
            }
            Ok(tungstenite::Message::Close(reason)) => {
                tracing::warn!(?reason, "Relay closed the WebSocket");
                Some(Err(SignalingRuntimeError::Disconnected))
            }
            Ok(tungstenite::Message::Ping(data)) => {
                self.liveness.saw_traffic();
                match send_tx.send(tungstenite::Message::Pong(data)).await {
                    Ok(()) => None,
                    Err(err) => {
                        tracing::warn!(?err, "Failed to queue Pong");
                        Some(Err(SignalingRuntimeError::Disconnected))
                    }
                }
            }
            Ok(tungstenite::Message::Pong(_)) => {
                self.liveness.saw_pong();
                None
            }
            Ok(other) => {
                tracing::debug!(?other, "Skipping non-text WebSocket frame");
                None
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to receive message");
                Some(Err(SignalingRuntimeError::Transport(
                    TransportFailureReason::Receive(err.to_string()),
                )))
            }
        }
    }
}

impl Drop for TokioReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

/// What the receiver knows about the relay being alive, shared with the heartbeat task.
struct Liveness {
    last_traffic: Mutex<Instant>,
    pongs: watch::Sender<u64>,
    lost: Notify,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_traffic: Mutex::new(Instant::now()),
            pongs: watch::Sender::new(0),
            lost: Notify::new(),
        }
    }

    fn saw_traffic(&self) {
        *self.last_traffic.lock() = Instant::now();
    }

    fn saw_pong(&self) {
        self.saw_traffic();
        self.pongs.send_modify(|count| *count = count.wrapping_add(1));
    }

    fn quiet_for(&self) -> Duration {
        self.last_traffic.lock().elapsed()
    }
}

/// Pings the relay while the line is quiet and flags the connection as lost if no pong follows.
struct Heartbeat {
    liveness: Arc<Liveness>,
    send_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
}

impl Heartbeat {
    async fn run(self) {
        let mut ticker = tokio::time::interval(HEARTBEAT_PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Gaps far beyond the interval mean the machine was suspended.
            let gap = last_tick.elapsed();
            last_tick = Instant::now();
            if gap > HEARTBEAT_PING_INTERVAL * 3 {
                tracing::warn!(?gap, "Heartbeat stalled, assuming system sleep");
                self.liveness.lost.notify_one();
                break;
            }

            if self.liveness.quiet_for() < HEARTBEAT_PING_INTERVAL / 2 {
                continue;
            }

            if !self.ping().await {
                self.liveness.lost.notify_one();
                break;
            }
        }
        tracing::trace!("Heartbeat task finished");
    }

    /// Sends a ping and waits for the matching pong.
    async fn ping(&self) -> bool {
        let mut pongs = self.liveness.pongs.subscribe();

        let ping = tungstenite::Message::Ping(tungstenite::Bytes::new());
        if let Err(err) = self.send_tx.send(ping).await {
            tracing::warn!(?err, "Failed to queue heartbeat ping");
            return false;
        }

        match tokio::time::timeout(HEARTBEAT_PONG_TIMEOUT, pongs.changed()).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(timeout = ?HEARTBEAT_PONG_TIMEOUT, "No pong from relay");
                false
            }
        }
    }
}
