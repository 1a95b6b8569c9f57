use crate::error::{SignalingError, SignalingRuntimeError};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use myfi_protocol::SignalingMessage;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const BROADCAST_CHANNEL_SIZE: usize = 100;
const SEND_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection to the relay. Messages sent in this state are dropped.
    /// Also entered when a disconnect is requested or one of the worker tasks fails.
    Disconnected,
    /// Connected to the relay, messages can be sent and received.
    Connected,
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Emitted every time a connection to the relay has been established, including reconnects.
    Connected,
    /// Emitted for every [`SignalingMessage`] received from the relay.
    Message(SignalingMessage),
    /// Emitted for every [`SignalingRuntimeError`] raised while connected.
    /// Fatal errors are followed by a reconnect attempt if the error allows it.
    Error(SignalingRuntimeError),
}

type BoxFutUnit = Pin<Box<dyn Future<Output = ()> + Send>>;
type OnEventCb = Arc<dyn Fn(SignalingEvent) -> BoxFutUnit + Send + Sync>;

/// Persistent connection to the signaling relay.
///
/// The connection lifecycle is independent of any call: a supervisor task watches for fatal
/// errors and reconnects with jittered exponential backoff until `reconnect_max_tries` is
/// exhausted or the shutdown token is cancelled.
pub struct SignalingClient<ST: SignalingTransport> {
    inner: Arc<SignalingClientInner<ST>>,
    supervisor_task: JoinHandle<()>,
}

impl<ST: SignalingTransport> SignalingClient<ST> {
    pub fn new<F, Fut>(
        transport: ST,
        on_event: F,
        shutdown_token: CancellationToken,
        reconnect_max_tries: u8,
        handle: &tokio::runtime::Handle,
    ) -> Self
    where
        F: Fn(SignalingEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::new(SignalingClientInner::new(
            transport,
            Arc::new(move |e| Box::pin(on_event(e))),
            shutdown_token,
            reconnect_max_tries,
        ));

        let inner_clone = inner.clone();
        let supervisor_task = handle.spawn(async move {
            inner_clone.supervisor_task().await;
        });

        Self {
            inner,
            supervisor_task,
        }
    }

    /// Subscribes to a broadcast channel emitting [`SignalingEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.subscribe()
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Connects to the relay. Calling this while connected tears the existing connection down
    /// first, so there is never more than one live connection.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.inner.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Fire-and-forget send. If the client is disconnected the message is dropped.
    pub async fn send(&self, msg: SignalingMessage) {
        if let Err(err) = self.inner.try_send(msg).await {
            tracing::warn!(?err, "Dropping signaling message");
        }
    }

    pub async fn try_send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.inner.try_send(msg).await
    }
}

impl<ST: SignalingTransport> Drop for SignalingClient<ST> {
    fn drop(&mut self) {
        self.inner.shutdown_token.cancel();
        self.supervisor_task.abort();
    }
}

struct SignalingClientInner<ST: SignalingTransport> {
    transport: ST,

    on_event: OnEventCb,

    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,

    disconnect_token: Mutex<CancellationToken>,
    shutdown_token: CancellationToken,

    broadcast_tx: broadcast::Sender<SignalingEvent>,

    send_tx: Mutex<Option<mpsc::Sender<tungstenite::Message>>>,

    reconnect_max_tries: u8,

    worker_tasks: Mutex<JoinSet<()>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl<ST: SignalingTransport> SignalingClientInner<ST> {
    #[instrument(level = "debug", skip_all)]
    fn new(
        transport: ST,
        on_event: OnEventCb,
        shutdown_token: CancellationToken,
        reconnect_max_tries: u8,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(State::Disconnected);
        Self {
            transport,

            on_event,

            state_tx,
            state_rx,

            disconnect_token: Mutex::new(shutdown_token.child_token()),
            shutdown_token,

            broadcast_tx: broadcast::channel(BROADCAST_CHANNEL_SIZE).0,

            send_tx: Mutex::new(None),

            reconnect_max_tries,

            worker_tasks: Mutex::new(JoinSet::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.broadcast_tx.subscribe()
    }

    fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    #[instrument(level = "debug", skip_all)]
    async fn disconnect(&self) {
        self.disconnect_token.lock().cancel();
        self.set_state(State::Disconnected);
        self.cleanup().await;
    }

    #[instrument(level = "debug", skip(self), fields(message_type = msg.message_type()), err)]
    async fn try_send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if self.state() == State::Disconnected {
            tracing::warn!("Tried to send message while disconnected");
            return Err(SignalingError::Runtime(SignalingRuntimeError::Disconnected));
        }

        let send_tx = {
            self.send_tx.lock().as_ref().cloned().ok_or_else(|| {
                tracing::error!("Client is connected, but send_tx is not initialized");
                SignalingError::Runtime(SignalingRuntimeError::Disconnected)
            })?
        };

        tracing::debug!("Sending message to send channel");
        let serialized = SignalingMessage::serialize(&msg).map_err(|err| {
            tracing::warn!(?err, "Failed to serialize message");
            SignalingError::Runtime(SignalingRuntimeError::SerializationError(err.to_string()))
        })?;

        send_tx
            .send(tungstenite::Message::from(serialized))
            .await
            .map_err(|_| SignalingError::Runtime(SignalingRuntimeError::Disconnected))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn connect(&self) -> Result<(), SignalingError> {
        let _guard = self.connect_lock.lock().await;

        if self.state() != State::Disconnected {
            tracing::debug!("Already connected, tearing down existing connection first");
            self.disconnect().await;
        }

        tracing::trace!("Connecting to signaling relay");
        let (sender, receiver) = self.transport.connect().await?;

        let (send_tx, send_rx) = mpsc::channel::<tungstenite::Message>(SEND_CHANNEL_SIZE);
        tracing::trace!("Successfully connected to signaling relay, starting worker tasks");
        {
            let mut tasks = self.worker_tasks.lock();
            let rt_handle = tokio::runtime::Handle::current();
            let disconnect_token = self.disconnect_token.lock().clone();

            tasks.spawn_on(
                Self::reader_task(
                    receiver,
                    send_tx.clone(),
                    self.broadcast_tx.clone(),
                    disconnect_token.clone(),
                    self.subscribe_state(),
                ),
                &rt_handle,
            );

            tasks.spawn_on(
                Self::writer_task(
                    sender,
                    send_rx,
                    self.broadcast_tx.clone(),
                    disconnect_token,
                    self.subscribe_state(),
                ),
                &rt_handle,
            );
        }

        *self.send_tx.lock() = Some(send_tx);
        self.set_state(State::Connected);

        if let Err(err) = self.broadcast_tx.send(SignalingEvent::Connected) {
            tracing::trace!(?err, "No subscribers for connected event");
        }

        tracing::info!("Signaling client connected");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn cleanup(&self) {
        tracing::debug!("Cleaning up after disconnect");

        let mut worker_tasks = {
            let mut worker_tasks = self.worker_tasks.lock();
            std::mem::replace(&mut *worker_tasks, JoinSet::new())
        };

        tracing::trace!("Aborting worker tasks");
        worker_tasks.abort_all();
        while let Some(res) = worker_tasks.join_next().await {
            if let Err(err) = res
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join worker task");
            }
        }

        *self.disconnect_token.lock() = self.shutdown_token.child_token();
        self.send_tx.lock().take();

        tracing::debug!("Finished cleaning up after disconnect");
    }

    #[instrument(level = "debug", skip(self))]
    async fn supervisor_task(self: Arc<Self>) {
        tracing::debug!("Starting supervisor task");

        let mut broadcast_rx = self.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("Shutdown signal received, exiting supervisor task");
                    self.set_state(State::Disconnected);
                    break;
                }

                event = broadcast_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let SignalingEvent::Error(err) = &event && err.is_fatal() {
                                (self.on_event)(event.clone()).await;

                                tracing::debug!(?err, "Received fatal error event, disconnecting");
                                self.disconnect().await;

                                if err.can_reconnect() {
                                    tracing::info!("Reconnecting after error");
                                    if let Err(err) = self.reconnect().await {
                                        tracing::warn!(?err, "Giving up on reconnecting");
                                        if let Err(err) = self.broadcast_tx.send(SignalingEvent::Error(err)) {
                                            tracing::warn!(?err, "Failed to broadcast reconnect error event");
                                        }
                                    }
                                }
                            } else {
                                (self.on_event)(event).await;
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(?skipped, "Supervisor lagged behind signaling events");
                        }
                        Err(err) => {
                            tracing::warn!(?err, "Failed to receive broadcast event, exiting supervisor task");
                            self.disconnect().await;
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("Supervisor task finished");
    }

    fn set_state(&self, state: State) {
        if let Err(err) = self.state_tx.send(state) {
            tracing::warn!(?err, "Failed to update client state");
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn reconnect(&self) -> Result<(), SignalingRuntimeError> {
        if self.reconnect_max_tries == 0 {
            tracing::debug!("Reconnecting disabled");
            return Err(SignalingRuntimeError::ReconnectFailed(
                "reconnecting disabled".to_string(),
            ));
        }

        let mut retry_strategy = RetryStrategy::default();

        let mut reconnect_error = SignalingError::Other("Unknown".to_string());
        for attempt in 1..=self.reconnect_max_tries {
            tracing::trace!(?attempt, "Reconnecting");
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let timeout = retry_strategy.timeout(attempt as u32);
                    tracing::warn!(?err, ?attempt, ?timeout, "Failed to reconnect");
                    reconnect_error = err;
                    tokio::select! {
                        biased;
                        _ = self.shutdown_token.cancelled() => break,
                        _ = tokio::time::sleep(timeout) => {}
                    }
                }
            }
        }

        Err(SignalingRuntimeError::ReconnectFailed(
            reconnect_error.to_string(),
        ))
    }

    #[instrument(level = "debug", skip(state_rx, broadcast_tx))]
    fn emit_task_error(
        state_rx: &watch::Receiver<State>,
        broadcast_tx: &broadcast::Sender<SignalingEvent>,
        err: SignalingRuntimeError,
    ) {
        let state = *state_rx.borrow();
        tracing::warn!(?state, "Received error from task");
        if state == State::Connected
            && broadcast_tx
                .send(SignalingEvent::Error(err.clone()))
                .is_err()
        {
            tracing::warn!("Failed to broadcast task error signaling event");
        }
    }

    #[instrument(level = "debug", skip_all)]
    fn reader_task<R: SignalingReceiver>(
        mut receiver: R,
        send_tx: mpsc::Sender<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<SignalingEvent>,
        disconnect_token: CancellationToken,
        state_rx: watch::Receiver<State>,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport reader task");
            let _guard = TaskDropLogger::new("reader");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, exiting transport reader task");
                        break;
                    }

                    msg = receiver.recv(&send_tx) => {
                        match msg {
                            Ok(message) => {
                                if broadcast_tx.receiver_count() > 0 {
                                    tracing::trace!(message_type = message.message_type(), "Broadcasting message");
                                    if let Err(err) = broadcast_tx.send(SignalingEvent::Message(message)) {
                                        tracing::warn!(?err, "Failed to broadcast message");
                                    }
                                } else {
                                    tracing::trace!(message_type = message.message_type(), "No receivers subscribed, not broadcasting message");
                                }
                            }
                            Err(err) if !err.is_fatal() => {
                                Self::emit_task_error(&state_rx, &broadcast_tx, err);
                            }
                            Err(err) => {
                                Self::emit_task_error(&state_rx, &broadcast_tx, err);
                                break;
                            }
                        }
                    }
                }
            }
        }.instrument(tracing::Span::current())
    }

    #[instrument(level = "debug", skip_all)]
    fn writer_task<S: SignalingSender>(
        mut sender: S,
        mut send_rx: mpsc::Receiver<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<SignalingEvent>,
        disconnect_token: CancellationToken,
        state_rx: watch::Receiver<State>,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport writer task");
            let _guard = TaskDropLogger::new("writer");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, closing sender");

                        if let Err(err) = sender.close().await {
                            tracing::warn!(?err, "Failed to close transport");
                        }
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if !matches!(msg, tungstenite::Message::Pong(_) | tungstenite::Message::Ping(_)) {
                                    tracing::debug!("Sending message to transport");
                                }

                                if let Err(err) = sender.send(msg).await {
                                    Self::emit_task_error(&state_rx, &broadcast_tx, err);
                                    break;
                                }
                            },
                            None => {
                                Self::emit_task_error(&state_rx, &broadcast_tx, SignalingRuntimeError::Disconnected);
                                break;
                            }
                        }
                    }
                }
            }
        }.instrument(tracing::Span::current())
    }
}

struct TaskDropLogger {
    name: &'static str,
}

impl TaskDropLogger {
    fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Drop for TaskDropLogger {
    fn drop(&mut self) {
        tracing::trace!(task_name = ?self.name, "Task dropped");
    }
}

/// Full-jitter exponential backoff.
pub struct RetryStrategy {
    base: Duration,
    cap: Duration,
    rng: rand::rngs::StdRng,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            rng: rand::rngs::StdRng::from_os_rng(),
        }
    }
}

impl RetryStrategy {
    pub fn timeout(&mut self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // exp = base * 2^(attempt - 1), capped
        let exp_nanos = self
            .base
            .as_nanos()
            .saturating_mul(1u128 << attempt.saturating_sub(1).min(63));
        let max_delay_nanos = exp_nanos.min(self.cap.as_nanos());

        let jitter_nanos = if max_delay_nanos == 0 {
            0
        } else {
            self.rng.random_range(0..=max_delay_nanos)
        };

        Duration::from_nanos(jitter_nanos.min(u128::from(u64::MAX)) as u64)
    }
}
