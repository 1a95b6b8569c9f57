use crate::client::SignalingEvent;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite;

/// Waits on a broadcast receiver until an item matches the predicate, skipping everything else.
#[async_trait]
pub trait AwaitSignalingEventExt {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<SignalingEvent>
    where
        F: Fn(&SignalingEvent) -> bool + Send;
}

#[async_trait]
impl AwaitSignalingEventExt for broadcast::Receiver<SignalingEvent> {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<SignalingEvent>
    where
        F: Fn(&SignalingEvent) -> bool + Send,
    {
        await_matching(self, timeout, predicate).await
    }
}

#[async_trait]
pub trait AwaitTungsteniteMessageExt {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<tungstenite::Message>
    where
        F: Fn(&tungstenite::Message) -> bool + Send;
}

#[async_trait]
impl AwaitTungsteniteMessageExt for broadcast::Receiver<tungstenite::Message> {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<tungstenite::Message>
    where
        F: Fn(&tungstenite::Message) -> bool + Send,
    {
        await_matching(self, timeout, predicate).await
    }
}

async fn await_matching<T, F>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
    predicate: F,
) -> anyhow::Result<T>
where
    T: Clone + Send,
    F: Fn(&T) -> bool + Send,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(item)) if predicate(&item) => return Ok(item),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(anyhow::anyhow!("Timeout")),
        }
    }
}
