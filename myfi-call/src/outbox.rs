use async_trait::async_trait;
use myfi_protocol::SignalingMessage;
use myfi_signaling::client::SignalingClient;
use myfi_signaling::transport::SignalingTransport;

/// Outbound half of the signaling channel as seen by the call manager.
///
/// Sending is fire-and-forget: messages sent while disconnected are dropped and the call manager
/// learns about the disconnect through the signaling event stream instead.
#[async_trait]
pub trait SignalingOutbox: Send + Sync + 'static {
    async fn send(&self, msg: SignalingMessage);
}

#[async_trait]
impl<ST: SignalingTransport> SignalingOutbox for SignalingClient<ST> {
    async fn send(&self, msg: SignalingMessage) {
        tracing::trace!(message_type = msg.message_type(), "Sending signaling message");
        SignalingClient::send(self, msg).await;
    }
}
