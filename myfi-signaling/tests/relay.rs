use futures_util::{SinkExt, StreamExt};
use myfi_signaling::client::{SignalingClient, SignalingEvent, State};
use myfi_signaling::protocol::{SessionDescription, SignalingMessage};
use myfi_signaling::test_utils::AwaitSignalingEventExt;
use myfi_signaling::transport::tokio::TokioTransport;
use pretty_assertions::assert_matches;
use std::time::Duration;
use test_log::test;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

/// Minimal relay: answers every `call_user` with `call_failed` and drops the connection when it
/// receives a `hang_up`.
async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(frame)) = ws.next().await {
                    let tungstenite::Message::Text(text) = frame else {
                        continue;
                    };
                    match SignalingMessage::deserialize(&text).unwrap() {
                        SignalingMessage::CallUser { .. } => {
                            let reply = SignalingMessage::serialize(&SignalingMessage::CallFailed {
                                reason: "User is offline".to_string(),
                            })
                            .unwrap();
                            ws.send(tungstenite::Message::from(reply)).await.unwrap();
                        }
                        SignalingMessage::HangUp { .. } => {
                            let _ = ws.close(None).await;
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

fn client(url: &str, reconnect_max_tries: u8) -> SignalingClient<TokioTransport> {
    SignalingClient::new(
        TokioTransport::new(url),
        |_| async {},
        CancellationToken::new(),
        reconnect_max_tries,
        &tokio::runtime::Handle::current(),
    )
}

#[test(tokio::test)]
async fn call_user_to_offline_peer() {
    let url = spawn_relay().await;
    let client = client(&url, 0);
    client.connect().await.unwrap();
    let mut events = client.subscribe();

    client
        .try_send(SignalingMessage::CallUser {
            callee_id: "7".to_string(),
            offer: SessionDescription::offer("v=0"),
        })
        .await
        .unwrap();

    let event = events
        .recv_with_timeout(Duration::from_secs(1), |e| {
            matches!(e, SignalingEvent::Message(_))
        })
        .await
        .unwrap();
    assert_matches!(
        event,
        SignalingEvent::Message(msg) if msg == SignalingMessage::CallFailed {
            reason: "User is offline".to_string()
        }
    );
}

#[test(tokio::test)]
async fn reconnects_after_relay_closes() {
    let url = spawn_relay().await;
    let client = client(&url, 3);
    client.connect().await.unwrap();
    let mut events = client.subscribe();

    client
        .try_send(SignalingMessage::HangUp {
            other_user_id: "7".to_string(),
            call_id: None,
            duration: 0,
        })
        .await
        .unwrap();

    events
        .recv_with_timeout(Duration::from_secs(2), |e| matches!(e, SignalingEvent::Error(_)))
        .await
        .unwrap();
    events
        .recv_with_timeout(Duration::from_secs(5), |e| matches!(e, SignalingEvent::Connected))
        .await
        .unwrap();
    assert_matches!(client.state(), State::Connected);
}

#[test(tokio::test)]
async fn connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(&format!("ws://{addr}"), 0);
    assert!(client.connect().await.is_err());
    assert_matches!(client.state(), State::Disconnected);
}
