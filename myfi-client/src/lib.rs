pub mod config;
pub mod console;
pub mod contacts;
pub mod history;
pub mod media;

use crate::config::{ClientConfig, LoggingConfig, MAX_CALL_HISTORY};
use crate::console::{Console, ConsoleObserver};
use crate::contacts::HttpContactDirectory;
use crate::history::CallLog;
use crate::media::PeerMediaBackend;
use anyhow::Context;
use myfi_call::{CallConfig, CallDeps, CallManager, ContactDirectory};
use myfi_signaling::client::SignalingClient;
use myfi_signaling::transport::tokio::TokioTransport;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_tracing(config: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = &config.level;
            format!(
                "myfi_client={level},myfi_client_lib={level},myfi_call={level},myfi_signaling={level},myfi_webrtc={level},myfi_audio={level}"
            )
            .into()
        }))
        .with(fmt::layer())
        .init();
}

/// Connects to the relay and runs the console until the user quits or ctrl-c is pressed.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    let shutdown_token = CancellationToken::new();

    let signaling = Arc::new(SignalingClient::new(
        TokioTransport::new(&config.backend.ws_url),
        |event| async move {
            tracing::trace!(?event, "Signaling event");
        },
        shutdown_token.child_token(),
        config.signaling.max_reconnect_attempts(),
        &tokio::runtime::Handle::current(),
    ));

    let directory = Arc::new(
        HttpContactDirectory::new(config.backend.contacts_url(), config.backend.timeout())
            .context("Failed to create contacts client")?,
    );
    let history = Arc::new(CallLog::new(MAX_CALL_HISTORY));

    let deps = CallDeps {
        media: Arc::new(PeerMediaBackend::new(
            config.ice.clone(),
            config.audio.clone(),
        )),
        outbox: signaling.clone(),
        observer: Arc::new(ConsoleObserver),
        directory: config
            .call
            .check_online
            .then(|| directory.clone() as Arc<dyn ContactDirectory>),
        history: history.clone(),
    };

    // Subscribe before connecting so the first events are not missed.
    let (calls, manager_task) = CallManager::spawn(
        CallConfig::from(&config.call),
        deps,
        signaling.subscribe(),
        shutdown_token.child_token(),
    );

    signaling
        .connect()
        .await
        .context("Failed to connect to signaling relay")?;
    tracing::info!(url = %config.backend.ws_url, "Connected to signaling relay");

    let console = Console::new(calls.clone(), Some(directory), history);
    let result = tokio::select! {
        result = console.run(shutdown_token.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received ctrl-c, exiting");
            Ok(())
        }
    };

    if calls.snapshot().is_some()
        && let Err(err) = calls.hang_up().await
    {
        tracing::debug!(?err, "Failed to hang up on exit");
    }

    shutdown_token.cancel();
    signaling.disconnect().await;
    if let Err(err) = manager_task.await {
        tracing::warn!(?err, "Call manager task failed");
    }

    result
}
