pub mod capture;
pub mod playback;

use crate::error::AudioError;
use anyhow::Context;
use cpal::traits::StreamTrait;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

/// Owns a running cpal stream on a dedicated thread.
///
/// `cpal::Stream` is not `Send` on every platform, so the stream is built, played and dropped on
/// the same thread. Dropping the handle stops the stream.
pub(crate) struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    pub(crate) fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream.play()?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // blocks until the handle is stopped or dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::trace!("Audio stream thread finished");
            })
            .context("Failed to spawn audio stream thread")?;

        ready_rx
            .recv()
            .context("Audio stream thread exited before reporting readiness")??;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Audio stream thread panicked");
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}
