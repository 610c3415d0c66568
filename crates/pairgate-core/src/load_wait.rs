//! Load-completion waiter for the registered frame.
//!
//! Resolves once the frame's document finished loading (plus a settle delay so
//! the frame's own scripts can initialise), or fails on timeout / load error.
//! Listeners registered on the frame are removed on every exit path, including
//! the wait future being dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::frame::{FrameHandle, FrameRegistry, FrameSignal, ListenerId, ReadyState};
use crate::handshake::HandshakeError;

/// Budget for the frame document to finish loading.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after the load signal before the frame is considered usable.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Removes its listener from the frame when dropped.
struct Subscription {
    frame: Arc<dyn FrameHandle>,
    id: ListenerId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.frame.remove_listener(self.id);
    }
}

#[derive(Clone)]
pub struct LoadWaiter {
    registry: FrameRegistry,
    timeout: Duration,
    settle: Duration,
}

impl LoadWaiter {
    pub fn new(registry: FrameRegistry) -> Self {
        Self::with_timing(registry, DEFAULT_LOAD_TIMEOUT, DEFAULT_SETTLE_DELAY)
    }

    pub fn with_timing(registry: FrameRegistry, timeout: Duration, settle: Duration) -> Self {
        Self {
            registry,
            timeout,
            settle,
        }
    }

    /// Waits for the registered frame to finish loading.
    ///
    /// # Errors
    /// `FrameNotFound` when nothing is registered, `LoadTimeout` when no signal
    /// arrives within the budget, `LoadError` when the frame reports an error.
    pub async fn wait(&self) -> Result<(), HandshakeError> {
        let Some(frame) = self.registry.get_frame() else {
            return Err(HandshakeError::FrameNotFound);
        };

        if frame.ready_state() == Some(ReadyState::Complete) {
            tracing::debug!("frame document already complete");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = frame.add_listener(Box::new(move |signal: &FrameSignal| {
            let _ = tx.send(signal.clone());
        }));
        let subscription = Subscription {
            frame: Arc::clone(&frame),
            id,
        };

        // The load may have landed between the ready-state check and the subscription.
        let signal = if frame.ready_state() == Some(ReadyState::Complete) {
            Ok(Some(FrameSignal::Load))
        } else {
            tokio::time::timeout(self.timeout, rx.recv()).await
        };
        drop(subscription);

        match signal {
            Ok(Some(FrameSignal::Load)) => {
                tracing::debug!(settle_ms = self.settle.as_millis(), "frame loaded, settling");
                tokio::time::sleep(self.settle).await;
                Ok(())
            }
            Ok(Some(FrameSignal::Error(message))) => {
                tracing::warn!(%message, "frame failed to load");
                Err(HandshakeError::LoadError(message))
            }
            Ok(None) => Err(HandshakeError::LoadError(
                "frame stopped reporting load events".to_string(),
            )),
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "frame load timed out");
                Err(HandshakeError::LoadTimeout(self.timeout))
            }
        }
    }
}
