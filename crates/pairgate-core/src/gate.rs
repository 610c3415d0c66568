//! Dashboard gate: access is granted only with an established session.
//!
//! Recovery is never automatic. After every failure the caller's
//! [`RecoveryPrompt`] decides between soft retry, hard retry and abandoning.

use std::future::Future;

use crate::handshake::{
    Handshake, HandshakeError, HandshakeOutcome, HandshakeSnapshot, HandshakeState,
};
use crate::session::mask_id;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Soft retry.
    Retry,
    /// Hard retry with a frame reload.
    ForceRetry,
    Abandon,
}

/// Asks the user how to recover from a failed handshake.
pub trait RecoveryPrompt: Send {
    fn choose(
        &mut self,
        snapshot: &HandshakeSnapshot,
    ) -> impl Future<Output = RecoveryAction> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted {
        pairing_id: String,
        /// The session already existed; no handshake ran.
        resumed: bool,
    },
    /// The user abandoned, or the handshake was closed elsewhere.
    Denied(Option<HandshakeError>),
}

/// Returns the stored session, or runs the handshake until it succeeds or the
/// user gives up.
pub async fn ensure_connected<T, P>(handshake: &Handshake<T>, prompt: &mut P) -> Access
where
    T: Transport + 'static,
    P: RecoveryPrompt,
{
    let store = handshake.store();
    if store.is_connected()
        && let Some(pairing_id) = store.user_pairing_id()
    {
        tracing::debug!(pairing_id = %mask_id(&pairing_id), "resuming stored session");
        return Access::Granted {
            pairing_id,
            resumed: true,
        };
    }

    if handshake.snapshot().state == HandshakeState::Success {
        tracing::debug!("stored session is gone, discarding stale handshake success");
        handshake.reset();
    }

    let mut outcome = handshake.open().await;
    loop {
        match outcome {
            HandshakeOutcome::Connected { pairing_id } => {
                return Access::Granted {
                    pairing_id,
                    resumed: false,
                };
            }
            HandshakeOutcome::Closed | HandshakeOutcome::AlreadyRunning => {
                return Access::Denied(None);
            }
            HandshakeOutcome::Failed(err) => {
                let snapshot = handshake.snapshot();
                outcome = match prompt.choose(&snapshot).await {
                    RecoveryAction::Retry => handshake.retry().await,
                    RecoveryAction::ForceRetry => handshake.force_retry().await,
                    RecoveryAction::Abandon => {
                        tracing::info!(kind = %err.kind(), "handshake abandoned");
                        handshake.close();
                        return Access::Denied(Some(err));
                    }
                };
            }
        }
    }
}
