//! Cross-frame transport contract.
//!
//! The message transport itself lives outside this crate; the orchestrator only
//! consumes it through [`Transport`]. Each asynchronous call settles on its own
//! and may reject. Rejections carry an opaque message that is surfaced verbatim.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// Rejection returned by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The three asynchronous transport calls, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStep {
    Readiness,
    Link,
    Pairing,
}

impl TransportStep {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportStep::Readiness => "readiness check",
            TransportStep::Link => "link request",
            TransportStep::Pairing => "pairing fetch",
        }
    }
}

impl fmt::Display for TransportStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response client over the cross-frame channel.
pub trait Transport: Send + Sync {
    /// Resolves once the remote party answers a readiness probe.
    fn is_ready(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Resolves once the remote party grants an authorization link.
    fn request_link(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Fetches and caches the pairing identifier.
    ///
    /// The identifier is read afterwards through [`Transport::pairing_id`].
    fn get_user_pairing_id(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Pairing identifier cached by the last successful fetch.
    fn pairing_id(&self) -> Option<String>;

    /// Drops the cached pairing identifier.
    fn forget_pairing(&self);

    /// Whether responses are simulated locally. Presentation only.
    fn is_in_mock_mode(&self) -> bool;
}
