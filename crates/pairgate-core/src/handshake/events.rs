use tokio::sync::mpsc;

use super::state::HandshakeSnapshot;

/// Notifications published while a handshake runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// The session entered a new state.
    Progress(HandshakeSnapshot),
    /// The success display delay elapsed; the caller may proceed.
    Connected { pairing_id: String },
    /// The run ended in `Failed`.
    Failed(HandshakeSnapshot),
}

/// Channel-based event sender (unbounded, never blocks the orchestrator).
pub type HandshakeEventTx = mpsc::UnboundedSender<HandshakeEvent>;

/// Channel-based event receiver.
pub type HandshakeEventRx = mpsc::UnboundedReceiver<HandshakeEvent>;

/// Creates an event channel for a presentation layer.
pub fn create_event_channel() -> (HandshakeEventTx, HandshakeEventRx) {
    mpsc::unbounded_channel()
}
