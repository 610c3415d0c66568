//! Handshake states, progress table and per-attempt session bookkeeping.

use tokio_util::sync::CancellationToken;

use super::error::HandshakeError;
use crate::frame::MountId;

/// Total attempts allowed: the initial try plus three soft retries.
pub const MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    MountWait,
    LoadWait,
    ReadinessCheck,
    LinkRequest,
    PairingFetch,
    Success,
    Failed,
}

impl HandshakeState {
    /// Human-readable step shown while the state is active.
    pub fn progress_label(self) -> Option<&'static str> {
        match self {
            HandshakeState::MountWait => Some("Initialisation…"),
            HandshakeState::LoadWait => Some("Chargement de l'interface sécurisée…"),
            HandshakeState::ReadinessCheck => Some("Vérification de la connexion…"),
            HandshakeState::LinkRequest => Some("Demande d'autorisation…"),
            HandshakeState::PairingFetch => Some("Récupération de l'identifiant…"),
            HandshakeState::Idle | HandshakeState::Success | HandshakeState::Failed => None,
        }
    }

    /// Progress bar position for the state; `None` when there is nothing to show.
    pub fn progress_percent(self) -> Option<u8> {
        match self {
            HandshakeState::Idle => Some(0),
            HandshakeState::MountWait => Some(10),
            HandshakeState::LoadWait => Some(30),
            HandshakeState::ReadinessCheck => Some(50),
            HandshakeState::LinkRequest => Some(70),
            HandshakeState::PairingFetch => Some(90),
            HandshakeState::Success => Some(100),
            HandshakeState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Success | HandshakeState::Failed)
    }

    /// True while a step is in flight.
    pub fn is_running(self) -> bool {
        !self.is_terminal() && self != HandshakeState::Idle
    }
}

/// Read-only view of the handshake for presentation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSnapshot {
    pub state: HandshakeState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress_label: Option<&'static str>,
    pub progress_percent: Option<u8>,
    pub last_error: Option<HandshakeError>,
    pub frame_loaded: bool,
    /// Whether a soft retry is offered.
    pub can_retry: bool,
    /// Whether a hard (force) retry is offered.
    pub can_force_retry: bool,
}

/// Identifies one run of the step sequence.
///
/// A run whose generation no longer matches the session has been closed and
/// must not touch shared state.
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub generation: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct HandshakeSession {
    pub state: HandshakeState,
    pub attempt: u32,
    pub progress_label: Option<&'static str>,
    pub last_error: Option<HandshakeError>,
    pub frame_loaded: bool,
    /// Frame instance `frame_loaded` refers to.
    pub frame_mount: Option<MountId>,
    pub retry_exhausted: bool,
    /// Identifier obtained by the successful run.
    pub pairing_id: Option<String>,
    generation: u64,
    cancel: CancellationToken,
}

impl HandshakeSession {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            attempt: 1,
            progress_label: None,
            last_error: None,
            frame_loaded: false,
            frame_mount: None,
            retry_exhausted: false,
            pairing_id: None,
            generation: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_current(&self, ticket: &RunTicket) -> bool {
        self.generation == ticket.generation
    }

    /// Abandons any in-flight run.
    pub fn invalidate(&mut self) {
        self.cancel.cancel();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Starts a new run at `MountWait`, abandoning any previous one.
    pub fn begin_run(&mut self) -> RunTicket {
        self.invalidate();
        self.cancel = CancellationToken::new();
        self.last_error = None;
        self.enter(HandshakeState::MountWait);
        RunTicket {
            generation: self.generation,
            cancel: self.cancel.clone(),
        }
    }

    pub fn enter(&mut self, state: HandshakeState) {
        self.state = state;
        self.progress_label = state.progress_label();
    }

    pub fn fail(&mut self, error: HandshakeError) {
        self.enter(HandshakeState::Failed);
        self.last_error = Some(error);
    }

    pub fn succeed(&mut self, pairing_id: String) {
        self.enter(HandshakeState::Success);
        self.last_error = None;
        self.pairing_id = Some(pairing_id);
    }

    /// Back to `Idle` with all step state cleared.
    pub fn clear(&mut self) {
        self.invalidate();
        self.enter(HandshakeState::Idle);
        self.attempt = 1;
        self.last_error = None;
        self.frame_loaded = false;
        self.frame_mount = None;
        self.retry_exhausted = false;
        self.pairing_id = None;
    }

    pub fn snapshot(&self) -> HandshakeSnapshot {
        let failed = self.state == HandshakeState::Failed;
        HandshakeSnapshot {
            state: self.state,
            attempt: self.attempt,
            max_attempts: MAX_ATTEMPTS,
            progress_label: self.progress_label,
            progress_percent: self.state.progress_percent(),
            last_error: self.last_error.clone(),
            frame_loaded: self.frame_loaded,
            can_retry: failed && !self.retry_exhausted,
            can_force_retry: failed || self.state.is_running(),
        }
    }
}
