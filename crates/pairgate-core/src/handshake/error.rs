use std::fmt;
use std::time::Duration;

use crate::transport::{TransportError, TransportStep};

/// Why a handshake attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("authentication frame is not mounted")]
    FrameNotFound,

    #[error("authentication frame did not mount after {polls} polls")]
    FrameMountTimeout { polls: u32 },

    #[error("authentication frame did not finish loading within {}s", .0.as_secs())]
    LoadTimeout(Duration),

    #[error("authentication frame failed to load: {0}")]
    LoadError(String),

    #[error("{step} failed: {source}")]
    TransportRejection {
        step: TransportStep,
        source: TransportError,
    },

    #[error("{step} timed out after {}s", .after.as_secs())]
    TransportTimeout { step: TransportStep, after: Duration },

    #[error("maximum attempts reached ({max})")]
    RetryExhausted { max: u32 },
}

/// Copyable discriminant of [`HandshakeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FrameNotFound,
    FrameMountTimeout,
    LoadTimeout,
    LoadError,
    TransportRejection,
    TransportTimeout,
    RetryExhausted,
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::FrameNotFound => ErrorKind::FrameNotFound,
            HandshakeError::FrameMountTimeout { .. } => ErrorKind::FrameMountTimeout,
            HandshakeError::LoadTimeout(_) => ErrorKind::LoadTimeout,
            HandshakeError::LoadError(_) => ErrorKind::LoadError,
            HandshakeError::TransportRejection { .. } => ErrorKind::TransportRejection,
            HandshakeError::TransportTimeout { .. } => ErrorKind::TransportTimeout,
            HandshakeError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
        }
    }

    pub(crate) fn rejected(step: TransportStep, source: TransportError) -> Self {
        HandshakeError::TransportRejection { step, source }
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::FrameNotFound => "frame_not_found",
            ErrorKind::FrameMountTimeout => "frame_mount_timeout",
            ErrorKind::LoadTimeout => "load_timeout",
            ErrorKind::LoadError => "load_error",
            ErrorKind::TransportRejection => "transport_rejection",
            ErrorKind::TransportTimeout => "transport_timeout",
            ErrorKind::RetryExhausted => "retry_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
