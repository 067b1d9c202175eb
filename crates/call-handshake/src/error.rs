use thiserror::Error;

use crate::blob::DecodeError;
use crate::clipboard::ClipboardError;
use crate::engine::EngineError;
use crate::media::AcquisitionError;
use crate::session::{ConnectionState, Role};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed connection code: {0}")]
    MalformedBlob(#[from] DecodeError),
    #[error("{operation} is not valid for a {role} session in state {state}")]
    InvalidRoleTransition {
        operation: &'static str,
        role: Role,
        state: ConnectionState,
    },
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("local description is not ready to export (state {state})")]
    PrematureExport { state: ConnectionState },
    #[error("remote description already applied")]
    AlreadyApplied,
    #[error("session is closed")]
    SessionClosed,
    #[error("local media unavailable: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Clipboard(#[from] ClipboardError),
}

impl HandshakeError {
    /// Errors caused by the pasted text rather than local state.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            HandshakeError::MalformedBlob(_) | HandshakeError::HandshakeRejected(_)
        )
    }
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;
