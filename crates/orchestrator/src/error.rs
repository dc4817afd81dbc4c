use drafter_core::CoreError;
use thiserror::Error;

use crate::model::ModelError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Malformed plan description: {0}")]
    MalformedDescription(String),

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Stream for {path} timed out after {timeout_ms}ms of inactivity")]
    StreamTimeout { path: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session already terminal: {0}")]
    SessionAlreadyTerminal(String),

    #[error("File not part of the plan: {0}")]
    UnknownFile(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Proposal still running: {0}")]
    SessionRunning(String),

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Proposal aborted: {0}")]
    Aborted(String),

    #[error("Session pointer error: {0}")]
    Pointer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Session-scoped errors cancel the whole proposal. File-scoped ones
    /// (timeouts, per-file transport failures) only fail their own slot.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::MalformedDescription(_)
                | Self::MalformedChunk(_)
                | Self::UnknownFile(_)
                | Self::Backend(_)
        )
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ProtocolViolation(msg) => Self::ProtocolViolation(msg),
            CoreError::MalformedDescription(msg) => Self::MalformedDescription(msg),
            CoreError::MalformedChunk(msg) => Self::MalformedChunk(msg),
            CoreError::SessionAlreadyTerminal(id) => Self::SessionAlreadyTerminal(id),
            CoreError::UnknownFile(path) => Self::UnknownFile(path),
            CoreError::FileAlreadyFinished(path) => {
                Self::ProtocolViolation(format!("content received after {} finished", path))
            }
            CoreError::Pointer(msg) => Self::Pointer(msg),
            CoreError::Io(e) => Self::Io(e),
        }
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(err: ModelError) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
