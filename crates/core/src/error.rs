use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Malformed plan description: {0}")]
    MalformedDescription(String),

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Session already terminal: {0}")]
    SessionAlreadyTerminal(String),

    #[error("File not part of the plan: {0}")]
    UnknownFile(String),

    #[error("File already finished: {0}")]
    FileAlreadyFinished(String),

    #[error("Session pointer error: {0}")]
    Pointer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Errors that invalidate the whole stream rather than a single file.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::MalformedDescription(_)
                | Self::MalformedChunk(_)
                | Self::UnknownFile(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::UnknownFile("src/main.rs".to_string());
        assert!(error.to_string().contains("src/main.rs"));
    }

    #[test]
    fn test_session_fatal_classification() {
        assert!(CoreError::MalformedChunk("x".into()).is_session_fatal());
        assert!(CoreError::ProtocolViolation("x".into()).is_session_fatal());
        assert!(!CoreError::SessionAlreadyTerminal("p".into()).is_session_fatal());
        assert!(!CoreError::FileAlreadyFinished("a".into()).is_session_fatal());
    }
}
