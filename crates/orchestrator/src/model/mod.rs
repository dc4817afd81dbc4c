//! Collaborator seam to the generation model.
//!
//! The orchestrator only needs three capabilities: a streamed conversational
//! reply, a one-shot plan description, and one streamed content generation
//! per file. Prompting strategy and the upstream wire format live behind
//! [`ModelClient`].

mod openai;

use std::collections::BTreeMap;

use async_trait::async_trait;
use drafter_core::ContextFile;
use futures::stream::BoxStream;
use thiserror::Error;

pub use openai::OpenAiClient;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limited by model API")]
    RateLimited,

    #[error("Model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

pub type TextStream = BoxStream<'static, Result<String, ModelError>>;
pub type DeltaStream = BoxStream<'static, Result<FileDelta, ModelError>>;

/// One item of a per-file generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDelta {
    /// Incremental file content
    Content(String),
    /// Payload unrelated to file content (role headers, reasoning, tool noise)
    Other(String),
    /// Structured "content complete" signal
    Complete,
    /// The model stopped without completing, e.g. on a length limit
    Stopped(String),
}

#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub proposal_id: String,
    pub prompt: String,
    pub parent_id: Option<String>,
    pub context: Vec<ContextFile>,
    pub current_plan: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DescribeRequest {
    pub proposal_id: String,
    pub prompt: String,
    pub reply: String,
}

/// Generation request for a single file.
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub proposal_id: String,
    pub path: String,
    pub prompt: String,
    /// Full conversational reply, passed as assistant context
    pub reply: String,
    /// File content from before the session started
    pub original: Option<String>,
    /// In-plan state from an earlier revision
    pub current: Option<String>,
}

impl FileRequest {
    /// Content the edit applies to. Earlier revisions win over the pristine
    /// original so edits compound across revisions.
    pub fn base(&self) -> Option<&str> {
        self.current.as_deref().or(self.original.as_deref())
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_reply(&self, request: ReplyRequest) -> Result<TextStream, ModelError>;

    /// Returns the raw description payload, decoded by the caller.
    async fn describe_plan(&self, request: DescribeRequest) -> Result<String, ModelError>;

    async fn stream_file(&self, request: FileRequest) -> Result<DeltaStream, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(original: Option<&str>, current: Option<&str>) -> FileRequest {
        FileRequest {
            proposal_id: "p-1".into(),
            path: "a.txt".into(),
            prompt: "edit".into(),
            reply: "sure".into(),
            original: original.map(String::from),
            current: current.map(String::from),
        }
    }

    #[test]
    fn test_current_state_preferred_over_original() {
        assert_eq!(request(Some("old"), Some("newer")).base(), Some("newer"));
        assert_eq!(request(Some("old"), None).base(), Some("old"));
        assert_eq!(request(None, None).base(), None);
    }
}
