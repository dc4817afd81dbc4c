use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{CoreError, Result};

/// Incremental delta of a single file's generated content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PlanChunk {
    pub path: String,
    pub content: String,
}

impl PlanChunk {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Finished,
    Error,
}

/// Terminal status of one file, sent once per path on the build stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct FileStatusChunk {
    pub path: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FileFailure>,
}

impl FileStatusChunk {
    pub fn finished(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: FileStatus::Finished,
            error: None,
        }
    }

    pub fn error(path: impl Into<String>, failure: FileFailure) -> Self {
        Self {
            path: path.into(),
            status: FileStatus::Error,
            error: Some(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileFailureKind {
    /// No chunk arrived within the inactivity window
    StreamTimeout,
    /// The per-file stream failed or ended early
    Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct FileFailure {
    pub kind: FileFailureKind,
    pub message: String,
}

impl FileFailure {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FileFailureKind::StreamTimeout,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FileFailureKind::Transport,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Building,
    Finished,
    Failed,
    Aborted,
}

/// Per-proposal build record.
///
/// A path enters `finished` at most once, whether it completed or failed.
/// After that its content is frozen. Once the plan itself is terminal every
/// per-file mutation is rejected.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Plan {
    pub proposal_id: String,
    /// Expected files, in description order
    pub files: Vec<String>,
    pub contents: BTreeMap<String, String>,
    pub errors: BTreeMap<String, FileFailure>,
    pub finished: BTreeSet<String>,
    pub status: PlanStatus,
    pub error: Option<String>,
}

impl Plan {
    pub fn new(proposal_id: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            files,
            contents: BTreeMap::new(),
            errors: BTreeMap::new(),
            finished: BTreeSet::new(),
            status: PlanStatus::default(),
            error: None,
        }
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status != PlanStatus::Building
    }

    pub fn content(&self, path: &str) -> Option<&str> {
        self.contents.get(path).map(String::as_str)
    }

    pub fn is_file_finished(&self, path: &str) -> bool {
        self.finished.contains(path)
    }

    /// True once every expected path has reached a terminal state.
    pub fn did_finish(&self) -> bool {
        self.files.iter().all(|f| self.finished.contains(f))
    }

    pub fn append(&mut self, path: &str, delta: &str) -> Result<()> {
        self.ensure_writable(path)?;
        if self.finished.contains(path) {
            return Err(CoreError::FileAlreadyFinished(path.to_string()));
        }
        self.contents
            .entry(path.to_string())
            .or_default()
            .push_str(delta);
        Ok(())
    }

    /// Returns `false` when the path was already terminal.
    pub fn mark_finished(&mut self, path: &str) -> Result<bool> {
        self.ensure_writable(path)?;
        Ok(self.finished.insert(path.to_string()))
    }

    /// Records a per-file failure. The failed path counts as terminal.
    /// Returns `false` when the path was already terminal.
    pub fn mark_failed(&mut self, path: &str, failure: FileFailure) -> Result<bool> {
        self.ensure_writable(path)?;
        if !self.finished.insert(path.to_string()) {
            return Ok(false);
        }
        self.errors.insert(path.to_string(), failure);
        Ok(true)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = PlanStatus::Finished;
        Ok(())
    }

    pub fn set_err(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_active()?;
        self.status = PlanStatus::Failed;
        self.error = Some(error.into());
        Ok(())
    }

    /// Abort is idempotent: aborting a terminal plan leaves it untouched.
    pub fn abort(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PlanStatus::Aborted;
        true
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(CoreError::SessionAlreadyTerminal(self.proposal_id.clone()));
        }
        Ok(())
    }

    fn ensure_writable(&self, path: &str) -> Result<()> {
        self.ensure_active()?;
        if !self.files.iter().any(|f| f == path) {
            return Err(CoreError::UnknownFile(path.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(files: &[&str]) -> Plan {
        Plan::new("p-1", files.iter().map(|f| f.to_string()).collect())
    }

    #[test]
    fn test_append_concatenates_in_order() {
        let mut plan = plan(&["a.txt"]);
        for delta in ["a", "b", "c"] {
            plan.append("a.txt", delta).unwrap();
        }
        assert_eq!(plan.content("a.txt"), Some("abc"));
    }

    #[test]
    fn test_did_finish_requires_every_path() {
        let mut plan = plan(&["a.txt", "b.txt"]);
        assert!(!plan.did_finish());

        assert!(plan.mark_finished("a.txt").unwrap());
        assert!(!plan.did_finish());

        assert!(!plan.mark_finished("a.txt").unwrap());
        assert_eq!(plan.finished.len(), 1);
        assert!(!plan.did_finish());

        assert!(plan.mark_finished("b.txt").unwrap());
        assert!(plan.did_finish());
    }

    #[test]
    fn test_failed_path_counts_as_terminal() {
        let mut plan = plan(&["a.txt", "b.txt"]);
        plan.mark_finished("a.txt").unwrap();
        assert!(plan
            .mark_failed("b.txt", FileFailure::timeout("stream timeout"))
            .unwrap());
        assert!(plan.did_finish());
        assert_eq!(plan.errors["b.txt"].kind, FileFailureKind::StreamTimeout);

        // a path keeps its first terminal state
        assert!(!plan
            .mark_failed("a.txt", FileFailure::transport("late"))
            .unwrap());
        assert!(!plan.errors.contains_key("a.txt"));
    }

    #[test]
    fn test_finished_path_content_is_frozen() {
        let mut plan = plan(&["a.txt"]);
        plan.append("a.txt", "x").unwrap();
        plan.mark_finished("a.txt").unwrap();
        let err = plan.append("a.txt", "y").unwrap_err();
        assert!(matches!(err, CoreError::FileAlreadyFinished(_)));
        assert_eq!(plan.content("a.txt"), Some("x"));
    }

    #[test]
    fn test_unknown_file_rejected() {
        let mut plan = plan(&["a.txt"]);
        let err = plan.append("other.txt", "x").unwrap_err();
        assert!(matches!(err, CoreError::UnknownFile(_)));
    }

    #[test]
    fn test_terminal_plan_rejects_mutation() {
        let mut plan = plan(&["a.txt"]);
        plan.mark_finished("a.txt").unwrap();
        plan.finish().unwrap();

        assert!(matches!(
            plan.append("a.txt", "x").unwrap_err(),
            CoreError::SessionAlreadyTerminal(_)
        ));
        assert!(matches!(
            plan.mark_finished("a.txt").unwrap_err(),
            CoreError::SessionAlreadyTerminal(_)
        ));
        assert!(plan.finish().is_err());
        assert!(!plan.abort());
        assert_eq!(plan.status, PlanStatus::Finished);
    }

    #[test]
    fn test_set_err_marks_failed() {
        let mut plan = plan(&["a.txt"]);
        plan.set_err("desynchronized stream").unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.error.as_deref(), Some("desynchronized stream"));
    }

    #[test]
    fn test_empty_plan_is_vacuously_finished() {
        let plan = plan(&[]);
        assert!(plan.did_finish());
    }
}
