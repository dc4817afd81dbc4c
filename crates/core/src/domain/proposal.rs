use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::phase::Phase;
use crate::error::{CoreError, Result};

/// Outcome of the describing phase: whether a plan was made and which files
/// it will generate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanDescription {
    pub made_plan: bool,
    #[serde(default)]
    pub files: Vec<String>,
}

impl PlanDescription {
    pub fn new(made_plan: bool, files: Vec<String>) -> Self {
        Self {
            made_plan,
            files: normalize_paths(files),
        }
    }

    /// Parse a describing-phase payload.
    ///
    /// Paths are trimmed, empty entries dropped and duplicates removed while
    /// keeping first-seen order.
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: PlanDescription = serde_json::from_str(payload)
            .map_err(|e| CoreError::MalformedDescription(e.to_string()))?;
        Ok(Self::new(raw.made_plan, raw.files))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"madePlan":false,"files":[]}"#.to_string())
    }

    /// A plan with zero files degenerates to "nothing to build".
    pub fn has_files(&self) -> bool {
        self.made_plan && !self.files.is_empty()
    }
}

fn normalize_paths(files: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .filter(|f| seen.insert(f.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Running,
    Finished,
    Failed,
    Aborted,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// One generation session, owned by the backend for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Proposal {
    pub id: String,
    pub prompt: String,
    pub parent_id: Option<String>,
    pub reply: String,
    pub description: Option<PlanDescription>,
    pub phase: Phase,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn new(prompt: impl Into<String>, parent_id: Option<String>) -> Self {
        let phase = if parent_id.is_some() {
            Phase::Revising
        } else {
            Phase::Replying
        };
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            parent_id,
            reply: String::new(),
            description: None,
            phase,
            status: ProposalStatus::default(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn append_reply(&mut self, delta: &str) {
        self.reply.push_str(delta);
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ProposalStatus::Running
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Finished;
        self.status = ProposalStatus::Finished;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.status = ProposalStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    pub fn abort(&mut self) {
        self.status = ProposalStatus::Aborted;
        self.finished_at = Some(Utc::now());
    }
}

/// A file the client already had before the session started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ContextFile {
    pub path: String,
    pub body: String,
}

/// Body of a proposal-creation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_proposal_id: Option<String>,
    #[serde(default)]
    pub context: Vec<ContextFile>,
    /// Current in-plan state of files from earlier revisions
    #[serde(default)]
    pub current_plan: BTreeMap<String, String>,
}

impl ProposalRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_proposal_id: Option<String>) -> Self {
        self.parent_proposal_id = parent_proposal_id;
        self
    }

    pub fn context_for(&self, path: &str) -> Option<&ContextFile> {
        self.context.iter().find(|c| c.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_parse_dedupes_in_order() {
        let desc =
            PlanDescription::parse(r#"{"madePlan":true,"files":["b.rs"," a.rs","b.rs","",  "a.rs"]}"#)
                .unwrap();
        assert!(desc.made_plan);
        assert_eq!(desc.files, vec!["b.rs".to_string(), "a.rs".to_string()]);
        assert!(desc.has_files());
    }

    #[test]
    fn test_description_without_files() {
        let desc = PlanDescription::parse(r#"{"madePlan":true}"#).unwrap();
        assert!(desc.files.is_empty());
        assert!(!desc.has_files());

        let desc = PlanDescription::parse(r#"{"madePlan":false,"files":["a"]}"#).unwrap();
        assert!(!desc.has_files());
    }

    #[test]
    fn test_description_malformed() {
        let err = PlanDescription::parse("{not json").unwrap_err();
        assert!(matches!(err, CoreError::MalformedDescription(_)));

        let err = PlanDescription::parse(r#"{"files":["a"]}"#).unwrap_err();
        assert!(matches!(err, CoreError::MalformedDescription(_)));
    }

    #[test]
    fn test_proposal_lifecycle() {
        let mut proposal = Proposal::new("add a readme", None);
        assert_eq!(proposal.phase, Phase::Replying);
        assert!(!proposal.is_terminal());

        proposal.append_reply("Sure, ");
        proposal.append_reply("here it is.");
        assert_eq!(proposal.reply, "Sure, here it is.");

        proposal.finish();
        assert!(proposal.is_terminal());
        assert_eq!(proposal.phase, Phase::Finished);
        assert!(proposal.finished_at.is_some());
    }

    #[test]
    fn test_continuation_starts_revising() {
        let proposal = Proposal::new("tweak it", Some("parent-1".to_string()));
        assert_eq!(proposal.phase, Phase::Revising);
        assert_eq!(proposal.parent_id.as_deref(), Some("parent-1"));
    }

    #[test]
    fn test_request_context_lookup() {
        let mut request = ProposalRequest::new("x");
        request.context.push(ContextFile {
            path: "a.txt".to_string(),
            body: "hello".to_string(),
        });
        assert_eq!(request.context_for("a.txt").unwrap().body, "hello");
        assert!(request.context_for("b.txt").is_none());
    }
}
