//! Event types for the drafter event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A proposal was registered and its stream opened
    #[serde(rename = "proposal.started")]
    ProposalStarted {
        proposal_id: String,
        parent_id: Option<String>,
    },

    /// The proposal advanced to a new phase
    #[serde(rename = "proposal.phase_changed")]
    PhaseChanged {
        proposal_id: String,
        from_phase: String,
        to_phase: String,
    },

    /// One file's generation completed
    #[serde(rename = "plan.file_finished")]
    FileFinished { proposal_id: String, path: String },

    /// One file's generation failed; the rest of the plan continues
    #[serde(rename = "plan.file_failed")]
    FileFailed {
        proposal_id: String,
        path: String,
        error: String,
    },

    /// Every file of the plan reached a terminal state
    #[serde(rename = "plan.finished")]
    PlanFinished {
        proposal_id: String,
        num_files: usize,
        num_errors: usize,
    },

    /// Both the top-level stream and the build have finished
    #[serde(rename = "proposal.finished")]
    ProposalFinished { proposal_id: String },

    /// The proposal's cancellation scope was triggered
    #[serde(rename = "proposal.aborted")]
    ProposalAborted {
        proposal_id: String,
        reason: Option<String>,
    },

    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        proposal_id: Option<String>,
    },
}

impl Event {
    /// Get the proposal ID associated with this event, if any
    pub fn proposal_id(&self) -> Option<&str> {
        match self {
            Event::ProposalStarted { proposal_id, .. }
            | Event::PhaseChanged { proposal_id, .. }
            | Event::FileFinished { proposal_id, .. }
            | Event::FileFailed { proposal_id, .. }
            | Event::PlanFinished { proposal_id, .. }
            | Event::ProposalFinished { proposal_id }
            | Event::ProposalAborted { proposal_id, .. } => Some(proposal_id),
            Event::Error { proposal_id, .. } => proposal_id.as_deref(),
        }
    }

    /// Event name as used in logs and on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Event::ProposalStarted { .. } => "proposal.started",
            Event::PhaseChanged { .. } => "proposal.phase_changed",
            Event::FileFinished { .. } => "plan.file_finished",
            Event::FileFailed { .. } => "plan.file_failed",
            Event::PlanFinished { .. } => "plan.finished",
            Event::ProposalFinished { .. } => "proposal.finished",
            Event::ProposalAborted { .. } => "proposal.aborted",
            Event::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let event = Event::ProposalStarted {
            proposal_id: "p-1".to_string(),
            parent_id: None,
        };
        let envelope = EventEnvelope::new(event);

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::PhaseChanged {
            proposal_id: "p-1".to_string(),
            from_phase: "replying".to_string(),
            to_phase: "describing".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("proposal.phase_changed"));
        assert!(json.contains("from_phase"));
        assert!(json.contains("to_phase"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"plan.file_failed","proposal_id":"p-1","path":"b.txt","error":"stream timeout"}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::FileFailed { path, error, .. } => {
                assert_eq!(path, "b.txt");
                assert_eq!(error, "stream timeout");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_proposal_id() {
        let event = Event::FileFinished {
            proposal_id: "p-7".to_string(),
            path: "a.txt".to_string(),
        };
        assert_eq!(event.proposal_id(), Some("p-7"));
        assert_eq!(event.name(), "plan.file_finished");

        let error_event = Event::Error {
            message: "test".to_string(),
            proposal_id: None,
        };
        assert_eq!(error_event.proposal_id(), None);
    }
}
