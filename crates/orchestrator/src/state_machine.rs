use drafter_core::Phase;

use crate::error::{OrchestratorError, Result};

/// Forward-only phase transitions of a proposal's top-level stream.
///
/// Staying in a phase is legal while that phase still accumulates payload
/// (reply text, the description after its marker). `Replying` and `Revising`
/// are interchangeable.
pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(from: Phase, to: Phase) -> Result<()> {
        if Self::allowed_transitions(from).contains(&to) {
            Ok(())
        } else {
            Err(OrchestratorError::ProtocolViolation(format!(
                "illegal phase transition from {} to {}",
                from, to
            )))
        }
    }

    fn allowed_transitions(from: Phase) -> Vec<Phase> {
        match from {
            Phase::Replying | Phase::Revising => {
                vec![Phase::Replying, Phase::Revising, Phase::Describing]
            }
            Phase::Describing => vec![Phase::Describing, Phase::Building, Phase::Finished],
            Phase::Building => vec![Phase::Building, Phase::Finished],
            Phase::Finished => vec![],
        }
    }

    pub fn can_transition(from: Phase, to: Phase) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
