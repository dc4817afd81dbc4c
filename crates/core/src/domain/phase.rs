use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Phase of a single proposal. Phases only move forward, except that
/// `Replying` and `Revising` are the same accumulation phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Replying,
    /// Reply phase of a proposal that continues a parent proposal
    Revising,
    Describing,
    Building,
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replying => "replying",
            Self::Revising => "revising",
            Self::Describing => "describing",
            Self::Building => "building",
            Self::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replying" => Some(Self::Replying),
            "revising" => Some(Self::Revising),
            "describing" => Some(Self::Describing),
            "building" => Some(Self::Building),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Replying | Self::Revising)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_strings() {
        for phase in [
            Phase::Replying,
            Phase::Revising,
            Phase::Describing,
            Phase::Building,
            Phase::Finished,
        ] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("planning"), None);
    }

    #[test]
    fn test_reply_phases() {
        assert!(Phase::Replying.is_reply());
        assert!(Phase::Revising.is_reply());
        assert!(!Phase::Describing.is_reply());
    }
}
