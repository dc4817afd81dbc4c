//! Wire codec for the proposal stream.
//!
//! Every chunk is carried as a tagged frame: the tag names the phase the
//! chunk belongs to (or `proposal` / `error`), the data is either raw text,
//! a reserved sentinel, or a compact JSON record.

use serde::Deserialize;

use crate::domain::{FileStatusChunk, Phase, PlanChunk, PlanDescription};
use crate::error::{CoreError, Result};

pub const DESCRIBING_MARKER: &str = "@@describing@@";
pub const BUILDING_MARKER: &str = "@@building@@";
pub const FINISHED_MARKER: &str = "@@finished@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTag {
    Proposal,
    Replying,
    Revising,
    Describing,
    Building,
    Finished,
    Error,
}

impl ChunkTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposal => "proposal",
            Self::Replying => "replying",
            Self::Revising => "revising",
            Self::Describing => "describing",
            Self::Building => "building",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposal" => Some(Self::Proposal),
            "replying" => Some(Self::Replying),
            "revising" => Some(Self::Revising),
            "describing" => Some(Self::Describing),
            "building" => Some(Self::Building),
            "finished" => Some(Self::Finished),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Raw frame as it travels on the wire (one SSE event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Decoded chunk of the proposal stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireChunk {
    /// First chunk of every stream
    ProposalId(String),
    Reply(String),
    Revision(String),
    DescribeStart,
    Description(PlanDescription),
    BuildStart,
    Content(PlanChunk),
    FileStatus(FileStatusChunk),
    Finished,
    /// Session-fatal failure reported by the backend
    Error(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BuildPayload {
    Content(PlanChunk),
    Status(FileStatusChunk),
}

impl WireChunk {
    pub fn tag(&self) -> ChunkTag {
        match self {
            Self::ProposalId(_) => ChunkTag::Proposal,
            Self::Reply(_) => ChunkTag::Replying,
            Self::Revision(_) => ChunkTag::Revising,
            Self::DescribeStart | Self::Description(_) => ChunkTag::Describing,
            Self::BuildStart | Self::Content(_) | Self::FileStatus(_) => ChunkTag::Building,
            Self::Finished => ChunkTag::Finished,
            Self::Error(_) => ChunkTag::Error,
        }
    }

    /// Phase this chunk is tagged with, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self.tag() {
            ChunkTag::Replying => Some(Phase::Replying),
            ChunkTag::Revising => Some(Phase::Revising),
            ChunkTag::Describing => Some(Phase::Describing),
            ChunkTag::Building => Some(Phase::Building),
            ChunkTag::Finished => Some(Phase::Finished),
            ChunkTag::Proposal | ChunkTag::Error => None,
        }
    }

    /// Phase markers carry no payload and announce a phase change.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::DescribeStart | Self::BuildStart | Self::Finished)
    }

    pub fn encode(&self) -> Result<Frame> {
        let data = match self {
            Self::ProposalId(id) => id.clone(),
            Self::Reply(text) | Self::Revision(text) => text.clone(),
            Self::DescribeStart => DESCRIBING_MARKER.to_string(),
            Self::Description(desc) => desc.to_json(),
            Self::BuildStart => BUILDING_MARKER.to_string(),
            Self::Content(chunk) => serde_json::to_string(chunk)
                .map_err(|e| CoreError::MalformedChunk(e.to_string()))?,
            Self::FileStatus(status) => serde_json::to_string(status)
                .map_err(|e| CoreError::MalformedChunk(e.to_string()))?,
            Self::Finished => FINISHED_MARKER.to_string(),
            Self::Error(message) => message.clone(),
        };
        Ok(Frame::new(self.tag().as_str(), data))
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let tag = ChunkTag::parse(&frame.event)
            .ok_or_else(|| CoreError::MalformedChunk(format!("unknown tag '{}'", frame.event)))?;
        let data = frame.data.as_str();

        let chunk = match tag {
            ChunkTag::Proposal => {
                if data.trim().is_empty() {
                    return Err(CoreError::MalformedChunk("empty proposal id".to_string()));
                }
                Self::ProposalId(data.to_string())
            }
            ChunkTag::Replying => Self::Reply(data.to_string()),
            ChunkTag::Revising => Self::Revision(data.to_string()),
            ChunkTag::Describing if data == DESCRIBING_MARKER => Self::DescribeStart,
            ChunkTag::Describing => Self::Description(PlanDescription::parse(data)?),
            ChunkTag::Building if data == BUILDING_MARKER => Self::BuildStart,
            ChunkTag::Building => match serde_json::from_str::<BuildPayload>(data) {
                Ok(BuildPayload::Content(chunk)) => Self::Content(chunk),
                Ok(BuildPayload::Status(status)) => Self::FileStatus(status),
                Err(e) => return Err(CoreError::MalformedChunk(e.to_string())),
            },
            ChunkTag::Finished if data == FINISHED_MARKER => Self::Finished,
            ChunkTag::Finished => {
                return Err(CoreError::MalformedChunk(format!(
                    "unexpected finished payload '{}'",
                    data
                )))
            }
            ChunkTag::Error => Self::Error(data.to_string()),
        };
        Ok(chunk)
    }
}
