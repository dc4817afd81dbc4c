pub mod phase;
pub mod plan;
pub mod proposal;

pub use phase::Phase;
pub use plan::{FileFailure, FileFailureKind, FileStatus, FileStatusChunk, Plan, PlanChunk, PlanStatus};
pub use proposal::{ContextFile, PlanDescription, Proposal, ProposalRequest, ProposalStatus};
