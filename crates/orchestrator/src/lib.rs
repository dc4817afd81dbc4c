//! Streaming proposal orchestration: phase machine, mailbox, per-file
//! fan-out and plan aggregation, on both sides of the proposal stream.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod mailbox;
pub mod model;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod session;
pub mod state_machine;

pub use aggregator::{PlanAggregator, Update};
pub use client::{consume, ClientEvent, ClientObserver, ProposalClient, SessionSummary};
pub use config::BackendConfig;
pub use error::{OrchestratorError, Result};
pub use fanout::FanOut;
pub use mailbox::{Delivery, Handler, Mailbox};
pub use model::{
    DeltaStream, DescribeRequest, FileDelta, FileRequest, ModelClient, ModelError, OpenAiClient,
    ReplyRequest, TextStream,
};
pub use progress::{FileProgress, ProgressTracker};
pub use registry::ProposalRegistry;
pub use runner::{ProposalRunner, ProposalStream};
pub use session::ProposalSession;
pub use state_machine::PhaseStateMachine;
