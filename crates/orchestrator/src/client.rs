//! Client-side consumer of a proposal stream.
//!
//! [`ProposalClient`] runs as the handler of a [`Mailbox`], so chunks that
//! arrive while a previous one is still being handled are serialized. The
//! handler never suspends; effects are reported synchronously through a
//! [`ClientObserver`].

use std::collections::BTreeMap;
use std::sync::Arc;

use drafter_core::{
    FileFailure, FileStatus, Frame, Phase, Plan, PlanDescription, ProposalRequest, TokenCounter,
    WireChunk,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{OrchestratorError, Result};
use crate::mailbox::{Handler, Mailbox};
use crate::progress::{FileProgress, ProgressTracker};
use crate::state_machine::PhaseStateMachine;

/// What a finished proposal produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub proposal_id: String,
    pub reply: String,
    pub description: Option<PlanDescription>,
    /// Content of every file that finished without error
    pub files: BTreeMap<String, String>,
    pub errors: BTreeMap<String, FileFailure>,
}

impl SessionSummary {
    /// Some files failed while the rest are usable.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Effects of the client state machine. All methods default to no-ops.
pub trait ClientObserver: Send {
    fn on_proposal_id(&mut self, _proposal_id: &str) {}
    fn on_phase(&mut self, _phase: Phase) {}
    fn on_reply(&mut self, _delta: &str) {}
    fn on_description(&mut self, _description: &PlanDescription) {}
    fn on_file_progress(&mut self, _progress: &FileProgress) {}
    fn on_file_finished(&mut self, _path: &str, _content: &str) {}
    fn on_file_failed(&mut self, _path: &str, _failure: &FileFailure) {}
    fn on_complete(&mut self, _summary: &SessionSummary) {}
    fn on_failed(&mut self, _error: &OrchestratorError) {}
}

impl ClientObserver for () {}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Frame(Frame),
    TransportError(String),
    Closed,
}

pub struct ProposalClient<O> {
    observer: O,
    proposal_id: Option<String>,
    phase: Phase,
    reply: String,
    description: Option<PlanDescription>,
    plan: Option<Plan>,
    stream_finished: bool,
    progress: ProgressTracker,
    bases: BTreeMap<String, String>,
    outcome: Option<Result<SessionSummary>>,
}

impl<O: ClientObserver> ProposalClient<O> {
    pub fn new(observer: O) -> Self {
        Self {
            observer,
            proposal_id: None,
            phase: Phase::default(),
            reply: String::new(),
            description: None,
            plan: None,
            stream_finished: false,
            progress: ProgressTracker::default(),
            bases: BTreeMap::new(),
            outcome: None,
        }
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.progress = ProgressTracker::new(counter);
        self
    }

    /// Seed progress baselines from the request: in-plan state from earlier
    /// revisions wins over original context.
    pub fn with_request(mut self, request: &ProposalRequest) -> Self {
        for file in &request.context {
            self.bases.insert(file.path.clone(), file.body.clone());
        }
        for (path, content) in &request.current_plan {
            self.bases.insert(path.clone(), content.clone());
        }
        self
    }

    pub fn proposal_id(&self) -> Option<&str> {
        self.proposal_id.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn into_outcome(self) -> Result<SessionSummary> {
        self.outcome.unwrap_or_else(|| {
            Err(OrchestratorError::protocol(
                "stream closed before the proposal finished",
            ))
        })
    }

    fn transition(&mut self, to: Phase) -> Result<()> {
        PhaseStateMachine::validate_transition(self.phase, to)?;
        if self.phase != to {
            self.phase = to;
            self.observer.on_phase(to);
        }
        Ok(())
    }

    /// A phase marker must move the stream forward, never repeat a phase.
    fn check_marker(&self, chunk: &WireChunk) -> Result<()> {
        let Some(to) = chunk.phase().filter(|_| chunk.is_marker()) else {
            return Ok(());
        };
        if to == self.phase || !PhaseStateMachine::can_transition(self.phase, to) {
            return Err(OrchestratorError::protocol(format!(
                "unexpected {} marker in the {} phase",
                to, self.phase
            )));
        }
        Ok(())
    }

    fn plan_mut(&mut self) -> Result<&mut Plan> {
        self.plan
            .as_mut()
            .ok_or_else(|| OrchestratorError::protocol("build chunk before the building marker"))
    }

    fn append_reply(&mut self, phase: Phase, text: &str) -> Result<()> {
        self.transition(phase)?;
        self.reply.push_str(text);
        self.observer.on_reply(text);
        Ok(())
    }

    fn apply(&mut self, frame: &Frame) -> Result<()> {
        let chunk = WireChunk::decode(frame)?;

        let Some(proposal_id) = self.proposal_id.clone() else {
            return match chunk {
                WireChunk::ProposalId(id) => {
                    debug!(proposal_id = %id, "Proposal announced");
                    self.observer.on_proposal_id(&id);
                    self.proposal_id = Some(id);
                    Ok(())
                }
                other => Err(OrchestratorError::protocol(format!(
                    "expected proposal id, got {} chunk",
                    other.tag().as_str()
                ))),
            };
        };

        self.check_marker(&chunk)?;

        match chunk {
            WireChunk::ProposalId(_) => Err(OrchestratorError::protocol("duplicate proposal id")),
            WireChunk::Error(message) => Err(OrchestratorError::Backend(message)),
            WireChunk::Reply(text) => self.append_reply(Phase::Replying, &text),
            WireChunk::Revision(text) => self.append_reply(Phase::Revising, &text),
            WireChunk::DescribeStart => self.transition(Phase::Describing),
            WireChunk::Description(description) => {
                if self.phase != Phase::Describing || self.description.is_some() {
                    return Err(OrchestratorError::protocol(
                        "plan description outside the describing phase",
                    ));
                }
                if description.has_files() {
                    self.progress.estimate_from_reply(&self.reply, &description.files);
                    for path in &description.files {
                        if let Some(base) = self.bases.get(path) {
                            self.progress.set_base(path, base);
                        }
                    }
                }
                self.observer.on_description(&description);
                self.description = Some(description);
                Ok(())
            }
            WireChunk::BuildStart => {
                let files = match &self.description {
                    Some(description) if description.has_files() => description.files.clone(),
                    _ => {
                        return Err(OrchestratorError::protocol(
                            "building marker without planned files",
                        ))
                    }
                };
                self.transition(Phase::Building)?;
                self.plan = Some(Plan::new(proposal_id, files));
                Ok(())
            }
            WireChunk::Content(chunk) => {
                self.plan_mut()?.append(&chunk.path, &chunk.content)?;
                let progress = self.progress.record(&chunk.path, &chunk.content);
                self.observer.on_file_progress(&progress);
                Ok(())
            }
            WireChunk::FileStatus(status) => {
                match status.status {
                    FileStatus::Finished => {
                        let plan = self.plan_mut()?;
                        if plan.mark_finished(&status.path)? {
                            let content = plan.content(&status.path).unwrap_or_default().to_string();
                            self.progress.mark_done(&status.path);
                            self.observer.on_file_finished(&status.path, &content);
                        }
                    }
                    FileStatus::Error => {
                        let failure = status
                            .error
                            .unwrap_or_else(|| FileFailure::transport("unspecified failure"));
                        if self.plan_mut()?.mark_failed(&status.path, failure.clone())? {
                            self.observer.on_file_failed(&status.path, &failure);
                        }
                    }
                }
                Ok(())
            }
            WireChunk::Finished => {
                match &self.description {
                    None => {
                        return Err(OrchestratorError::protocol(
                            "finished before the plan was described",
                        ))
                    }
                    Some(description) if description.has_files() && self.plan.is_none() => {
                        return Err(OrchestratorError::protocol(
                            "finished before the planned build started",
                        ))
                    }
                    Some(_) => {}
                }
                self.transition(Phase::Finished)?;
                self.stream_finished = true;
                Ok(())
            }
        }
    }

    fn files_done(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.did_finish(),
            None => self
                .description
                .as_ref()
                .map(|d| !d.has_files())
                .unwrap_or(false),
        }
    }

    fn check_complete(&mut self) {
        if self.outcome.is_some() || !self.stream_finished || !self.files_done() {
            return;
        }

        let mut summary = SessionSummary {
            proposal_id: self.proposal_id.clone().unwrap_or_default(),
            reply: self.reply.clone(),
            description: self.description.clone(),
            ..Default::default()
        };
        if let Some(plan) = self.plan.as_mut() {
            let _ = plan.finish();
            summary.errors = plan.errors.clone();
            summary.files = plan
                .contents
                .iter()
                .filter(|(path, _)| !plan.errors.contains_key(*path))
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect();
        }

        info!(
            proposal_id = %summary.proposal_id,
            files = summary.files.len(),
            errors = summary.errors.len(),
            "Proposal complete"
        );
        self.observer.on_complete(&summary);
        self.outcome = Some(Ok(summary));
    }

    fn fail(&mut self, err: OrchestratorError) {
        if self.outcome.is_some() {
            return;
        }
        error!(proposal_id = ?self.proposal_id, error = %err, "Proposal stream failed");
        if let Some(plan) = self.plan.as_mut() {
            let _ = plan.set_err(err.to_string());
        }
        self.observer.on_failed(&err);
        self.outcome = Some(Err(err));
    }
}

impl<O: ClientObserver> Handler<ClientEvent> for ProposalClient<O> {
    fn handle(&mut self, event: ClientEvent) {
        if self.is_settled() {
            debug!("Ignoring event after the proposal settled");
            return;
        }

        match event {
            ClientEvent::Frame(frame) => match self.apply(&frame) {
                Ok(()) => self.check_complete(),
                Err(err) => self.fail(err),
            },
            ClientEvent::TransportError(message) => {
                self.fail(OrchestratorError::Transport(message))
            }
            ClientEvent::Closed => self.fail(OrchestratorError::protocol(
                "stream closed before the proposal finished",
            )),
        }
    }
}

/// Feed a frame stream through a mailbox-driven [`ProposalClient`] until the
/// proposal settles, the stream ends, or `cancel` fires.
pub async fn consume<S, O>(
    frames: S,
    client: ProposalClient<O>,
    cancel: CancellationToken,
) -> Result<SessionSummary>
where
    S: Stream<Item = std::result::Result<Frame, String>>,
    O: ClientObserver,
{
    let mailbox = Mailbox::new(client);
    futures::pin_mut!(frames);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Aborted("cancelled by caller".to_string()));
            }
            next = frames.next() => next,
        };

        let event = match next {
            Some(Ok(frame)) => ClientEvent::Frame(frame),
            Some(Err(message)) => ClientEvent::TransportError(message),
            None => ClientEvent::Closed,
        };
        mailbox.submit(event);

        if mailbox.with_handler(|client| client.is_settled()) {
            break;
        }
    }

    mailbox.into_inner().into_outcome()
}
