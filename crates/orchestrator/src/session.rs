use std::sync::{Mutex, MutexGuard, OnceLock};

use drafter_core::{
    FileFailure, Phase, Plan, PlanDescription, Proposal, ProposalRequest, ProposalStatus,
};
use events::{Event, EventBus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{PlanAggregator, Update};
use crate::error::{OrchestratorError, Result};
use crate::state_machine::PhaseStateMachine;

/// Backend-side state of one proposal.
///
/// Owns the [`Proposal`] record, the cancellation scope shared by every file
/// worker, and, once building starts, the [`PlanAggregator`].
pub struct ProposalSession {
    id: String,
    request: ProposalRequest,
    proposal: Mutex<Proposal>,
    plan: OnceLock<PlanAggregator>,
    cancel: CancellationToken,
    bus: Option<EventBus>,
}

impl ProposalSession {
    pub fn new(request: ProposalRequest) -> Self {
        let proposal = Proposal::new(request.prompt.clone(), request.parent_proposal_id.clone());
        Self {
            id: proposal.id.clone(),
            request,
            proposal: Mutex::new(proposal),
            plan: OnceLock::new(),
            cancel: CancellationToken::new(),
            bus: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.id = id.clone();
        let proposal = self.proposal.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        proposal.id = id;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &ProposalRequest {
        &self.request
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn lock(&self) -> MutexGuard<'_, Proposal> {
        self.proposal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }

    pub fn snapshot(&self) -> Proposal {
        self.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn status(&self) -> ProposalStatus {
        self.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().is_terminal()
    }

    pub fn plan(&self) -> Option<&PlanAggregator> {
        self.plan.get()
    }

    pub fn plan_snapshot(&self) -> Option<Plan> {
        self.plan.get().map(PlanAggregator::snapshot)
    }

    fn aggregator(&self) -> Result<&PlanAggregator> {
        self.plan
            .get()
            .ok_or_else(|| OrchestratorError::protocol("build chunk before the plan started"))
    }

    fn ensure_running(&self, proposal: &Proposal) -> Result<()> {
        if proposal.is_terminal() {
            return Err(OrchestratorError::SessionAlreadyTerminal(self.id.clone()));
        }
        Ok(())
    }

    pub fn advance(&self, to: Phase) -> Result<()> {
        let from = {
            let mut proposal = self.lock();
            self.ensure_running(&proposal)?;
            let from = proposal.phase;
            PhaseStateMachine::validate_transition(from, to)?;
            proposal.phase = to;
            from
        };

        if from != to {
            debug!(proposal_id = %self.id, from = %from, to = %to, "Phase changed");
            self.emit(Event::PhaseChanged {
                proposal_id: self.id.clone(),
                from_phase: from.as_str().to_string(),
                to_phase: to.as_str().to_string(),
            });
        }
        Ok(())
    }

    pub fn append_reply(&self, delta: &str) -> Result<()> {
        let mut proposal = self.lock();
        self.ensure_running(&proposal)?;
        if !proposal.phase.is_reply() {
            return Err(OrchestratorError::protocol(format!(
                "reply content during {}",
                proposal.phase
            )));
        }
        proposal.append_reply(delta);
        Ok(())
    }

    pub fn set_description(&self, description: PlanDescription) -> Result<()> {
        let mut proposal = self.lock();
        self.ensure_running(&proposal)?;
        if proposal.phase != Phase::Describing || proposal.description.is_some() {
            return Err(OrchestratorError::protocol(
                "plan description outside the describing phase",
            ));
        }
        proposal.description = Some(description);
        Ok(())
    }

    pub fn start_plan(&self, files: Vec<String>) -> Result<PlanAggregator> {
        self.advance(Phase::Building)?;
        let num_files = files.len();
        let aggregator = PlanAggregator::new(Plan::new(self.id.clone(), files), self.cancel.clone());
        self.plan
            .set(aggregator.clone())
            .map_err(|_| OrchestratorError::protocol("plan already started"))?;
        info!(proposal_id = %self.id, num_files, "Building plan");
        Ok(aggregator)
    }

    pub fn record_content(&self, path: &str, delta: &str) -> Result<()> {
        self.aggregator()?.update(|plan| plan.append(path, delta))?;
        Ok(())
    }

    /// Returns true when this call moved the path to finished.
    pub fn file_finished(&self, path: &str) -> Result<bool> {
        let update = self.aggregator()?.update(|plan| plan.mark_finished(path))?;
        if update.value {
            debug!(proposal_id = %self.id, path = %path, "File finished");
            self.emit(Event::FileFinished {
                proposal_id: self.id.clone(),
                path: path.to_string(),
            });
        }
        self.after_update(&update);
        Ok(update.value)
    }

    /// Returns true when this call recorded the failure.
    pub fn file_failed(&self, path: &str, failure: FileFailure) -> Result<bool> {
        let message = failure.message.clone();
        let update = self
            .aggregator()?
            .update(|plan| plan.mark_failed(path, failure))?;
        if update.value {
            warn!(proposal_id = %self.id, path = %path, error = %message, "File failed");
            self.emit(Event::FileFailed {
                proposal_id: self.id.clone(),
                path: path.to_string(),
                error: message,
            });
        }
        self.after_update(&update);
        Ok(update.value)
    }

    fn after_update<R>(&self, update: &Update<R>) {
        if update.plan_finished {
            if let Some(plan) = self.plan_snapshot() {
                info!(
                    proposal_id = %self.id,
                    num_files = plan.num_files(),
                    num_errors = plan.errors.len(),
                    "Plan finished"
                );
                self.emit(Event::PlanFinished {
                    proposal_id: self.id.clone(),
                    num_files: plan.num_files(),
                    num_errors: plan.errors.len(),
                });
            }
        }
        if update.session_complete {
            self.complete();
        }
    }

    /// Record the top-level FINISHED marker. Without a plan this completes
    /// the session directly.
    pub fn stream_finished(&self) -> Result<bool> {
        self.advance(Phase::Finished)?;
        let done = match self.plan.get() {
            Some(aggregator) => aggregator.mark_stream_finished()?,
            None => true,
        };
        Ok(done && self.complete())
    }

    pub fn complete(&self) -> bool {
        {
            let mut proposal = self.lock();
            if proposal.is_terminal() {
                return false;
            }
            proposal.finish();
        }
        info!(proposal_id = %self.id, "Proposal finished");
        self.emit(Event::ProposalFinished {
            proposal_id: self.id.clone(),
        });
        true
    }

    /// Session-fatal failure: cancels every worker.
    pub fn fail(&self, err: &OrchestratorError) -> bool {
        {
            let mut proposal = self.lock();
            if proposal.is_terminal() {
                return false;
            }
            proposal.fail();
        }
        if let Some(aggregator) = self.plan.get() {
            aggregator.fail(err.to_string());
        }
        self.cancel.cancel();

        error!(proposal_id = %self.id, error = %err, "Proposal failed");
        self.emit(Event::Error {
            message: err.to_string(),
            proposal_id: Some(self.id.clone()),
        });
        true
    }

    /// Cancel the session. Idempotent: a terminal session is left untouched.
    pub fn abort(&self, reason: Option<String>) -> bool {
        let aborted = {
            let mut proposal = self.lock();
            if proposal.is_terminal() {
                false
            } else {
                proposal.abort();
                true
            }
        };
        if let Some(aggregator) = self.plan.get() {
            aggregator.abort();
        }
        self.cancel.cancel();

        if aborted {
            info!(proposal_id = %self.id, reason = ?reason, "Proposal aborted");
            self.emit(Event::ProposalAborted {
                proposal_id: self.id.clone(),
                reason,
            });
        }
        aborted
    }
}
