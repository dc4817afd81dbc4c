use std::sync::{Arc, Mutex, MutexGuard};

use drafter_core::Plan;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Result of one aggregator mutation.
#[derive(Debug)]
pub struct Update<R> {
    pub value: R,
    /// Every file just reached a terminal state; true at most once per plan
    pub plan_finished: bool,
    /// Both termination sources have now been observed; true at most once
    pub session_complete: bool,
}

struct AggregatorState {
    plan: Plan,
    files_signaled: bool,
    stream_finished: bool,
    closed: bool,
}

impl AggregatorState {
    fn signal_files(&mut self) -> Result<bool> {
        if self.files_signaled || !self.plan.did_finish() {
            return Ok(false);
        }
        self.files_signaled = true;
        self.plan.finish()?;
        Ok(true)
    }

    fn close_if_done(&mut self) -> bool {
        if self.closed || !self.files_signaled || !self.stream_finished {
            return false;
        }
        self.closed = true;
        true
    }
}

/// Owns a proposal's [`Plan`] and the latch that turns the two independent
/// termination sources (all files terminal, top-level stream finished) into
/// one completion signal.
///
/// Every mutation goes through [`PlanAggregator::update`], which holds the
/// lock across read-modify-write.
#[derive(Clone)]
pub struct PlanAggregator {
    state: Arc<Mutex<AggregatorState>>,
    cancel: CancellationToken,
}

impl PlanAggregator {
    pub fn new(plan: Plan, cancel: CancellationToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(AggregatorState {
                plan,
                files_signaled: false,
                stream_finished: false,
                closed: false,
            })),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn update<R>(
        &self,
        mutate: impl FnOnce(&mut Plan) -> drafter_core::Result<R>,
    ) -> Result<Update<R>> {
        let mut state = self.lock();
        let value = mutate(&mut state.plan)?;
        let plan_finished = state.signal_files()?;
        let session_complete = plan_finished && state.close_if_done();
        Ok(Update {
            value,
            plan_finished,
            session_complete,
        })
    }

    /// Record the top-level FINISHED marker. Returns true when this call
    /// completes the session.
    pub fn mark_stream_finished(&self) -> Result<bool> {
        let mut state = self.lock();
        state.stream_finished = true;
        if !state.plan.is_terminal() {
            state.signal_files()?;
        }
        Ok(state.close_if_done())
    }

    pub fn did_finish(&self) -> bool {
        self.lock().files_signaled
    }

    pub fn is_complete(&self) -> bool {
        self.lock().closed
    }

    pub fn snapshot(&self) -> Plan {
        self.lock().plan.clone()
    }

    /// Mark the plan aborted and cancel every worker. Idempotent.
    pub fn abort(&self) -> bool {
        let aborted = self.lock().plan.abort();
        self.cancel.cancel();
        aborted
    }

    /// Mark the plan failed with a session-fatal error and cancel every worker.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        let failed = self.lock().plan.set_err(error).is_ok();
        self.cancel.cancel();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use drafter_core::{FileFailure, PlanStatus};

    fn aggregator(files: &[&str]) -> PlanAggregator {
        let plan = Plan::new("p-1", files.iter().map(|f| f.to_string()).collect());
        PlanAggregator::new(plan, CancellationToken::new())
    }

    #[test]
    fn test_files_then_stream_completes_once() {
        let agg = aggregator(&["a.txt", "b.txt"]);

        let u = agg.update(|p| p.mark_finished("a.txt")).unwrap();
        assert!(u.value && !u.plan_finished && !u.session_complete);

        let u = agg.update(|p| p.mark_finished("b.txt")).unwrap();
        assert!(u.plan_finished);
        assert!(!u.session_complete);

        assert!(agg.mark_stream_finished().unwrap());
        assert!(!agg.mark_stream_finished().unwrap());
        assert!(agg.is_complete());
    }

    #[test]
    fn test_stream_then_files_completes_once() {
        let agg = aggregator(&["a.txt"]);
        assert!(!agg.mark_stream_finished().unwrap());

        let u = agg.update(|p| p.mark_finished("a.txt")).unwrap();
        assert!(u.plan_finished);
        assert!(u.session_complete);

        // duplicate finish after completion hits a terminal plan
        let err = agg.update(|p| p.mark_finished("a.txt")).unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionAlreadyTerminal(_)));
    }

    #[test]
    fn test_duplicate_finish_does_not_double_count() {
        let agg = aggregator(&["a.txt", "b.txt"]);
        agg.update(|p| p.mark_finished("a.txt")).unwrap();
        let u = agg.update(|p| p.mark_finished("a.txt")).unwrap();
        assert!(!u.value);
        assert!(!u.plan_finished);
        assert!(!agg.did_finish());
    }

    #[test]
    fn test_failure_counts_toward_completion() {
        let agg = aggregator(&["a.txt", "b.txt"]);
        agg.update(|p| p.append("a.txt", "x")).unwrap();
        agg.update(|p| p.mark_finished("a.txt")).unwrap();
        let u = agg
            .update(|p| p.mark_failed("b.txt", FileFailure::timeout("stream timeout")))
            .unwrap();
        assert!(u.plan_finished);

        let plan = agg.snapshot();
        assert_eq!(plan.status, PlanStatus::Finished);
        assert_eq!(plan.content("a.txt"), Some("x"));
        assert!(plan.errors.contains_key("b.txt"));
    }

    #[test]
    fn test_concurrent_appends_do_not_lose_updates() {
        let agg = aggregator(&["a.txt", "b.txt"]);
        let handles: Vec<_> = ["a.txt", "b.txt"]
            .into_iter()
            .map(|path| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        agg.update(|p| p.append(path, "x")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let plan = agg.snapshot();
        assert_eq!(plan.content("a.txt").map(str::len), Some(100));
        assert_eq!(plan.content("b.txt").map(str::len), Some(100));
    }

    #[test]
    fn test_abort_cancels_scope_and_rejects_mutation() {
        let agg = aggregator(&["a.txt"]);
        assert!(agg.abort());
        assert!(agg.cancel_token().is_cancelled());
        assert!(!agg.abort());

        let err = agg.update(|p| p.append("a.txt", "x")).unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionAlreadyTerminal(_)));
        assert!(!agg.mark_stream_finished().unwrap());
    }

    #[test]
    fn test_empty_plan_completes_on_stream_finish() {
        let agg = aggregator(&[]);
        assert!(agg.mark_stream_finished().unwrap());
    }
}
