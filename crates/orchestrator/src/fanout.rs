//! One generation stream per planned file, all under the proposal's
//! cancellation scope.

use std::sync::Arc;
use std::time::Duration;

use drafter_core::{FileFailure, FileStatusChunk, PlanChunk, WireChunk};
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{FileDelta, FileRequest, ModelClient};
use crate::session::ProposalSession;

#[derive(Clone)]
pub struct FanOut {
    model: Arc<dyn ModelClient>,
    chunk_timeout: Duration,
    limit: Option<Arc<Semaphore>>,
}

impl FanOut {
    pub fn new(model: Arc<dyn ModelClient>, config: &BackendConfig) -> Self {
        Self {
            model,
            chunk_timeout: config.chunk_timeout(),
            limit: config
                .max_concurrent_files
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    /// Spawn one worker per file. Each worker listens on a child of the
    /// session scope, so cancelling the session stops all of them while a
    /// single file's failure never reaches its siblings.
    pub fn launch(
        &self,
        session: Arc<ProposalSession>,
        files: Vec<String>,
        outbound: mpsc::Sender<WireChunk>,
    ) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        for path in files {
            let worker = FileWorker {
                cancel: session.cancel_token().child_token(),
                session: Arc::clone(&session),
                model: Arc::clone(&self.model),
                chunk_timeout: self.chunk_timeout,
                limit: self.limit.clone(),
                outbound: outbound.clone(),
                path,
            };
            workers.spawn(worker.run());
        }
        info!(
            proposal_id = %session.id(),
            workers = workers.len(),
            "File workers launched"
        );
        workers
    }
}

struct FileWorker {
    session: Arc<ProposalSession>,
    model: Arc<dyn ModelClient>,
    path: String,
    chunk_timeout: Duration,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<WireChunk>,
}

impl FileWorker {
    async fn run(self) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(proposal_id = %self.session.id(), path = %self.path, "File worker cancelled");
                return;
            }
            result = self.generate() => result,
        };

        match result {
            Ok(()) => {}
            Err(OrchestratorError::SessionAlreadyTerminal(_)) => {
                debug!(proposal_id = %self.session.id(), path = %self.path, "Session ended before file worker");
            }
            Err(err) if err.is_session_fatal() => {
                error!(proposal_id = %self.session.id(), path = %self.path, error = %err, "Fatal error in file worker");
                self.send(WireChunk::Error(err.to_string())).await;
                self.session.fail(&err);
            }
            Err(err) => self.report_failure(err).await,
        }
    }

    fn request(&self) -> FileRequest {
        let request = self.session.request();
        FileRequest {
            proposal_id: self.session.id().to_string(),
            path: self.path.clone(),
            prompt: request.prompt.clone(),
            reply: self.session.snapshot().reply,
            original: request.context_for(&self.path).map(|c| c.body.clone()),
            current: request.current_plan.get(&self.path).cloned(),
        }
    }

    fn timed_out(&self) -> OrchestratorError {
        OrchestratorError::StreamTimeout {
            path: self.path.clone(),
            timeout_ms: self.chunk_timeout.as_millis() as u64,
        }
    }

    async fn generate(&self) -> Result<()> {
        let _permit = match &self.limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|e| OrchestratorError::Transport(e.to_string()))?,
            ),
            None => None,
        };

        let mut stream = timeout(self.chunk_timeout, self.model.stream_file(self.request()))
            .await
            .map_err(|_| self.timed_out())??;

        loop {
            let next = timeout(self.chunk_timeout, stream.next())
                .await
                .map_err(|_| self.timed_out())?;

            match next {
                None => {
                    return Err(OrchestratorError::Transport(
                        "stream ended before the file was complete".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(FileDelta::Content(content))) => {
                    self.session.record_content(&self.path, &content)?;
                    self.send(WireChunk::Content(PlanChunk::new(self.path.clone(), content)))
                        .await;
                }
                Some(Ok(FileDelta::Other(kind))) => {
                    debug!(path = %self.path, kind = %kind, "Skipping non-content chunk");
                }
                Some(Ok(FileDelta::Complete)) => {
                    if self.session.file_finished(&self.path)? {
                        self.send(WireChunk::FileStatus(FileStatusChunk::finished(
                            self.path.clone(),
                        )))
                        .await;
                    }
                    return Ok(());
                }
                Some(Ok(FileDelta::Stopped(reason))) => {
                    return Err(OrchestratorError::Transport(format!(
                        "generation stopped: {}",
                        reason
                    )))
                }
            }
        }
    }

    async fn report_failure(&self, err: OrchestratorError) {
        let failure = match err {
            OrchestratorError::StreamTimeout { .. } => FileFailure::timeout(err.to_string()),
            _ => FileFailure::transport(err.to_string()),
        };

        match self.session.file_failed(&self.path, failure.clone()) {
            Ok(true) => {
                self.send(WireChunk::FileStatus(FileStatusChunk::error(
                    self.path.clone(),
                    failure,
                )))
                .await
            }
            Ok(false) => {}
            Err(e) => {
                warn!(path = %self.path, error = %e, "Could not record file failure");
            }
        }
    }

    async fn send(&self, chunk: WireChunk) {
        if self.outbound.send(chunk).await.is_err() {
            debug!(path = %self.path, "Outbound stream closed");
        }
    }
}
