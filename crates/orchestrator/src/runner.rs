use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use drafter_core::{Phase, PlanDescription, ProposalRequest, WireChunk};
use events::{Event, EventBus};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::{OrchestratorError, Result};
use crate::fanout::FanOut;
use crate::model::{DescribeRequest, ModelClient, ReplyRequest};
use crate::registry::ProposalRegistry;
use crate::session::ProposalSession;

const OUTBOUND_CAPACITY: usize = 256;

/// Outbound chunk stream of one proposal.
///
/// Dropping it (client disconnect) cancels the proposal's scope.
pub struct ProposalStream {
    proposal_id: String,
    inner: ReceiverStream<WireChunk>,
    _guard: DropGuard,
}

impl ProposalStream {
    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }
}

impl Stream for ProposalStream {
    type Item = WireChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

/// Drives proposals on the backend: reply, description, per-file build.
#[derive(Clone)]
pub struct ProposalRunner {
    model: Arc<dyn ModelClient>,
    registry: ProposalRegistry,
    bus: EventBus,
    fanout: FanOut,
    chunk_timeout: Duration,
}

impl ProposalRunner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: ProposalRegistry,
        bus: EventBus,
        config: &BackendConfig,
    ) -> Self {
        Self {
            fanout: FanOut::new(Arc::clone(&model), config),
            model,
            registry,
            bus,
            chunk_timeout: config.chunk_timeout(),
        }
    }

    /// Override the inactivity window for every stream this runner opens.
    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.fanout = self.fanout.with_chunk_timeout(chunk_timeout);
        self.chunk_timeout = chunk_timeout;
        self
    }

    pub fn registry(&self) -> &ProposalRegistry {
        &self.registry
    }

    pub fn start(&self, request: ProposalRequest) -> Result<ProposalStream> {
        let session = ProposalSession::new(request).with_bus(self.bus.clone());
        let session = self.registry.register(session)?;
        let proposal_id = session.id().to_string();
        let parent_id = session.request().parent_proposal_id.clone();

        info!(proposal_id = %proposal_id, parent_id = ?parent_id, "Proposal started");
        self.bus.emit(Event::ProposalStarted {
            proposal_id: proposal_id.clone(),
            parent_id,
        });

        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let guard = session.cancel_token().clone().drop_guard();
        let task = RunTask {
            session,
            model: Arc::clone(&self.model),
            fanout: self.fanout.clone(),
            chunk_timeout: self.chunk_timeout,
            outbound: tx,
        };
        tokio::spawn(task.run());

        Ok(ProposalStream {
            proposal_id,
            inner: ReceiverStream::new(rx),
            _guard: guard,
        })
    }

    pub fn abort(&self, proposal_id: &str) -> Result<bool> {
        self.registry
            .abort(proposal_id, Some("abort requested".to_string()))
    }
}

struct RunTask {
    session: Arc<ProposalSession>,
    model: Arc<dyn ModelClient>,
    fanout: FanOut,
    chunk_timeout: Duration,
    outbound: mpsc::Sender<WireChunk>,
}

impl RunTask {
    async fn run(self) {
        let cancel = self.session.cancel_token().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Aborted("cancellation requested".to_string())),
            result = self.drive() => result,
        };

        match result {
            Ok(()) => debug!(proposal_id = %self.session.id(), "Proposal stream drained"),
            Err(OrchestratorError::Aborted(reason)) => {
                self.session.abort(Some(reason));
            }
            Err(OrchestratorError::SessionAlreadyTerminal(_)) => {
                debug!(proposal_id = %self.session.id(), "Proposal ended while streaming");
            }
            Err(err) => {
                error!(proposal_id = %self.session.id(), error = %err, "Proposal failed");
                let _ = self.outbound.send(WireChunk::Error(err.to_string())).await;
                self.session.fail(&err);
            }
        }
    }

    async fn send(&self, chunk: WireChunk) -> Result<()> {
        self.outbound
            .send(chunk)
            .await
            .map_err(|_| OrchestratorError::Aborted("client disconnected".to_string()))
    }

    async fn drive(&self) -> Result<()> {
        let session = &self.session;
        self.send(WireChunk::ProposalId(session.id().to_string())).await?;

        self.stream_reply().await?;

        session.advance(Phase::Describing)?;
        self.send(WireChunk::DescribeStart).await?;
        let description = self.describe().await?;
        session.set_description(description.clone())?;
        self.send(WireChunk::Description(description.clone())).await?;

        let workers = if description.has_files() {
            session.start_plan(description.files.clone())?;
            self.send(WireChunk::BuildStart).await?;
            Some(self.fanout.launch(
                Arc::clone(session),
                description.files,
                self.outbound.clone(),
            ))
        } else {
            info!(proposal_id = %session.id(), "No files planned, skipping build");
            None
        };

        self.send(WireChunk::Finished).await?;
        session.stream_finished()?;

        if let Some(mut workers) = workers {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(proposal_id = %session.id(), error = %e, "File worker did not finish cleanly");
                }
            }
        }
        Ok(())
    }

    async fn stream_reply(&self) -> Result<()> {
        let session = &self.session;
        let request = session.request();
        let revising = request.parent_proposal_id.is_some();

        let reply_request = ReplyRequest {
            proposal_id: session.id().to_string(),
            prompt: request.prompt.clone(),
            parent_id: request.parent_proposal_id.clone(),
            context: request.context.clone(),
            current_plan: request.current_plan.clone(),
        };
        let mut stream = timeout(self.chunk_timeout, self.model.stream_reply(reply_request))
            .await
            .map_err(|_| OrchestratorError::Backend("reply stream did not open".to_string()))?
            .map_err(|e| OrchestratorError::Backend(e.to_string()))?;

        loop {
            let next = timeout(self.chunk_timeout, stream.next())
                .await
                .map_err(|_| OrchestratorError::Backend("reply stream timed out".to_string()))?;
            match next {
                None => break,
                Some(Err(e)) => return Err(OrchestratorError::Backend(e.to_string())),
                Some(Ok(text)) => {
                    session.append_reply(&text)?;
                    let chunk = if revising {
                        WireChunk::Revision(text)
                    } else {
                        WireChunk::Reply(text)
                    };
                    self.send(chunk).await?;
                }
            }
        }
        Ok(())
    }

    async fn describe(&self) -> Result<PlanDescription> {
        let proposal = self.session.snapshot();
        let request = DescribeRequest {
            proposal_id: proposal.id,
            prompt: proposal.prompt,
            reply: proposal.reply,
        };
        let raw = timeout(self.chunk_timeout, self.model.describe_plan(request))
            .await
            .map_err(|_| OrchestratorError::Backend("plan description timed out".to_string()))?
            .map_err(|e| OrchestratorError::Backend(e.to_string()))?;
        let description = PlanDescription::parse(&raw)?;
        debug!(
            proposal_id = %self.session.id(),
            made_plan = description.made_plan,
            num_files = description.files.len(),
            "Plan described"
        );
        Ok(description)
    }
}
