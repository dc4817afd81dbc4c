//! Console side of a proposal run.
//!
//! [`ConsoleObserver`] is called from inside the mailbox step, so it only
//! forwards effects over a channel. [`render_effects`] does the slow work:
//! persisting the session pointer and writing to the terminal.

use std::io::Write;
use std::path::PathBuf;

use drafter_core::{FileFailure, Phase, PlanDescription, SessionPointer};
use orchestrator::{ClientObserver, FileProgress, OrchestratorError, SessionSummary};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum Effect {
    ProposalId(String),
    Phase(Phase),
    Reply(String),
    Description(PlanDescription),
    Progress(FileProgress),
    FileFinished(String),
    FileFailed(String, FileFailure),
    Complete,
    Failed(String),
}

pub struct ConsoleObserver {
    tx: mpsc::UnboundedSender<Effect>,
}

impl ConsoleObserver {
    pub fn new(tx: mpsc::UnboundedSender<Effect>) -> Self {
        Self { tx }
    }

    fn send(&self, effect: Effect) {
        // The renderer only goes away once the run is over.
        let _ = self.tx.send(effect);
    }
}

impl ClientObserver for ConsoleObserver {
    fn on_proposal_id(&mut self, proposal_id: &str) {
        self.send(Effect::ProposalId(proposal_id.to_string()));
    }

    fn on_phase(&mut self, phase: Phase) {
        self.send(Effect::Phase(phase));
    }

    fn on_reply(&mut self, delta: &str) {
        self.send(Effect::Reply(delta.to_string()));
    }

    fn on_description(&mut self, description: &PlanDescription) {
        self.send(Effect::Description(description.clone()));
    }

    fn on_file_progress(&mut self, progress: &FileProgress) {
        self.send(Effect::Progress(progress.clone()));
    }

    fn on_file_finished(&mut self, path: &str, _content: &str) {
        self.send(Effect::FileFinished(path.to_string()));
    }

    fn on_file_failed(&mut self, path: &str, failure: &FileFailure) {
        self.send(Effect::FileFailed(path.to_string(), failure.clone()));
    }

    fn on_complete(&mut self, _summary: &SessionSummary) {
        self.send(Effect::Complete);
    }

    fn on_failed(&mut self, error: &OrchestratorError) {
        self.send(Effect::Failed(error.to_string()));
    }
}

/// Drain effects until every sender is gone. Returns the announced proposal
/// id, if any.
pub async fn render_effects(
    mut rx: mpsc::UnboundedReceiver<Effect>,
    drafter_dir: PathBuf,
) -> Option<String> {
    let mut proposal_id = None;
    let mut stdout = std::io::stdout();

    while let Some(effect) = rx.recv().await {
        match effect {
            Effect::ProposalId(id) => {
                if let Err(e) = SessionPointer::new(&id).write(&drafter_dir).await {
                    tracing::warn!("Failed to save session pointer: {}", e);
                }
                tracing::info!(proposal_id = %id, "Proposal started");
                proposal_id = Some(id);
            }
            Effect::Phase(phase) => {
                tracing::debug!(phase = %phase, "Phase changed");
                if phase == Phase::Describing {
                    println!();
                }
            }
            Effect::Reply(delta) => {
                print!("{}", delta);
                let _ = stdout.flush();
            }
            Effect::Description(description) => {
                if description.has_files() {
                    println!();
                    println!("Drafting {} file(s):", description.files.len());
                    for file in &description.files {
                        println!("  - {}", file);
                    }
                }
            }
            Effect::Progress(progress) => {
                if let Some(fraction) = progress.fraction() {
                    tracing::debug!(
                        path = %progress.path,
                        tokens = progress.streamed_tokens,
                        "{:.0}%",
                        fraction * 100.0
                    );
                }
            }
            Effect::FileFinished(path) => println!("  ✓ {}", path),
            Effect::FileFailed(path, failure) => println!("  ✗ {} ({})", path, failure),
            Effect::Complete => tracing::debug!("Proposal settled"),
            Effect::Failed(message) => tracing::error!("Proposal failed: {}", message),
        }
    }

    proposal_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_render_effects_persists_pointer() {
        let workspace = TempDir::new().unwrap();
        let drafter_dir = workspace.path().join(".drafter");
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observer = ConsoleObserver::new(tx);

        observer.on_proposal_id("p-42");
        observer.on_phase(Phase::Describing);
        drop(observer);

        let proposal_id = render_effects(rx, drafter_dir.clone()).await;
        assert_eq!(proposal_id.as_deref(), Some("p-42"));

        let pointer = SessionPointer::read(&drafter_dir).await.unwrap();
        assert_eq!(pointer, Some(SessionPointer::new("p-42")));
    }
}
