use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::session::ProposalSession;

/// Process-wide map of in-flight proposals.
///
/// Entries are inserted when a proposal starts and removed by [`drain`]
/// once the session is terminal and the client has collected it.
///
/// [`drain`]: ProposalRegistry::drain
#[derive(Clone, Default)]
pub struct ProposalRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<ProposalSession>>>>,
}

impl ProposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic get-or-create: concurrent callers for the same id all receive
    /// the same session and `create` runs at most once.
    pub fn get_or_create(
        &self,
        id: &str,
        create: impl FnOnce() -> ProposalSession,
    ) -> Arc<ProposalSession> {
        {
            let sessions = self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(session) = sessions.get(id) {
                return Arc::clone(session);
            }
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(session) = sessions.get(id) {
            return Arc::clone(session);
        }

        let session = Arc::new(create());
        sessions.insert(id.to_string(), Arc::clone(&session));
        debug!(proposal_id = %id, "Proposal registered");
        session
    }

    pub fn register(&self, session: ProposalSession) -> Result<Arc<ProposalSession>> {
        let id = session.id().to_string();
        let mut created = false;
        let registered = self.get_or_create(&id, || {
            created = true;
            session
        });
        if !created {
            return Err(OrchestratorError::protocol(format!(
                "proposal {} already registered",
                id
            )));
        }
        Ok(registered)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProposalSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    /// Returns whether this call aborted the session; aborting a terminal
    /// session is a no-op.
    pub fn abort(&self, id: &str, reason: Option<String>) -> Result<bool> {
        let session = self
            .get(id)
            .ok_or_else(|| OrchestratorError::ProposalNotFound(id.to_string()))?;
        Ok(session.abort(reason))
    }

    /// Remove a terminal session. Running sessions are refused.
    pub fn drain(&self, id: &str) -> Result<Arc<ProposalSession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sessions.get(id) {
            None => Err(OrchestratorError::ProposalNotFound(id.to_string())),
            Some(session) if !session.is_terminal() => {
                Err(OrchestratorError::SessionRunning(id.to_string()))
            }
            Some(_) => {
                let session = sessions
                    .remove(id)
                    .ok_or_else(|| OrchestratorError::ProposalNotFound(id.to_string()))?;
                debug!(proposal_id = %id, "Proposal drained");
                Ok(session)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
