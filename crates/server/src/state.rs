use crate::routes::sse::{EventBuffer, SharedEventBuffer, DEFAULT_EVENT_BUFFER_SIZE};
use events::EventBus;
use orchestrator::{BackendConfig, ModelClient, ProposalRegistry, ProposalRunner};
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub runner: ProposalRunner,
    pub event_bus: EventBus,
    pub event_buffer: SharedEventBuffer,
}

impl AppState {
    pub fn new(model: Arc<dyn ModelClient>, config: &BackendConfig) -> Self {
        let event_bus = EventBus::new();
        let event_buffer = Arc::new(RwLock::new(EventBuffer::new(DEFAULT_EVENT_BUFFER_SIZE)));
        let runner = ProposalRunner::new(model, ProposalRegistry::new(), event_bus.clone(), config);

        Self {
            runner,
            event_bus,
            event_buffer,
        }
    }

    pub fn registry(&self) -> &ProposalRegistry {
        self.runner.registry()
    }
}
