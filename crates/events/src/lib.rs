//! Event system for drafter
//!
//! In-process bus carrying proposal lifecycle events from the backend
//! runner to whoever observes it (logs, HTTP surface, tests).

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
