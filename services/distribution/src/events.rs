//! Pull event log.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// One successful top-level pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullEvent {
    /// Fully qualified reference, as pulled.
    pub reference: String,
    /// Repository name without tag or digest.
    pub repository: String,
    pub at: DateTime<Utc>,
}

impl PullEvent {
    pub fn new(reference: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            repository: repository.into(),
            at: Utc::now(),
        }
    }
}

pub trait EventLogger: Send + Sync {
    fn log_pull(&self, event: PullEvent);
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventLogger;

impl EventLogger for TracingEventLogger {
    fn log_pull(&self, event: PullEvent) {
        info!(
            reference = %event.reference,
            repository = %event.repository,
            action = "pull",
            "image pulled"
        );
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<PullEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PullEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventLogger for MemoryEventLog {
    fn log_pull(&self, event: PullEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
