//! Lifecycle events and event handling.
//!
//! The engine and the stale-run sweeper emit events so operators and tests
//! can observe dispatch outcomes without polling storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::schedule::TransportType;
use crate::core::types::{JobRunId, ScheduleId};

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A schedule was claimed by the tick loop and its run dispatched.
    ScheduleDispatched {
        schedule_id: ScheduleId,
        job_run_id: JobRunId,
        transport: TransportType,
        timestamp: DateTime<Utc>,
    },

    /// A dispatch attempt failed before the job handler saw it.
    DispatchFailed {
        schedule_id: ScheduleId,
        job_run_id: JobRunId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A status callback settled a job run.
    JobRunFinished {
        schedule_id: ScheduleId,
        job_run_id: JobRunId,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// A run has been waiting past the stale threshold.
    StaleRunDetected {
        schedule_id: ScheduleId,
        job_run_id: JobRunId,
        waiting_since: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

/// Handler for lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event. Handlers must not block for long; they run inline
    /// on the emitting task.
    async fn handle(&self, event: &Event);
}

/// Event bus for emitting events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
