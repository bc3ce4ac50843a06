//! Engine event notifications, consumed via `onEvent`.

use uuid::Uuid;

use crate::step::ClassifiedError;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    WorkflowCreated {
        workflow_id: Uuid,
    },
    WorkflowStarted {
        workflow_id: Uuid,
    },
    StepStarted {
        workflow_id: Uuid,
        step: String,
    },
    StepCompleted {
        workflow_id: Uuid,
        step: String,
    },
    StepRetry {
        workflow_id: Uuid,
        step: String,
        attempt: u32,
        error: ClassifiedError,
    },
    WorkflowStalled {
        workflow_id: Uuid,
        reason: String,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        error: ClassifiedError,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
    },
    ReconciliationRan {
        workflow_id: Uuid,
    },
}

/// Broadcast sink for `onEvent` subscribers. Lagging subscribers miss
/// events rather than blocking the engine — the same trade-off the
/// teacher's `tokio::sync::broadcast` usages make for non-critical
/// notification fan-out.
#[derive(Clone)]
pub struct EventSink {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}
