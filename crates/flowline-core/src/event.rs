//! Domain events published by the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ResourceId;
use crate::job::Job;
use crate::step::Step;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    JobCreated { job: Box<Job> },
    JobStatusChanged { job: Box<Job> },
    /// The full step set was created for a job run.
    StepsInitialized { job_id: ResourceId, steps: Vec<Step> },
    /// Carries the full refreshed step list, not just the changed step.
    StepStatusChanged { job_id: ResourceId, steps: Vec<Step> },
    JobsDeleted { flow_id: ResourceId, count: u64 },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::JobCreated { .. } => "job_created",
            DomainEvent::JobStatusChanged { .. } => "job_status_changed",
            DomainEvent::StepsInitialized { .. } => "steps_initialized",
            DomainEvent::StepStatusChanged { .. } => "step_status_changed",
            DomainEvent::JobsDeleted { .. } => "jobs_deleted",
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process fan-out of domain events.
///
/// Publishing never blocks. Subscribers that fall behind lose the oldest
/// events and observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: DomainEvent) -> usize {
        tracing::trace!(event = event.name(), "publishing domain event");
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
