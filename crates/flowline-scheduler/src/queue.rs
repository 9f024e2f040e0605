//! Message broker abstraction.
//!
//! Flow queues carry raw job ids, the callback queue carries JSON encoded
//! step results, and the dead-letter queue receives job ids whose queued-wait
//! time-to-live expired.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use flowline_core::ResourceId;
use flowline_core::step::ExecResult;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{SchedulerError, SchedulerResult};

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

/// A message handed to a consumer. Stays unacknowledged until `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Higher is delivered first.
    pub priority: u8,
    /// Time the message may wait before it is dead-lettered.
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a queue if missing. Expired messages move to `dead_letter`.
    async fn declare(&self, queue: &str, dead_letter: Option<&str>) -> SchedulerResult<()>;

    /// Remove a queue, returning the number of messages purged with it.
    async fn delete(&self, queue: &str) -> SchedulerResult<u64>;

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> SchedulerResult<()>;

    /// Wait for the next message. Returns `None` once the queue is gone.
    async fn consume(&self, queue: &str) -> SchedulerResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()>;

    /// Requeue every unacknowledged delivery of a queue.
    async fn recover(&self, queue: &str) -> SchedulerResult<u64>;
}

const CONSUME_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Decode the job id carried by flow and dead-letter messages.
pub fn decode_job_id(body: &[u8]) -> SchedulerResult<ResourceId> {
    ResourceId::from_bytes(body).map_err(|e| SchedulerError::Decode(format!("job id: {}", e)))
}

/// Decode a step result from the callback queue.
pub fn decode_result(body: &[u8]) -> SchedulerResult<ExecResult> {
    serde_json::from_slice(body).map_err(|e| SchedulerError::Decode(format!("step result: {}", e)))
}

/// Next delivery for a consumer loop, or `None` when it should stop.
///
/// Stops when `shutdown` fires or the queue is deleted; broker errors are
/// logged and retried.
pub async fn next_delivery(
    broker: &dyn Broker,
    queue: &str,
    shutdown: &CancellationToken,
) -> Option<Delivery> {
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            result = broker.consume(queue) => result,
        };

        match result {
            Ok(delivery) => return delivery,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to consume from queue");
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(CONSUME_RETRY_DELAY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::step::StepStatus;

    #[test]
    fn test_decode_job_id() {
        let id = ResourceId::new();
        assert_eq!(decode_job_id(&id.to_bytes()).unwrap(), id);

        let err = decode_job_id(b"garbage").unwrap_err();
        assert!(matches!(err, SchedulerError::Decode(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_decode_result() {
        let step_id = ResourceId::new();
        let body = serde_json::to_vec(&ExecResult::new(step_id, StepStatus::Success)).unwrap();
        let result = decode_result(&body).unwrap();
        assert_eq!(result.step_id, step_id);
        assert_eq!(result.log_size, -1);

        assert!(matches!(decode_result(b"{}"), Err(SchedulerError::Decode(_))));
    }
}
