//! Per-flow dispatch consumer.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::machine::{DispatchOutcome, StateMachine};
use crate::queue::{Broker, Delivery, decode_job_id, next_delivery};

const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Consumes one flow queue, one message at a time.
///
/// Each message carries a job id. The job is handed to an agent and the
/// message acknowledged, whether or not the job could still run. Messages
/// whose job could not be loaded are requeued after a short delay.
pub struct DispatchWorker {
    queue: String,
    broker: Arc<dyn Broker>,
    machine: Arc<StateMachine>,
}

impl DispatchWorker {
    pub fn new(queue: impl Into<String>, broker: Arc<dyn Broker>, machine: Arc<StateMachine>) -> Self {
        Self {
            queue: queue.into(),
            broker,
            machine,
        }
    }

    /// Run until `shutdown` fires or the queue is deleted. A message being
    /// handled when either happens is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.queue, "Starting dispatch worker");

        while let Some(delivery) = next_delivery(self.broker.as_ref(), &self.queue, &shutdown).await {
            self.handle(&delivery, &shutdown).await;
        }

        info!(queue = %self.queue, "Dispatch worker stopped");
    }

    async fn handle(&self, delivery: &Delivery, shutdown: &CancellationToken) {
        let job_id = match decode_job_id(&delivery.body) {
            Ok(id) => id,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Dropping undecodable job message");
                self.ack(delivery).await;
                return;
            }
        };
        debug!(queue = %self.queue, job_id = %job_id, "Job dequeued");

        match self.machine.dispatch(job_id, shutdown).await {
            Ok(DispatchOutcome::Done(job)) => {
                debug!(job_id = %job_id, status = %job.status, "Job dispatched");
            }
            Ok(DispatchOutcome::Interrupted) => {
                // Still queued: hand it back for the next consumer.
                if let Err(e) = self.broker.nack(delivery, true).await {
                    warn!(queue = %self.queue, job_id = %job_id, error = %e, "Failed to requeue job");
                }
                return;
            }
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job_id, "Dequeued job no longer exists");
            }
            Err(e) => {
                // The job is still queued; keep its message so the TTL applies.
                warn!(job_id = %job_id, error = %e, "Failed to dispatch job, requeueing");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(REQUEUE_DELAY) => {}
                }
                if let Err(e) = self.broker.nack(delivery, true).await {
                    warn!(queue = %self.queue, job_id = %job_id, error = %e, "Failed to requeue job");
                }
                return;
            }
        }
        self.ack(delivery).await;
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            warn!(queue = %self.queue, error = %e, "Failed to ack message");
        }
    }
}
