//! Consumer of the dead-letter queue of expired job messages.

use flowline_core::ResourceId;
use flowline_core::job::JobStatus;
use flowline_db::JobRepo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SchedulerResult;
use crate::machine::StateMachine;
use crate::queue::{Broker, Delivery, decode_job_id, next_delivery};

pub struct TimeoutConsumer {
    queue: String,
    broker: Arc<dyn Broker>,
    jobs: Arc<dyn JobRepo>,
    machine: Arc<StateMachine>,
}

impl TimeoutConsumer {
    pub fn new(
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        jobs: Arc<dyn JobRepo>,
        machine: Arc<StateMachine>,
    ) -> Self {
        Self {
            queue: queue.into(),
            broker,
            jobs,
            machine,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.queue, "Starting timeout consumer");
        while let Some(delivery) = next_delivery(self.broker.as_ref(), &self.queue, &shutdown).await {
            self.handle(&delivery).await;
        }
        info!(queue = %self.queue, "Timeout consumer stopped");
    }

    async fn handle(&self, delivery: &Delivery) {
        match decode_job_id(&delivery.body) {
            Ok(job_id) => {
                if let Err(e) = self.expire(job_id).await {
                    if e.is_not_found() {
                        warn!(job_id = %job_id, "Expired job no longer exists");
                    } else {
                        warn!(job_id = %job_id, error = %e, "Failed to time out job");
                    }
                }
            }
            Err(e) => warn!(queue = %self.queue, error = %e, "Dropping undecodable job message"),
        }

        if let Err(e) = self.broker.ack(delivery).await {
            warn!(queue = %self.queue, error = %e, "Failed to ack message");
        }
    }

    async fn expire(&self, job_id: ResourceId) -> SchedulerResult<()> {
        let job = self.jobs.get(job_id).await?;
        if job.is_terminal() || job.status == JobStatus::Cancelling {
            debug!(job_id = %job_id, status = %job.status, "Job already moved on, expiry ignored");
            return Ok(());
        }
        let job = self.machine.execute(job_id, JobStatus::Timeout).await?;
        debug!(job_id = %job_id, status = %job.status, "Queued wait expired");
        Ok(())
    }
}
