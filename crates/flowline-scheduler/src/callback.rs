//! Global consumer of agent step results.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::machine::StateMachine;
use crate::queue::{Broker, Delivery, decode_result, next_delivery};

pub struct CallbackConsumer {
    queue: String,
    broker: Arc<dyn Broker>,
    machine: Arc<StateMachine>,
}

impl CallbackConsumer {
    pub fn new(queue: impl Into<String>, broker: Arc<dyn Broker>, machine: Arc<StateMachine>) -> Self {
        Self {
            queue: queue.into(),
            broker,
            machine,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.queue, "Starting callback consumer");
        while let Some(delivery) = next_delivery(self.broker.as_ref(), &self.queue, &shutdown).await {
            self.handle(&delivery).await;
        }
        info!(queue = %self.queue, "Callback consumer stopped");
    }

    async fn handle(&self, delivery: &Delivery) {
        let result = match decode_result(&delivery.body) {
            Ok(result) => result,
            Err(e) => {
                // Left unacknowledged for redelivery.
                warn!(queue = %self.queue, tag = delivery.tag, error = %e, "Cannot decode step result");
                return;
            }
        };

        let step_id = result.step_id;
        match self.machine.on_step_result(result).await {
            Ok(job) => {
                debug!(step_id = %step_id, job_id = %job.id, status = %job.status, "Step result applied");
            }
            Err(e) if e.is_not_found() => {
                warn!(step_id = %step_id, "Result for unknown step dropped");
            }
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "Failed to apply step result");
            }
        }

        if let Err(e) = self.broker.ack(delivery).await {
            warn!(queue = %self.queue, error = %e, "Failed to ack message");
        }
    }
}
