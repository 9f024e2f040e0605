//! Flow queue registry.
//!
//! Every flow owns a queue and a supervised dispatch worker bound to it.

use flowline_core::ResourceId;
use flowline_core::flow::Flow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SchedulerResult;
use crate::machine::StateMachine;
use crate::queue::Broker;
use crate::worker::DispatchWorker;

struct Binding {
    queue: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct FlowQueueRegistry {
    broker: Arc<dyn Broker>,
    machine: Arc<StateMachine>,
    dead_letter: String,
    root: CancellationToken,
    bindings: Mutex<HashMap<ResourceId, Binding>>,
}

impl FlowQueueRegistry {
    pub fn new(
        broker: Arc<dyn Broker>,
        machine: Arc<StateMachine>,
        dead_letter: impl Into<String>,
        root: CancellationToken,
    ) -> Self {
        Self {
            broker,
            machine,
            dead_letter: dead_letter.into(),
            root,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Declare the flow's queue and start its worker. Starting a flow that
    /// is already running does nothing.
    pub async fn start(&self, flow: &Flow) -> SchedulerResult<()> {
        let queue = flow.queue_name();
        self.broker.declare(&queue, Some(&self.dead_letter)).await?;

        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&flow.id) {
            return Ok(());
        }

        let token = self.root.child_token();
        let worker = DispatchWorker::new(queue.clone(), self.broker.clone(), self.machine.clone());
        let handle = tokio::spawn(worker.run(token.clone()));
        info!(flow_id = %flow.id, flow = %flow.name, queue = %queue, "Flow queue started");
        bindings.insert(
            flow.id,
            Binding {
                queue,
                token,
                handle,
            },
        );
        Ok(())
    }

    /// Retire the flow's worker and delete its queue.
    ///
    /// A message the worker is already handling completes first. Returns the
    /// number of pending messages discarded with the queue.
    pub async fn stop(&self, flow_id: ResourceId) -> SchedulerResult<u64> {
        let Some(binding) = self.bindings.lock().remove(&flow_id) else {
            return Ok(0);
        };

        binding.token.cancel();
        if let Err(e) = binding.handle.await {
            warn!(flow_id = %flow_id, error = %e, "Dispatch worker ended abnormally");
        }
        let purged = self.broker.delete(&binding.queue).await?;
        info!(flow_id = %flow_id, queue = %binding.queue, purged, "Flow queue stopped");
        Ok(purged)
    }

    pub fn is_running(&self, flow_id: ResourceId) -> bool {
        self.bindings.lock().contains_key(&flow_id)
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every worker, keeping the queues and their messages.
    pub async fn shutdown(&self) {
        let bindings: Vec<_> = self.bindings.lock().drain().collect();
        for (flow_id, binding) in bindings {
            binding.token.cancel();
            if let Err(e) = binding.handle.await {
                warn!(flow_id = %flow_id, error = %e, "Dispatch worker ended abnormally");
            }
        }
    }
}
