//! In-process engine harness shared by the scenario tests.

#![allow(dead_code)]

use flowline_config::{KdlPipelineParser, SystemConfig};
use flowline_core::ResourceId;
use flowline_core::agent::AgentCommand;
use flowline_core::event::EventBus;
use flowline_core::flow::Flow;
use flowline_core::job::{Job, JobStatus, Trigger, Vars};
use flowline_core::step::{ExecResult, StepStatus};
use flowline_db::{MemJobRepo, MemStepRepo};
use flowline_scheduler::agent::LocalAgentPool;
use flowline_scheduler::queue::{Broker, MemoryBroker, PublishOptions};
use flowline_scheduler::{Collaborators, JobService};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const PIPELINE: &str = r#"
pipeline "api"
env { STAGE "ci" }
step "build" { run "make" }
step "test" { run "make test" }
"#;

pub struct Engine {
    pub service: Arc<JobService>,
    pub broker: Arc<MemoryBroker>,
    pub agents: Arc<LocalAgentPool>,
    pub config: SystemConfig,
    pub flow: Flow,
}

impl Engine {
    pub async fn new(config: SystemConfig) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let agents = Arc::new(LocalAgentPool::new());
        let collaborators = Collaborators {
            jobs: Arc::new(MemJobRepo::new()),
            steps: Arc::new(MemStepRepo::new()),
            broker: broker.clone(),
            agents: agents.clone(),
            parser: Arc::new(KdlPipelineParser),
            events: EventBus::new(),
        };
        let service = JobService::new(collaborators, &config);
        service.start_consumers().await.unwrap();

        Self {
            service,
            broker,
            agents,
            config,
            flow: Flow::from_name("api"),
        }
    }

    /// Start the flow's dispatch worker.
    pub async fn start_flow(&self) {
        self.service.on_flow_created(&self.flow).await.unwrap();
    }

    pub async fn create(&self, definition: &str) -> Job {
        self.service
            .create(&self.flow, definition, Trigger::Manual, Vars::new())
            .await
            .unwrap()
    }

    pub async fn run(&self, definition: &str) -> Job {
        self.service
            .run(&self.flow, definition, Trigger::Manual, Vars::new())
            .await
            .unwrap()
    }

    /// Wait until the job reaches `status`.
    pub async fn wait_status(&self, job_id: ResourceId, status: JobStatus) -> Job {
        let mut events = self.service.events().subscribe();
        loop {
            let job = self.service.get(job_id).await.unwrap();
            if job.status == status {
                return job;
            }
            let _ = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap_or_else(|_| panic!("job stuck in {} waiting for {}", job.status, status));
        }
    }

    /// Wait until a queue has no ready or unacknowledged messages.
    pub async fn drain(&self, queue: &str) {
        for _ in 0..1000 {
            if self.broker.ready_count(queue) == 0 && self.broker.unacked_count(queue) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue {} never drained", queue);
    }

    pub async fn publish_result(&self, result: &ExecResult) {
        let body = serde_json::to_vec(result).unwrap();
        self.broker
            .publish(&self.config.queue.callback, body, PublishOptions::default())
            .await
            .unwrap();
    }
}

/// Commands received by a scripted agent, in order.
pub type Received = Arc<Mutex<Vec<AgentCommand>>>;

/// Register an agent that answers each run command with `reply`.
///
/// `None` from `reply` leaves the step running. A kill is confirmed with a
/// KILLED result for the last step when `confirm_kill` is set.
pub fn spawn_agent<F>(engine: &Engine, id: &str, confirm_kill: bool, reply: F) -> Received
where
    F: Fn(&flowline_core::agent::RunCommand) -> Option<ExecResult> + Send + 'static,
{
    let mut commands = engine.agents.register(id);
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let broker = engine.broker.clone();
    let callback = engine.config.queue.callback.clone();
    let log = received.clone();

    tokio::spawn(async move {
        let mut last_step = None;
        while let Some(command) = commands.recv().await {
            log.lock().push(command.clone());
            let result = match &command {
                AgentCommand::Run(run) => {
                    last_step = Some(run.step_id);
                    reply(run)
                }
                AgentCommand::Kill { .. } if confirm_kill => last_step
                    .map(|step_id| ExecResult::new(step_id, StepStatus::Killed).with_code(137)),
                AgentCommand::Kill { .. } => None,
            };
            if let Some(result) = result {
                let body = serde_json::to_vec(&result).unwrap();
                broker
                    .publish(&callback, body, PublishOptions::default())
                    .await
                    .unwrap();
            }
        }
    });
    received
}

pub fn succeed(run: &flowline_core::agent::RunCommand) -> Option<ExecResult> {
    Some(ExecResult::new(run.step_id, StepStatus::Success).with_code(0))
}

pub fn hang(_: &flowline_core::agent::RunCommand) -> Option<ExecResult> {
    None
}

/// Wait until an agent has received at least `count` commands.
pub async fn wait_commands(received: &Received, count: usize) {
    for _ in 0..1000 {
        if received.lock().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("agent received {} commands, expected {}", received.lock().len(), count);
}

pub fn run_paths(received: &Received) -> Vec<String> {
    received
        .lock()
        .iter()
        .filter_map(|command| match command {
            AgentCommand::Run(run) => Some(run.node_path.clone()),
            AgentCommand::Kill { .. } => None,
        })
        .collect()
}
