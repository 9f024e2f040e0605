//! Job service: the entry points used by the outside world.

use flowline_config::SystemConfig;
use flowline_config::system::JobConfig;
use flowline_core::ResourceId;
use flowline_core::agent::{Agent, AgentDirectory};
use flowline_core::event::{DomainEvent, EventBus};
use flowline_core::flow::Flow;
use flowline_core::job::{Job, JobStatus, Trigger, Vars, vars};
use flowline_core::pipeline::PipelineParser;
use flowline_core::step::Step;
use flowline_db::{JobRepo, StepRepo};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SchedulerResult;
use crate::callback::CallbackConsumer;
use crate::machine::StateMachine;
use crate::pool::TaskPool;
use crate::queue::Broker;
use crate::registry::FlowQueueRegistry;
use crate::steps::StepManager;
use crate::timeout::TimeoutConsumer;

/// External services the engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobRepo>,
    pub steps: Arc<dyn StepRepo>,
    pub broker: Arc<dyn Broker>,
    pub agents: Arc<dyn AgentDirectory>,
    pub parser: Arc<dyn PipelineParser>,
    pub events: EventBus,
}

pub struct JobService {
    jobs: Arc<dyn JobRepo>,
    broker: Arc<dyn Broker>,
    parser: Arc<dyn PipelineParser>,
    events: EventBus,
    steps: Arc<StepManager>,
    machine: Arc<StateMachine>,
    registry: FlowQueueRegistry,
    defaults: JobConfig,
    callback_queue: String,
    dead_letter_queue: String,
    create_pool: TaskPool,
    delete_pool: TaskPool,
    shutdown: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobService {
    pub fn new(collaborators: Collaborators, config: &SystemConfig) -> Arc<Self> {
        let steps = Arc::new(StepManager::new(
            collaborators.steps.clone(),
            collaborators.events.clone(),
        ));
        let cancel_timeout = match config.job.cancel_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let machine = StateMachine::new(&collaborators, steps.clone(), cancel_timeout);
        let shutdown = CancellationToken::new();
        let registry = FlowQueueRegistry::new(
            collaborators.broker.clone(),
            machine.clone(),
            config.queue.dead_letter.clone(),
            shutdown.clone(),
        );

        Arc::new(Self {
            jobs: collaborators.jobs,
            broker: collaborators.broker,
            parser: collaborators.parser,
            events: collaborators.events,
            steps,
            machine,
            registry,
            defaults: config.job.clone(),
            callback_queue: config.queue.callback.clone(),
            dead_letter_queue: config.queue.dead_letter.clone(),
            create_pool: TaskPool::new("create", config.workers.create),
            delete_pool: TaskPool::new("delete", config.workers.delete),
            shutdown,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn registry(&self) -> &FlowQueueRegistry {
        &self.registry
    }

    /// Create a job for `flow` from a pipeline definition.
    pub async fn create(
        &self,
        flow: &Flow,
        definition: impl Into<String>,
        trigger: Trigger,
        input: Vars,
    ) -> SchedulerResult<Job> {
        let definition = definition.into();
        let tree = self.parser.parse(&definition)?;
        let build_number = self.jobs.next_build_number(flow.id).await?;

        let mut job = Job::new(flow.id, build_number, trigger, definition)
            .with_timeout(self.defaults.timeout_secs)
            .with_expire(self.defaults.expire_secs)
            .with_priority(self.defaults.priority);

        let context = &mut job.context;
        context.insert(vars::FLOW_ID.to_string(), flow.id.to_string());
        context.insert(vars::FLOW_NAME.to_string(), flow.name.clone());
        context.insert(vars::JOB_BUILD_NUMBER.to_string(), build_number.to_string());
        context.insert(vars::JOB_TRIGGER.to_string(), trigger.to_string());
        context.extend(tree.env);
        context.extend(input);
        job.sync_context();

        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, key = %job.key(), flow = %flow.name, trigger = %trigger, "Job created");
        self.events.publish(DomainEvent::JobCreated {
            job: Box::new(job.clone()),
        });
        Ok(job)
    }

    /// Enqueue a created job.
    pub async fn start(&self, job_id: ResourceId) -> SchedulerResult<Job> {
        self.machine.execute(job_id, JobStatus::Queued).await
    }

    /// Create a job and enqueue it right away.
    pub async fn run(
        &self,
        flow: &Flow,
        definition: impl Into<String>,
        trigger: Trigger,
        input: Vars,
    ) -> SchedulerResult<Job> {
        let job = self.create(flow, definition, trigger, input).await?;
        self.start(job.id).await
    }

    /// [`JobService::run`] on the bounded create pool.
    pub fn submit(
        self: &Arc<Self>,
        flow: Flow,
        definition: String,
        trigger: Trigger,
        input: Vars,
    ) -> JoinHandle<Option<SchedulerResult<Job>>> {
        let service = self.clone();
        self.create_pool
            .spawn(async move { service.run(&flow, definition, trigger, input).await })
    }

    pub async fn cancel(&self, job_id: ResourceId) -> SchedulerResult<Job> {
        self.machine.execute(job_id, JobStatus::Cancelled).await
    }

    pub async fn get(&self, job_id: ResourceId) -> SchedulerResult<Job> {
        Ok(self.jobs.get(job_id).await?)
    }

    pub async fn get_by_key(&self, flow_id: ResourceId, build_number: u64) -> SchedulerResult<Job> {
        Ok(self.jobs.get_by_key(flow_id, build_number).await?)
    }

    /// Most recent jobs of a flow first.
    pub async fn list(&self, flow_id: ResourceId, limit: i64) -> SchedulerResult<Vec<Job>> {
        Ok(self.jobs.list_by_flow(flow_id, limit).await?)
    }

    pub async fn steps(&self, job_id: ResourceId) -> SchedulerResult<Vec<Step>> {
        self.steps.list(job_id).await
    }

    pub async fn on_flow_created(&self, flow: &Flow) -> SchedulerResult<()> {
        self.registry.start(flow).await
    }

    /// Start the queues of every known flow, e.g. at boot.
    pub async fn init_flows(&self, flows: &[Flow]) -> SchedulerResult<()> {
        for flow in flows {
            self.registry.start(flow).await?;
        }
        info!(count = flows.len(), "Flow queues initialized");
        Ok(())
    }

    /// Retire the flow's queue, then delete its jobs and steps on the bounded
    /// delete pool. Resolves to the number of jobs deleted.
    pub fn delete_flow(self: &Arc<Self>, flow_id: ResourceId) -> JoinHandle<Option<SchedulerResult<u64>>> {
        let service = self.clone();
        self.delete_pool
            .spawn(async move { service.purge_flow(flow_id).await })
    }

    async fn purge_flow(&self, flow_id: ResourceId) -> SchedulerResult<u64> {
        let purged = self.registry.stop(flow_id).await?;
        let steps = self.steps.delete_by_flow(flow_id).await?;
        let count = self.jobs.delete_by_flow(flow_id).await?;
        info!(flow_id = %flow_id, jobs = count, steps, purged, "Flow deleted");
        self.events
            .publish(DomainEvent::JobsDeleted { flow_id, count });
        Ok(count)
    }

    /// React to an agent status report. An agent that went offline while
    /// bound to a job cancels that job.
    pub async fn on_agent_status(&self, agent: &Agent) -> SchedulerResult<Option<Job>> {
        let Some(job_id) = agent.job_id else {
            return Ok(None);
        };
        if agent.is_online() {
            return Ok(None);
        }

        match self.machine.agent_offline(job_id).await {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_not_found() => {
                warn!(agent_id = %agent.id, job_id = %job_id, "Offline agent bound to unknown job");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Declare the shared queues and start the callback and timeout consumers.
    pub async fn start_consumers(&self) -> SchedulerResult<()> {
        self.broker.declare(&self.dead_letter_queue, None).await?;
        self.broker.declare(&self.callback_queue, None).await?;
        for queue in [&self.dead_letter_queue, &self.callback_queue] {
            let recovered = self.broker.recover(queue).await?;
            if recovered > 0 {
                info!(queue = %queue, recovered, "Unacknowledged messages requeued");
            }
        }

        let callback = CallbackConsumer::new(
            self.callback_queue.clone(),
            self.broker.clone(),
            self.machine.clone(),
        );
        let timeout = TimeoutConsumer::new(
            self.dead_letter_queue.clone(),
            self.broker.clone(),
            self.jobs.clone(),
            self.machine.clone(),
        );

        let mut consumers = self.consumers.lock();
        consumers.push(tokio::spawn(callback.run(self.shutdown.child_token())));
        consumers.push(tokio::spawn(timeout.run(self.shutdown.child_token())));
        Ok(())
    }

    /// Stop every consumer after its in-flight message and drop pending timers.
    pub async fn shutdown(&self) {
        info!("Shutting down job service");
        self.shutdown.cancel();
        self.machine.shutdown();
        self.create_pool.close();
        self.delete_pool.close();
        self.registry.shutdown().await;

        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for handle in consumers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Consumer ended abnormally");
            }
        }
    }
}
