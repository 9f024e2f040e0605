//! Job state machine.
//!
//! Transitions live in an immutable table keyed by `(from, to)`. Requests for
//! the same job are serialized through [`JobLocks`]; unrelated jobs never
//! contend. An action that fails leaves the job in `FAILURE` with the error
//! recorded, never stuck in a non-terminal status.

use chrono::Utc;
use flowline_core::ResourceId;
use flowline_core::agent::{Agent, AgentCommand, AgentDirectory, RunCommand};
use flowline_core::event::{DomainEvent, EventBus};
use flowline_core::job::{Job, JobStatus};
use flowline_core::pipeline::{PipelineParser, StepNode};
use flowline_core::step::{ExecResult, StepStatus};
use flowline_db::JobRepo;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lock::JobLocks;
use crate::queue::{Broker, PublishOptions};
use crate::service::Collaborators;
use crate::steps::StepManager;
use crate::{SchedulerError, SchedulerResult};

const AGENT_OFFLINE: &str = "Agent unexpectedly offline";

/// Why a cancellation is being resolved without the agent's confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    AgentOffline,
    KillTimeout,
}

/// State handed to a transition action.
#[derive(Debug)]
pub struct Context {
    pub job: Job,
    pub to: JobStatus,
    /// Step result that triggered the request.
    pub result: Option<ExecResult>,
    pub reason: Option<Reason>,
    /// Agent acquired for a queued job.
    pub agent: Option<Agent>,
    /// Infrastructure failure that stopped a queued job from being dispatched.
    pub error: Option<String>,
}

type Action = for<'a> fn(&'a StateMachine, &'a mut Context) -> BoxFuture<'a, SchedulerResult<()>>;
type Guard = fn(&Context) -> bool;

struct Transition {
    name: &'static str,
    action: Action,
    guard: Option<Guard>,
}

macro_rules! action {
    ($method:ident) => {{
        fn act<'a>(
            machine: &'a StateMachine,
            ctx: &'a mut Context,
        ) -> BoxFuture<'a, SchedulerResult<()>> {
            machine.$method(ctx).boxed()
        }
        act as Action
    }};
}

static TRANSITIONS: LazyLock<HashMap<(JobStatus, JobStatus), Transition>> = LazyLock::new(|| {
    use JobStatus::*;

    let mut table = HashMap::new();
    let mut add = |from: JobStatus,
                   to: JobStatus,
                   name: &'static str,
                   action: Action,
                   guard: Option<Guard>| {
        table.insert((from, to), Transition { name, action, guard });
    };

    add(Created, Queued, "start", action!(start), None);
    add(Created, Cancelled, "cancel before start", action!(cancel_created), None);
    add(Queued, Cancelled, "cancel while queued", action!(cancel_queued), None);
    add(Queued, Timeout, "queued wait expired", action!(queue_expired), None);
    add(Queued, Running, "run", action!(start_running), Some(has_agent as Guard));
    add(
        Queued,
        Failure,
        "dispatch failed",
        action!(dispatch_failed),
        Some(has_error as Guard),
    );
    add(Running, Running, "continue", action!(resume), Some(has_result as Guard));
    add(Running, Cancelled, "cancel while running", action!(cancel_running), None);
    add(
        Cancelling,
        Cancelled,
        "cancel confirmed",
        action!(finish_cancel),
        Some(has_result_or_reason as Guard),
    );
    table
});

fn has_agent(ctx: &Context) -> bool {
    ctx.agent.is_some()
}

fn has_error(ctx: &Context) -> bool {
    ctx.error.is_some()
}

fn has_result(ctx: &Context) -> bool {
    ctx.result.is_some()
}

fn has_result_or_reason(ctx: &Context) -> bool {
    ctx.result.is_some() || ctx.reason.is_some()
}

/// Extra inputs of a transition request.
#[derive(Debug, Default)]
struct Request {
    result: Option<ExecResult>,
    reason: Option<Reason>,
    agent: Option<Agent>,
    error: Option<String>,
}

/// Outcome of handing a dequeued job to an agent.
#[derive(Debug)]
pub enum DispatchOutcome {
    Done(Job),
    /// Shutdown arrived before an agent was found; the job is still queued.
    Interrupted,
}

pub struct StateMachine {
    jobs: Arc<dyn JobRepo>,
    steps: Arc<StepManager>,
    broker: Arc<dyn Broker>,
    agents: Arc<dyn AgentDirectory>,
    parser: Arc<dyn PipelineParser>,
    events: EventBus,
    locks: JobLocks,
    cancel_timeout: Option<Duration>,
    timers: CancellationToken,
    me: Weak<StateMachine>,
}

impl StateMachine {
    /// `cancel_timeout` bounds how long a job may sit in `CANCELLING`.
    pub fn new(
        collaborators: &Collaborators,
        steps: Arc<StepManager>,
        cancel_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            jobs: collaborators.jobs.clone(),
            steps,
            broker: collaborators.broker.clone(),
            agents: collaborators.agents.clone(),
            parser: collaborators.parser.clone(),
            events: collaborators.events.clone(),
            locks: JobLocks::new(),
            cancel_timeout,
            timers: CancellationToken::new(),
            me: me.clone(),
        })
    }

    /// Request a transition to `to`. Inapplicable requests are no-ops.
    pub async fn execute(&self, job_id: ResourceId, to: JobStatus) -> SchedulerResult<Job> {
        let (job, _) = self.run(job_id, Some(to), Request::default()).await?;
        Ok(job)
    }

    /// Apply an agent-reported step result and advance or finish its job.
    pub async fn on_step_result(&self, result: ExecResult) -> SchedulerResult<Job> {
        let step = self.steps.get(result.step_id).await?;
        let request = Request {
            result: Some(result),
            ..Default::default()
        };
        let (job, _) = self.run(step.job_id, None, request).await?;
        Ok(job)
    }

    /// Resolve a job whose agent went offline.
    pub async fn agent_offline(&self, job_id: ResourceId) -> SchedulerResult<Job> {
        let request = Request {
            reason: Some(Reason::AgentOffline),
            ..Default::default()
        };
        let (job, _) = self
            .run(job_id, Some(JobStatus::Cancelled), request)
            .await?;
        Ok(job)
    }

    /// Find an agent for a dequeued job and start running it.
    ///
    /// Waiting for an agent happens outside the job lock, so a cancel request
    /// or the queued-wait deadline can still resolve the job meanwhile.
    pub async fn dispatch(
        &self,
        job_id: ResourceId,
        shutdown: &CancellationToken,
    ) -> SchedulerResult<DispatchOutcome> {
        let mut events = self.events.subscribe();
        let job = self.jobs.get(job_id).await?;
        if job.status != JobStatus::Queued {
            debug!(job_id = %job_id, status = %job.status, "Job no longer queued, skipped");
            return Ok(DispatchOutcome::Done(job));
        }

        let deadline = (job.expire_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let agent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(DispatchOutcome::Interrupted),
            _ = self.left_queue(&mut events, &job) => {
                return Ok(DispatchOutcome::Done(self.jobs.get(job_id).await?));
            }
            _ = tokio::time::sleep(deadline) => {
                let job = self.execute(job_id, JobStatus::Timeout).await?;
                return Ok(DispatchOutcome::Done(job));
            }
            agent = self.agents.acquire(&job) => match agent {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Agent acquisition failed");
                    let request = Request {
                        error: Some(format!("agent acquisition failed: {}", e)),
                        ..Default::default()
                    };
                    let (job, _) = self.run(job_id, Some(JobStatus::Failure), request).await?;
                    return Ok(DispatchOutcome::Done(job));
                }
            },
        };
        debug!(job_id = %job_id, agent_id = %agent.id, "Agent acquired");

        let request = Request {
            agent: Some(agent.clone()),
            ..Default::default()
        };
        match self.run(job_id, Some(JobStatus::Running), request).await {
            Ok((job, true)) => Ok(DispatchOutcome::Done(job)),
            Ok((job, false)) => {
                self.release(&agent.id).await;
                Ok(DispatchOutcome::Done(job))
            }
            Err(e) => {
                self.release(&agent.id).await;
                Err(e)
            }
        }
    }

    /// Stop pending cancellation timers.
    pub fn shutdown(&self) {
        self.timers.cancel();
    }

    async fn run(
        &self,
        job_id: ResourceId,
        to: Option<JobStatus>,
        request: Request,
    ) -> SchedulerResult<(Job, bool)> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.jobs.get(job_id).await?;
        let to = to.unwrap_or(match job.status {
            JobStatus::Cancelling => JobStatus::Cancelled,
            _ => JobStatus::Running,
        });

        let Some(transition) = TRANSITIONS.get(&(job.status, to)) else {
            debug!(job_id = %job_id, from = %job.status, to = %to, "No transition, request ignored");
            return Ok((job, false));
        };

        let mut ctx = Context {
            job,
            to,
            result: request.result,
            reason: request.reason,
            agent: request.agent,
            error: request.error,
        };
        if transition.guard.is_some_and(|guard| !guard(&ctx)) {
            debug!(job_id = %job_id, transition = transition.name, "Guard rejected transition");
            return Ok((ctx.job, false));
        }

        debug!(job_id = %job_id, transition = transition.name, "Applying transition");
        match (transition.action)(self, &mut ctx).await {
            Ok(()) => Ok((ctx.job, true)),
            Err(e) => {
                error!(job_id = %job_id, transition = transition.name, error = %e, "Transition failed");
                let mut job = self
                    .jobs
                    .get(job_id)
                    .await
                    .unwrap_or_else(|_| ctx.job.clone());
                // The agent may be bound in memory but not yet persisted.
                if job.agent_id.is_none() {
                    job.agent_id = ctx.job.agent_id.clone();
                }
                if !job.is_terminal() {
                    self.to_finish(
                        &mut job,
                        JobStatus::Failure,
                        Some(e.to_string()),
                        &[StepStatus::Pending],
                    )
                    .await?;
                }
                Ok((job, true))
            }
        }
    }

    /// The only writer of `job.status`.
    ///
    /// Writing the current status again only persists the message. A job in
    /// a terminal status never changes status again.
    pub async fn set_status_and_save(
        &self,
        job: &mut Job,
        status: JobStatus,
        message: Option<String>,
    ) -> SchedulerResult<()> {
        if job.status == status {
            if message.is_some() {
                job.message = message;
            }
            self.jobs.save(job).await?;
            return Ok(());
        }

        if job.is_terminal() {
            warn!(job_id = %job.id, status = %job.status, requested = %status, "Job already finished, status kept");
            return Ok(());
        }

        job.status = status;
        job.message = message;
        if status.is_terminal() && job.finished_at.is_none() {
            job.finished_at = Some(Utc::now());
        }
        job.sync_context();
        self.jobs.save(job).await?;

        info!(job_id = %job.id, key = %job.key(), status = %status, "Job status changed");
        self.events.publish(DomainEvent::JobStatusChanged {
            job: Box::new(job.clone()),
        });
        Ok(())
    }

    async fn to_finish(
        &self,
        job: &mut Job,
        status: JobStatus,
        message: Option<String>,
        skip: &[StepStatus],
    ) -> SchedulerResult<()> {
        if !skip.is_empty() {
            self.steps.skip(job.id, skip).await?;
        }
        self.set_status_and_save(job, status, message).await?;
        if let Some(agent_id) = job.agent_id.as_deref() {
            self.release(agent_id).await;
        }
        self.steps.forget(job.id);
        Ok(())
    }

    async fn release(&self, agent_id: &str) {
        if let Err(e) = self.agents.release(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to release agent");
        }
    }

    async fn start(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let job = &mut ctx.job;
        if job.is_expired() {
            let message = Some("expired before enqueue".to_string());
            return self.to_finish(job, JobStatus::Timeout, message, &[]).await;
        }

        self.set_status_and_save(job, JobStatus::Queued, None).await?;

        let queue = job.queue_name();
        let options = PublishOptions {
            priority: job.priority,
            ttl: Some(Duration::from_secs(job.expire_secs)),
        };
        if let Err(e) = self.broker.publish(&queue, job.id.to_bytes(), options).await {
            error!(job_id = %job.id, queue = %queue, error = %e, "Failed to enqueue job");
            let message = Some(format!("failed to enqueue: {}", e));
            return self.to_finish(job, JobStatus::Failure, message, &[]).await;
        }
        info!(job_id = %job.id, queue = %queue, priority = job.priority, "Job enqueued");
        Ok(())
    }

    async fn cancel_created(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let message = Some("cancelled before start".to_string());
        self.to_finish(&mut ctx.job, JobStatus::Cancelled, message, &[])
            .await
    }

    async fn cancel_queued(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let message = Some("cancelled while queued up".to_string());
        self.to_finish(&mut ctx.job, JobStatus::Cancelled, message, &[])
            .await
    }

    async fn queue_expired(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let message = Some("expired while queued up".to_string());
        self.to_finish(&mut ctx.job, JobStatus::Timeout, message, &[])
            .await
    }

    async fn dispatch_failed(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let message = ctx.error.take();
        self.to_finish(&mut ctx.job, JobStatus::Failure, message, &[])
            .await
    }

    async fn start_running(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let agent = ctx
            .agent
            .clone()
            .ok_or_else(|| SchedulerError::Status("no agent acquired".to_string()))?;
        let job = &mut ctx.job;
        job.agent_id = Some(agent.id.clone());
        job.started_at = Some(Utc::now());

        let tree = self.parser.parse(&job.definition)?;
        if self.steps.list(job.id).await?.is_empty() {
            self.steps.init(job, &tree).await?;
        }

        let node = job
            .current_path
            .as_deref()
            .and_then(|path| tree.get(path))
            .or_else(|| tree.first())
            .ok_or_else(|| SchedulerError::Status("pipeline has no steps".to_string()))?;
        job.current_path = Some(node.path.clone());

        self.set_status_and_save(job, JobStatus::Running, None)
            .await?;
        self.dispatch_node(job, &agent, node).await
    }

    async fn resume(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let Some(result) = ctx.result.take() else {
            return Ok(());
        };
        let job = &mut ctx.job;
        let step = self.steps.result_update(result).await?;
        job.context
            .extend(step.output.iter().map(|(k, v)| (k.clone(), v.clone())));

        if step.is_ongoing() || job.current_path.as_deref() != Some(step.node_path.as_str()) {
            return self
                .set_status_and_save(job, JobStatus::Running, None)
                .await;
        }

        let tree = self.parser.parse(&job.definition)?;
        let steps = self.steps.list(job.id).await?;
        let failed = steps
            .iter()
            .find(|s| s.status.is_finished() && !s.is_success());

        if let Some(next) = tree.next(&step.node_path, failed.is_none()) {
            job.current_path = Some(next.path.clone());
            self.set_status_and_save(job, JobStatus::Running, None)
                .await?;
            let agent_id = job
                .agent_id
                .clone()
                .ok_or_else(|| SchedulerError::Status("running job has no agent".to_string()))?;
            let agent = self.agents.get(&agent_id).await?;
            return self.dispatch_node(job, &agent, next).await;
        }

        let (status, message) = match failed {
            None => (JobStatus::Success, None),
            Some(s) if s.status == StepStatus::Timeout => (
                JobStatus::Timeout,
                Some(format!("step {} timed out", s.node_path)),
            ),
            Some(s) => (
                JobStatus::Failure,
                Some(format!("step {} finished with {}", s.node_path, s.status)),
            ),
        };
        self.to_finish(job, status, message, &[StepStatus::Pending])
            .await
    }

    async fn cancel_running(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let job = &mut ctx.job;
        if ctx.reason == Some(Reason::AgentOffline) {
            let message = Some(AGENT_OFFLINE.to_string());
            return self
                .to_finish(job, JobStatus::Cancelled, message, &StepStatus::ONGOING)
                .await;
        }

        let Some(agent_id) = job.agent_id.clone() else {
            let message = Some("cancel while not agent assigned".to_string());
            return self
                .to_finish(job, JobStatus::Cancelled, message, &StepStatus::ONGOING)
                .await;
        };

        let agent = match self.agents.get(&agent_id).await {
            Ok(agent) if agent.is_online() && agent.is_busy() => Some(agent),
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let Some(agent) = agent else {
            let message = Some("cancel while agent offline".to_string());
            return self
                .to_finish(job, JobStatus::Cancelled, message, &StepStatus::ONGOING)
                .await;
        };

        let command = AgentCommand::Kill { job_id: job.id };
        if let Err(e) = self.agents.dispatch(command, &agent).await {
            warn!(job_id = %job.id, agent_id = %agent.id, error = %e, "Failed to send kill");
            let message = Some(format!("kill not delivered: {}", e));
            return self
                .to_finish(job, JobStatus::Cancelled, message, &StepStatus::ONGOING)
                .await;
        }

        self.set_status_and_save(job, JobStatus::Cancelling, None)
            .await?;
        info!(job_id = %job.id, agent_id = %agent.id, "Kill sent, waiting for confirmation");
        self.schedule_cancel_timeout(job.id);
        Ok(())
    }

    async fn finish_cancel(&self, ctx: &mut Context) -> SchedulerResult<()> {
        let job = &mut ctx.job;
        if let Some(result) = ctx.result.take() {
            self.steps.result_update(result).await?;
            let message = Some("kill confirmed by agent".to_string());
            return self
                .to_finish(job, JobStatus::Cancelled, message, &[StepStatus::Pending])
                .await;
        }

        let message = match ctx.reason {
            Some(Reason::KillTimeout) => "kill confirmation timed out",
            _ => AGENT_OFFLINE,
        };
        self.to_finish(
            job,
            JobStatus::Cancelled,
            Some(message.to_string()),
            &StepStatus::ONGOING,
        )
        .await
    }

    async fn dispatch_node(&self, job: &Job, agent: &Agent, node: &StepNode) -> SchedulerResult<()> {
        let mut step = self.steps.get_by_path(job.id, &node.path).await?;
        step.agent_id = Some(agent.id.clone());
        self.steps
            .status_change(&mut step, StepStatus::Running, None)
            .await?;

        let mut inputs = job.context.clone();
        inputs.extend(node.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let command = AgentCommand::Run(RunCommand {
            job_id: job.id,
            step_id: step.id,
            node_path: node.path.clone(),
            image: node.image.clone(),
            commands: node.commands.clone(),
            inputs,
            timeout_secs: job.timeout_secs,
        });
        self.agents.dispatch(command, agent).await?;
        info!(job_id = %job.id, path = %node.path, agent_id = %agent.id, "Step dispatched");
        Ok(())
    }

    fn schedule_cancel_timeout(&self, job_id: ResourceId) {
        let (Some(wait), Some(machine)) = (self.cancel_timeout, self.me.upgrade()) else {
            return;
        };
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let request = Request {
                        reason: Some(Reason::KillTimeout),
                        ..Default::default()
                    };
                    if let Err(e) = machine.run(job_id, Some(JobStatus::Cancelled), request).await {
                        warn!(job_id = %job_id, error = %e, "Failed to resolve cancellation timeout");
                    }
                }
            }
        });
    }

    /// Resolves once the job leaves `QUEUED` or its flow's jobs are deleted.
    async fn left_queue(&self, events: &mut broadcast::Receiver<DomainEvent>, job: &Job) {
        loop {
            match events.recv().await {
                Ok(DomainEvent::JobStatusChanged { job: changed }) if changed.id == job.id => {
                    if changed.status != JobStatus::Queued {
                        return;
                    }
                }
                Ok(DomainEvent::JobsDeleted { flow_id, .. }) if flow_id == job.flow_id => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => match self.jobs.get(job.id).await {
                    Ok(current) if current.status == JobStatus::Queued => {}
                    _ => return,
                },
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}
