//! Wiring of stores, broker and agents into a running job service.

use anyhow::{Context, Result};
use flowline_config::{KdlPipelineParser, SystemConfig};
use flowline_core::event::EventBus;
use flowline_db::{MemJobRepo, MemStepRepo, PgJobRepo, PgStepRepo};
use flowline_scheduler::queue::{Broker, MemoryBroker, PgBroker};
use flowline_scheduler::{Collaborators, JobService, LocalAgentPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runner::LocalRunner;

pub struct Engine {
    pub service: Arc<JobService>,
    pub agents: Arc<LocalAgentPool>,
    shutdown: CancellationToken,
    runners: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Connect the backends and start the shared consumers.
    ///
    /// Without a database url everything lives in memory and is lost on exit.
    pub async fn start(config: &SystemConfig, local_agents: usize) -> Result<Self> {
        let agents = Arc::new(LocalAgentPool::new());
        let (jobs, steps, broker) = match &config.database.url {
            Some(url) => {
                info!("Connecting to database...");
                let pool = flowline_db::create_pool(url, config.database.max_connections)
                    .await
                    .context("failed to connect to database")?;
                info!("Running migrations...");
                flowline_db::run_migrations(&pool)
                    .await
                    .context("failed to run migrations")?;
                let poll = Duration::from_millis(config.queue.poll_interval_ms);
                (
                    Arc::new(PgJobRepo::new(pool.clone())) as Arc<dyn flowline_db::JobRepo>,
                    Arc::new(PgStepRepo::new(pool.clone())) as Arc<dyn flowline_db::StepRepo>,
                    Arc::new(PgBroker::new(pool, poll)) as Arc<dyn Broker>,
                )
            }
            None => {
                info!("No database configured, using in-memory stores");
                (
                    Arc::new(MemJobRepo::new()) as Arc<dyn flowline_db::JobRepo>,
                    Arc::new(MemStepRepo::new()) as Arc<dyn flowline_db::StepRepo>,
                    Arc::new(MemoryBroker::new()) as Arc<dyn Broker>,
                )
            }
        };

        let collaborators = Collaborators {
            jobs,
            steps,
            broker: broker.clone(),
            agents: agents.clone(),
            parser: Arc::new(KdlPipelineParser),
            events: EventBus::new(),
        };
        let service = JobService::new(collaborators, config);
        service
            .start_consumers()
            .await
            .context("failed to start queue consumers")?;

        let shutdown = CancellationToken::new();
        let runners = (0..local_agents)
            .map(|n| {
                spawn_runner(
                    format!("local-{}", n + 1),
                    &service,
                    &agents,
                    broker.clone(),
                    &config.queue.callback,
                    shutdown.clone(),
                )
            })
            .collect();
        info!(local_agents, "Engine started");

        Ok(Self {
            service,
            agents,
            shutdown,
            runners,
        })
    }

    pub async fn shutdown(self) {
        self.service.shutdown().await;
        self.shutdown.cancel();
        for handle in self.runners {
            let _ = handle.await;
        }
    }
}

/// Register a local agent and run it, taking it offline if it dies.
fn spawn_runner(
    id: String,
    service: &Arc<JobService>,
    agents: &Arc<LocalAgentPool>,
    broker: Arc<dyn Broker>,
    callback: &str,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let commands = agents.register(id.clone());
    let runner = LocalRunner::new(id.clone(), broker, callback);
    let handle = tokio::spawn(runner.run(commands, shutdown.clone()));

    let service = service.clone();
    let agents = agents.clone();
    tokio::spawn(async move {
        let outcome = handle.await;
        if shutdown.is_cancelled() {
            return;
        }
        match outcome {
            Ok(()) => warn!(agent_id = %id, "Local runner exited"),
            Err(e) => warn!(agent_id = %id, error = %e, "Local runner crashed"),
        }
        let Some(agent) = agents.set_offline(&id) else {
            return;
        };
        match service.on_agent_status(&agent).await {
            Ok(Some(job)) => info!(agent_id = %id, job_id = %job.id, status = %job.status, "Bound job released"),
            Ok(None) => {}
            Err(e) => warn!(agent_id = %id, error = %e, "Failed to release bound job"),
        }
    })
}
