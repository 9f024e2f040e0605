//! In-process agent pool.

use async_trait::async_trait;
use flowline_core::agent::{Agent, AgentCommand, AgentDirectory, AgentStatus};
use flowline_core::job::Job;
use flowline_core::{Error, ResourceId, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

struct Slot {
    agent: Agent,
    commands: mpsc::UnboundedSender<AgentCommand>,
}

/// Agents living in the same process as the engine.
///
/// Each registered agent receives its commands on a channel. Agents are
/// handed out in registration order.
#[derive(Default)]
pub struct LocalAgentPool {
    slots: Mutex<IndexMap<String, Slot>>,
    available: Notify,
}

impl LocalAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an idle agent, replacing any previous one with the same id.
    pub fn register(&self, id: impl Into<String>) -> mpsc::UnboundedReceiver<AgentCommand> {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Agent {
            id: id.clone(),
            name: id.clone(),
            status: AgentStatus::Idle,
            job_id: None,
        };
        self.slots.lock().insert(
            id.clone(),
            Slot {
                agent,
                commands: tx,
            },
        );
        info!(agent_id = %id, "Agent registered");
        self.available.notify_waiters();
        rx
    }

    /// Mark an agent offline. Returns its last snapshot, still bound to its
    /// job, so the job can be reconciled.
    pub fn set_offline(&self, id: &str) -> Option<Agent> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id)?;
        slot.agent.status = AgentStatus::Offline;
        info!(agent_id = %id, "Agent offline");
        Some(slot.agent.clone())
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.slots
            .lock()
            .values()
            .map(|slot| slot.agent.clone())
            .collect()
    }

    fn try_acquire(&self, job_id: ResourceId) -> Option<Agent> {
        let mut slots = self.slots.lock();
        let slot = slots
            .values_mut()
            .find(|slot| slot.agent.status == AgentStatus::Idle)?;
        slot.agent.status = AgentStatus::Busy;
        slot.agent.job_id = Some(job_id);
        Some(slot.agent.clone())
    }
}

#[async_trait]
impl AgentDirectory for LocalAgentPool {
    async fn get(&self, agent_id: &str) -> Result<Agent> {
        self.slots
            .lock()
            .get(agent_id)
            .map(|slot| slot.agent.clone())
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))
    }

    async fn acquire(&self, job: &Job) -> Result<Agent> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(agent) = self.try_acquire(job.id) {
                debug!(agent_id = %agent.id, job_id = %job.id, "Agent bound to job");
                return Ok(agent);
            }
            notified.await;
        }
    }

    async fn dispatch(&self, command: AgentCommand, agent: &Agent) -> Result<()> {
        let slots = self.slots.lock();
        let slot = slots
            .get(&agent.id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent.id)))?;
        if slot.agent.status == AgentStatus::Offline {
            return Err(Error::Unavailable(format!("agent {} is offline", agent.id)));
        }
        slot.commands
            .send(command)
            .map_err(|_| Error::Unavailable(format!("agent {} stopped listening", agent.id)))
    }

    async fn release(&self, agent_id: &str) -> Result<()> {
        {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
            slot.agent.job_id = None;
            if slot.agent.status == AgentStatus::Busy {
                slot.agent.status = AgentStatus::Idle;
            }
        }
        debug!(agent_id = %agent_id, "Agent released");
        self.available.notify_waiters();
        Ok(())
    }
}
