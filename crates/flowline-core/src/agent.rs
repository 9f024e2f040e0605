//! Agent directory contract and agent commands.
//!
//! Agents are remote processes that execute pipeline steps. The engine only
//! needs to find an agent for a job, send it commands, and learn when it goes
//! away.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::{Job, Vars};
use crate::{ResourceId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Offline,
    Idle,
    Busy,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
        };
        f.write_str(name)
    }
}

/// Snapshot of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    /// Job the agent is bound to, if any.
    pub job_id: Option<ResourceId>,
}

impl Agent {
    pub fn is_online(&self) -> bool {
        self.status != AgentStatus::Offline
    }

    pub fn is_busy(&self) -> bool {
        self.status == AgentStatus::Busy
    }
}

/// Instruction to run one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommand {
    pub job_id: ResourceId,
    pub step_id: ResourceId,
    pub node_path: String,
    pub image: Option<String>,
    pub commands: Vec<String>,
    /// Job context merged with the step's own env.
    pub inputs: Vars,
    /// Job timeout in seconds.
    pub timeout_secs: u64,
}

/// Commands sent to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    Run(RunCommand),
    Kill { job_id: ResourceId },
}

/// Lookup and command channel for execution agents.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Get the current snapshot of an agent.
    async fn get(&self, agent_id: &str) -> Result<Agent>;

    /// Wait until an agent can take the job, then bind it to the job.
    async fn acquire(&self, job: &Job) -> Result<Agent>;

    /// Send a command to an agent.
    async fn dispatch(&self, command: AgentCommand, agent: &Agent) -> Result<()>;

    /// Unbind an agent from its job and return it to the idle set.
    async fn release(&self, agent_id: &str) -> Result<()>;
}
