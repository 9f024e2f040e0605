//! Step records: one per pipeline node per job run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::job::Vars;
use crate::pipeline::StepNode;
use crate::{Error, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Exception,
    Killed,
    Timeout,
    Skipped,
}

impl StepStatus {
    pub const ONGOING: [StepStatus; 2] = [StepStatus::Pending, StepStatus::Running];

    pub const FAILURE: [StepStatus; 4] = [
        StepStatus::Failure,
        StepStatus::Exception,
        StepStatus::Killed,
        StepStatus::Timeout,
    ];

    pub fn is_ongoing(&self) -> bool {
        Self::ONGOING.contains(self)
    }

    pub fn is_failure(&self) -> bool {
        Self::FAILURE.contains(self)
    }

    pub fn is_finished(&self) -> bool {
        !self.is_ongoing()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Failure => "FAILURE",
            StepStatus::Exception => "EXCEPTION",
            StepStatus::Killed => "KILLED",
            StepStatus::Timeout => "TIMEOUT",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "RUNNING" => Ok(StepStatus::Running),
            "SUCCESS" => Ok(StepStatus::Success),
            "FAILURE" => Ok(StepStatus::Failure),
            "EXCEPTION" => Ok(StepStatus::Exception),
            "KILLED" => Ok(StepStatus::Killed),
            "TIMEOUT" => Ok(StepStatus::Timeout),
            "SKIPPED" => Ok(StepStatus::Skipped),
            other => Err(Error::InvalidInput(format!("unknown step status: {}", other))),
        }
    }
}

/// Execution state of one pipeline node within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Derived from the job id and node path, so it is stable across reloads.
    pub id: ResourceId,
    pub flow_id: ResourceId,
    pub job_id: ResourceId,
    pub build_number: u64,
    pub node_path: String,
    /// Position in tree order.
    pub position: u32,
    pub allow_failure: bool,
    pub post: bool,
    pub status: StepStatus,
    pub code: Option<i32>,
    pub process_id: Option<i32>,
    pub agent_id: Option<String>,
    pub error: Option<String>,
    pub log_size: i64,
    pub output: Vars,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn id_for(job_id: &ResourceId, node_path: &str) -> ResourceId {
        ResourceId::derived(job_id, node_path)
    }

    pub fn new(
        flow_id: ResourceId,
        job_id: ResourceId,
        build_number: u64,
        position: u32,
        node: &StepNode,
    ) -> Self {
        Self {
            id: Self::id_for(&job_id, &node.path),
            flow_id,
            job_id,
            build_number,
            node_path: node.path.clone(),
            position,
            allow_failure: node.allow_failure,
            post: node.post,
            status: StepStatus::Pending,
            code: None,
            process_id: None,
            agent_id: None,
            error: None,
            log_size: -1,
            output: Vars::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Succeeded, or failed in a way the pipeline tolerates.
    pub fn is_success(&self) -> bool {
        matches!(self.status, StepStatus::Success | StepStatus::Skipped)
            || (self.status.is_failure() && self.allow_failure)
    }

    pub fn is_ongoing(&self) -> bool {
        self.status.is_ongoing()
    }
}

/// Result of a step execution as reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub step_id: ResourceId,
    pub status: StepStatus,
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub process_id: Option<i32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default = "unknown_log_size")]
    pub log_size: i64,
    #[serde(default)]
    pub output: Vars,
    #[serde(default)]
    pub error: Option<String>,
}

fn unknown_log_size() -> i64 {
    -1
}

impl ExecResult {
    pub fn new(step_id: ResourceId, status: StepStatus) -> Self {
        Self {
            step_id,
            status,
            code: None,
            process_id: None,
            started_at: None,
            finished_at: None,
            log_size: -1,
            output: Vars::new(),
            error: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.output.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
