//! Job records and the job status model.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::flow::job_queue_name;
use crate::{Error, ResourceId};

/// Ordered string variables, shared by the job context and step outputs.
pub type Vars = IndexMap<String, String>;

/// Well-known job context variable names.
pub mod vars {
    pub const FLOW_ID: &str = "FLOWLINE_FLOW_ID";
    pub const FLOW_NAME: &str = "FLOWLINE_FLOW_NAME";
    pub const JOB_BUILD_NUMBER: &str = "FLOWLINE_JOB_BUILD_NUMBER";
    pub const JOB_TRIGGER: &str = "FLOWLINE_JOB_TRIGGER";
    pub const JOB_STATUS: &str = "FLOWLINE_JOB_STATUS";
    pub const JOB_START_AT: &str = "FLOWLINE_JOB_START_AT";
    pub const JOB_FINISH_AT: &str = "FLOWLINE_JOB_FINISH_AT";
    pub const JOB_DURATION: &str = "FLOWLINE_JOB_DURATION";
}

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 255;

/// Default maximum run duration, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
/// Default maximum queued-wait duration, in seconds.
pub const DEFAULT_EXPIRE_SECS: u64 = 1800;

/// Upper bound for any job duration setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job record and build number allocated.
    Created,
    /// Pipeline definition being fetched.
    Loading,
    /// Waiting on the flow queue.
    Queued,
    /// Steps being executed by an agent.
    Running,
    /// Kill sent to the agent, waiting for confirmation.
    Cancelling,
    Cancelled,
    Timeout,
    Success,
    Failure,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Cancelled,
        JobStatus::Timeout,
        JobStatus::Success,
        JobStatus::Failure,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Loading => "LOADING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "LOADING" => Ok(JobStatus::Loading),
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "CANCELLING" => Ok(JobStatus::Cancelling),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// What started a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Manual,
    Api,
    Scheduler,
    Push,
    PrOpened,
    PrMerged,
    Tag,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "MANUAL",
            Trigger::Api => "API",
            Trigger::Scheduler => "SCHEDULER",
            Trigger::Push => "PUSH",
            Trigger::PrOpened => "PR_OPENED",
            Trigger::PrMerged => "PR_MERGED",
            Trigger::Tag => "TAG",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(Trigger::Manual),
            "API" => Ok(Trigger::Api),
            "SCHEDULER" => Ok(Trigger::Scheduler),
            "PUSH" => Ok(Trigger::Push),
            "PR_OPENED" => Ok(Trigger::PrOpened),
            "PR_MERGED" => Ok(Trigger::PrMerged),
            "TAG" => Ok(Trigger::Tag),
            other => Err(Error::InvalidInput(format!("unknown trigger: {}", other))),
        }
    }
}

/// A single build of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub flow_id: ResourceId,
    /// Monotonic per flow.
    pub build_number: u64,
    pub status: JobStatus,
    /// Human-readable reason for the current status.
    pub message: Option<String>,
    pub trigger: Trigger,
    pub priority: u8,
    pub created_by: Option<String>,
    /// Agent the job was dispatched to.
    pub agent_id: Option<String>,
    /// Node path the job is currently executing, used for resumption.
    pub current_path: Option<String>,
    pub context: Vars,
    /// Raw pipeline definition the step tree is parsed from.
    pub definition: String,
    /// Maximum run duration, in seconds.
    pub timeout_secs: u64,
    /// Maximum queued-wait duration, in seconds.
    pub expire_secs: u64,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        flow_id: ResourceId,
        build_number: u64,
        trigger: Trigger,
        definition: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            flow_id,
            build_number,
            status: JobStatus::Created,
            message: None,
            trigger,
            priority: MIN_PRIORITY,
            created_by: None,
            agent_id: None,
            current_path: None,
            context: Vars::new(),
            definition: definition.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            expire_secs: DEFAULT_EXPIRE_SECS,
            expire_at: deadline(now, DEFAULT_EXPIRE_SECS),
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Set the queued-wait budget; the deadline counts from creation.
    pub fn with_expire(mut self, expire_secs: u64) -> Self {
        self.expire_secs = expire_secs;
        self.expire_at = deadline(self.created_at, expire_secs);
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(MIN_PRIORITY);
        self
    }

    /// Composite key `{flow_id}:{build_number}`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.flow_id, self.build_number)
    }

    /// Name of the flow queue this job is enqueued on.
    pub fn queue_name(&self) -> String {
        job_queue_name(&self.flow_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Wall time between start and finish, zero when either is missing.
    pub fn duration_secs(&self) -> i64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(finish)) => (finish - start).num_seconds().max(0),
            _ => 0,
        }
    }

    /// Refresh status and timing variables in the job context.
    pub fn sync_context(&mut self) {
        self.context
            .insert(vars::JOB_STATUS.to_string(), self.status.to_string());
        self.context
            .insert(vars::JOB_START_AT.to_string(), format_time(self.started_at));
        self.context
            .insert(vars::JOB_FINISH_AT.to_string(), format_time(self.finished_at));
        self.context.insert(
            vars::JOB_DURATION.to_string(),
            self.duration_secs().to_string(),
        );
    }
}

/// `from + secs`, saturating at the latest representable time.
fn deadline(from: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_default()
}
