//! Job dispatch and lifecycle engine for Flowline.
//!
//! Moves jobs through their state machine, feeds per-flow queues to agents,
//! applies step results reported back by agents, and times out jobs whose
//! queued wait expired. Queues run in memory or on PostgreSQL with SKIP
//! LOCKED claiming.

pub mod agent;
pub mod callback;
pub mod error;
pub mod lock;
pub mod machine;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod service;
pub mod steps;
pub mod timeout;
pub mod worker;

pub use agent::LocalAgentPool;
pub use error::{SchedulerError, SchedulerResult};
pub use machine::{DispatchOutcome, StateMachine};
pub use queue::{Broker, Delivery, MemoryBroker, PgBroker, PublishOptions};
pub use registry::FlowQueueRegistry;
pub use service::{Collaborators, JobService};
pub use steps::StepManager;
