//! Flows: named pipelines that own a job queue.

use serde::{Deserialize, Serialize};

use uuid::Uuid;

use crate::ResourceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: ResourceId,
    pub name: String,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            name: name.into(),
        }
    }

    /// Flow with an id derived from its name, stable across restarts.
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: ResourceId::derived(&ResourceId::from(Uuid::nil()), &name),
            name,
        }
    }

    pub fn queue_name(&self) -> String {
        job_queue_name(&self.id)
    }
}

/// Name of the dedicated job queue for a flow.
pub fn job_queue_name(flow_id: &ResourceId) -> String {
    format!("flow.q.{}.job", flow_id)
}
