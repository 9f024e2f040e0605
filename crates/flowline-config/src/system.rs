//! System configuration parsing.

use flowline_core::job::MAX_DURATION_SECS;
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::node::{get_string_prop, get_uint_prop};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration for the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub database: DatabaseConfig,
    pub job: JobConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; `None` selects the in-memory stores and broker.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Defaults applied to newly created jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub timeout_secs: u64,
    pub expire_secs: u64,
    pub priority: u8,
    /// How long a cancelled job may wait for kill confirmation; 0 waits forever.
    pub cancel_timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            expire_secs: 1800,
            priority: 1,
            cancel_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub callback: String,
    pub dead_letter: String,
    /// Poll interval of the database-backed broker, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            callback: "flow.q.callback".to_string(),
            dead_letter: "flow.q.job.dl".to_string(),
            poll_interval_ms: 1000,
        }
    }
}

/// Sizes of the bounded background pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub create: usize,
    pub delete: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            create: 4,
            delete: 2,
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                config.database.url = get_string_prop(node, "url").filter(|u| !u.is_empty());
                if let Some(n) = get_uint_prop(node, "max-connections", u32::MAX as u64)? {
                    config.database.max_connections = n as u32;
                }
            }
            "job" => {
                let job = &mut config.job;
                if let Some(n) = get_uint_prop(node, "timeout", MAX_DURATION_SECS)? {
                    job.timeout_secs = n;
                }
                if let Some(n) = get_uint_prop(node, "expire", MAX_DURATION_SECS)? {
                    job.expire_secs = n;
                }
                if let Some(n) = get_uint_prop(node, "priority", u8::MAX as u64)? {
                    if n == 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "job priority".to_string(),
                            message: "priority starts at 1".to_string(),
                        });
                    }
                    job.priority = n as u8;
                }
                if let Some(n) = get_uint_prop(node, "cancel-timeout", MAX_DURATION_SECS)? {
                    job.cancel_timeout_secs = n;
                }
            }
            "queue" => {
                if let Some(name) = get_string_prop(node, "callback") {
                    config.queue.callback = name;
                }
                if let Some(name) = get_string_prop(node, "dead-letter") {
                    config.queue.dead_letter = name;
                }
                if let Some(n) = get_uint_prop(node, "poll-interval", u32::MAX as u64)? {
                    config.queue.poll_interval_ms = n.max(1);
                }
            }
            "workers" => {
                if let Some(n) = get_uint_prop(node, "create", u16::MAX as u64)? {
                    config.workers.create = (n as usize).max(1);
                }
                if let Some(n) = get_uint_prop(node, "delete", u16::MAX as u64)? {
                    config.workers.delete = (n as usize).max(1);
                }
            }
            other => {
                tracing::warn!(node = other, "ignoring unknown system config node");
            }
        }
    }

    if config.queue.callback == config.queue.dead_letter {
        return Err(ConfigError::InvalidValue {
            field: "queue dead-letter".to_string(),
            message: "must differ from the callback queue".to_string(),
        });
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    tracing::debug!(path = %path.display(), "loaded system config");
    parse_system_config(&text)
}
