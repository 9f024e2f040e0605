//! KDL configuration parsing for Flowline.
//!
//! This crate handles parsing of:
//! - Pipeline definitions into a step tree
//! - System configuration for the daemon

pub mod error;
mod node;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{KdlPipelineParser, parse_pipeline};
pub use system::{SystemConfig, load_system_config, parse_system_config};
