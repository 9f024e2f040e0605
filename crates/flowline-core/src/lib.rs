//! Core domain types and traits for the Flowline job orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and the core error type
//! - Job and step records with their status models
//! - The pipeline step tree and parser contract
//! - The agent directory contract and agent commands
//! - Domain events and the in-process event bus

pub mod agent;
pub mod error;
pub mod event;
pub mod flow;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod step;

pub use error::{Error, Result};
pub use id::ResourceId;
