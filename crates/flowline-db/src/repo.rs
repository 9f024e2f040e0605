//! Repository traits and PostgreSQL implementations.

pub mod job;
pub mod step;

pub use job::{JobRepo, PgJobRepo};
pub use step::{PgStepRepo, StepRepo};

use flowline_core::job::Vars;

use crate::{DbError, DbResult};

pub(crate) fn encode_vars(vars: &Vars) -> DbResult<String> {
    serde_json::to_string(vars).map_err(|e| DbError::Decode(e.to_string()))
}

pub(crate) fn decode_vars(raw: &str) -> DbResult<Vars> {
    serde_json::from_str(raw).map_err(|e| DbError::Decode(e.to_string()))
}
