//! Scheduler error types.

use flowline_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Core(#[from] flowline_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("cannot decode message: {0}")]
    Decode(String),

    #[error("invalid status: {0}")]
    Status(String),
}

impl SchedulerError {
    /// Whether the error means a job, step or agent no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            SchedulerError::Db(e) => e.is_not_found(),
            SchedulerError::Core(e) => e.is_not_found(),
            SchedulerError::Database(sqlx::Error::RowNotFound) => true,
            _ => false,
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
