//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::ResourceId;
use flowline_core::job::Job;
use sqlx::PgPool;

use crate::repo::{decode_vars, encode_vars};
use crate::{DbError, DbResult};

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Allocate the next build number for a flow. Numbers start at 1.
    async fn next_build_number(&self, flow_id: ResourceId) -> DbResult<u64>;
    async fn insert(&self, job: &Job) -> DbResult<()>;
    async fn get(&self, id: ResourceId) -> DbResult<Job>;
    async fn get_by_key(&self, flow_id: ResourceId, build_number: u64) -> DbResult<Job>;
    async fn save(&self, job: &Job) -> DbResult<()>;
    /// Newest first.
    async fn list_by_flow(&self, flow_id: ResourceId, limit: i64) -> DbResult<Vec<Job>>;
    /// Remove every job and the build number counter of a flow.
    async fn delete_by_flow(&self, flow_id: ResourceId) -> DbResult<u64>;
}

/// A job row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub flow_id: uuid::Uuid,
    pub build_number: i64,
    pub status: String,
    pub message: Option<String>,
    pub trigger: String,
    pub priority: i16,
    pub created_by: Option<String>,
    pub agent_id: Option<String>,
    pub current_path: Option<String>,
    pub context: String,
    pub definition: String,
    pub timeout_secs: i64,
    pub expire_secs: i64,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> DbResult<Self> {
        let decode = |e: flowline_core::Error| DbError::Decode(format!("job {}: {}", record.id, e));
        Ok(Job {
            id: record.id.into(),
            flow_id: record.flow_id.into(),
            build_number: record.build_number.max(0) as u64,
            status: record.status.parse().map_err(decode)?,
            message: record.message,
            trigger: record.trigger.parse().map_err(decode)?,
            priority: record.priority.clamp(1, 255) as u8,
            created_by: record.created_by,
            agent_id: record.agent_id,
            current_path: record.current_path,
            context: decode_vars(&record.context)?,
            definition: record.definition,
            timeout_secs: record.timeout_secs.max(0) as u64,
            expire_secs: record.expire_secs.max(0) as u64,
            expire_at: record.expire_at,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn next_build_number(&self, flow_id: ResourceId) -> DbResult<u64> {
        let (value,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO job_numbers (flow_id, value) VALUES ($1, 1)
            ON CONFLICT (flow_id) DO UPDATE SET value = job_numbers.value + 1
            RETURNING value
            "#,
        )
        .bind(flow_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(value as u64)
    }

    async fn insert(&self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, flow_id, build_number, status, message, trigger, priority, created_by,
                agent_id, current_path, context, definition, timeout_secs, expire_secs,
                expire_at, created_at, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.flow_id.as_uuid())
        .bind(job.build_number as i64)
        .bind(job.status.as_str())
        .bind(&job.message)
        .bind(job.trigger.as_str())
        .bind(job.priority as i16)
        .bind(&job.created_by)
        .bind(&job.agent_id)
        .bind(&job.current_path)
        .bind(encode_vars(&job.context)?)
        .bind(&job.definition)
        .bind(job.timeout_secs as i64)
        .bind(job.expire_secs as i64)
        .bind(job.expire_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, format!("job {}", job.key())))?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.try_into()
    }

    async fn get_by_key(&self, flow_id: ResourceId, build_number: u64) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE flow_id = $1 AND build_number = $2",
        )
        .bind(flow_id.as_uuid())
        .bind(build_number as i64)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}:{}", flow_id, build_number)))?;
        record.try_into()
    }

    async fn save(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2, message = $3, priority = $4, agent_id = $5, current_path = $6,
                context = $7, started_at = $8, finished_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.message)
        .bind(job.priority as i16)
        .bind(&job.agent_id)
        .bind(&job.current_path)
        .bind(encode_vars(&job.context)?)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn list_by_flow(&self, flow_id: ResourceId, limit: i64) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE flow_id = $1 ORDER BY build_number DESC LIMIT $2",
        )
        .bind(flow_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn delete_by_flow(&self, flow_id: ResourceId) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE flow_id = $1")
            .bind(flow_id.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM job_numbers WHERE flow_id = $1")
            .bind(flow_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }
}
