//! Step repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::ResourceId;
use flowline_core::step::Step;
use sqlx::PgPool;

use crate::repo::{decode_vars, encode_vars};
use crate::{DbError, DbResult};

#[async_trait]
pub trait StepRepo: Send + Sync {
    /// Insert a job's full step set in one batch.
    async fn insert_all(&self, steps: &[Step]) -> DbResult<()>;
    async fn get(&self, id: ResourceId) -> DbResult<Step>;
    /// Steps of a job in tree order.
    async fn list_by_job(&self, job_id: ResourceId) -> DbResult<Vec<Step>>;
    async fn save(&self, step: &Step) -> DbResult<()>;
    async fn delete_by_flow(&self, flow_id: ResourceId) -> DbResult<u64>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    pub id: uuid::Uuid,
    pub flow_id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub build_number: i64,
    pub node_path: String,
    pub position: i32,
    pub allow_failure: bool,
    pub post: bool,
    pub status: String,
    pub code: Option<i32>,
    pub process_id: Option<i32>,
    pub agent_id: Option<String>,
    pub error: Option<String>,
    pub log_size: i64,
    pub output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRecord> for Step {
    type Error = DbError;

    fn try_from(record: StepRecord) -> DbResult<Self> {
        let status = record
            .status
            .parse()
            .map_err(|e| DbError::Decode(format!("step {}: {}", record.id, e)))?;
        Ok(Step {
            id: record.id.into(),
            flow_id: record.flow_id.into(),
            job_id: record.job_id.into(),
            build_number: record.build_number.max(0) as u64,
            node_path: record.node_path,
            position: record.position.max(0) as u32,
            allow_failure: record.allow_failure,
            post: record.post,
            status,
            code: record.code,
            process_id: record.process_id,
            agent_id: record.agent_id,
            error: record.error,
            log_size: record.log_size,
            output: decode_vars(&record.output)?,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }
}

/// PostgreSQL implementation of StepRepo.
pub struct PgStepRepo {
    pool: PgPool,
}

impl PgStepRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepRepo for PgStepRepo {
    async fn insert_all(&self, steps: &[Step]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO steps (
                    id, flow_id, job_id, build_number, node_path, position, allow_failure,
                    post, status, log_size, output
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(step.id.as_uuid())
            .bind(step.flow_id.as_uuid())
            .bind(step.job_id.as_uuid())
            .bind(step.build_number as i64)
            .bind(&step.node_path)
            .bind(step.position as i32)
            .bind(step.allow_failure)
            .bind(step.post)
            .bind(step.status.as_str())
            .bind(step.log_size)
            .bind(encode_vars(&step.output)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::from_insert(e, format!("step {}", step.node_path)))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Step> {
        let record = sqlx::query_as::<_, StepRecord>("SELECT * FROM steps WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("step {}", id)))?;
        record.try_into()
    }

    async fn list_by_job(&self, job_id: ResourceId) -> DbResult<Vec<Step>> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM steps WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Step::try_from).collect()
    }

    async fn save(&self, step: &Step) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE steps SET
                status = $2, code = $3, process_id = $4, agent_id = $5, error = $6,
                log_size = $7, output = $8, started_at = $9, finished_at = $10
            WHERE id = $1
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.code)
        .bind(step.process_id)
        .bind(&step.agent_id)
        .bind(&step.error)
        .bind(step.log_size)
        .bind(encode_vars(&step.output)?)
        .bind(step.started_at)
        .bind(step.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("step {}", step.id)));
        }
        Ok(())
    }

    async fn delete_by_flow(&self, flow_id: ResourceId) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM steps WHERE flow_id = $1")
            .bind(flow_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
