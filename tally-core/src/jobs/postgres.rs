//! Durable job queue backed by Postgres.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{MonitorError, Result},
    jobs::{
        job::{JobId, JobKind, JobOutcome, JobPayload, JobPriority, JobRecord, JobRequest, JobState},
        queue::{JobLease, JobQueue, JobRuntime},
    },
};

const JOB_COLUMNS: &str = "id, payload, priority, state, attempts, lease_owner, \
     lease_expires_at, cancel_requested, last_error, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    priority: i16,
    state: String,
    attempts: i32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = MonitorError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload: JobPayload = serde_json::from_value(row.payload).map_err(|e| {
            MonitorError::Internal(format!("failed to deserialize job payload: {e}"))
        })?;
        let priority = JobPriority::from_i16(row.priority).ok_or_else(|| {
            MonitorError::Internal(format!("invalid priority {}", row.priority))
        })?;

        Ok(JobRecord {
            id: JobId(row.id),
            payload,
            priority,
            state: row.state.parse()?,
            attempts: row.attempts.clamp(0, i32::from(u16::MAX)) as u16,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            cancel_requested: row.cancel_requested,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl fmt::Debug for PostgresJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresJobQueue {
    /// Create the queue and verify the schema is in place.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_jobs_queued_dequeue")
        .fetch_optional(&pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("job queue schema validation failed: {e}")))?
        .is_some();

        if !idx_exists {
            return Err(MonitorError::Internal(
                "Required index idx_jobs_queued_dequeue is missing; run migrations".into(),
            ));
        }
        info!(target: "jobs::queue", "job queue connected to Postgres");

        Ok(Self { pool })
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }
}

#[async_trait]
impl JobRuntime for PostgresJobQueue {
    async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let record = JobRecord::new(request);
        let payload = serde_json::to_value(&record.payload)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, payload, priority, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            "#,
        )
        .bind(record.id.0)
        .bind(record.kind().as_str())
        .bind(payload)
        .bind(record.priority as u8 as i16)
        .bind(JobState::Queued.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("job insert failed: {e}")))?;

        debug!(target: "jobs::queue", job_id = %record.id, kind = %record.kind(), "job queued");
        Ok(record.id)
    }

    async fn count_by_kind_and_state(&self, kind: JobKind, states: &[JobState]) -> Result<u64> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM jobs WHERE kind = $1 AND state = ANY($2)",
        )
        .bind(kind.as_str())
        .bind(&states)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("job count query failed: {e}")))?;
        Ok(count.max(0) as u64)
    }

    async fn job_state(&self, id: JobId) -> Result<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        state.map(|s| s.parse()).transpose()
    }

    async fn cancel(&self, id: JobId) -> Result<Option<JobState>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Internal(format!("begin cancel tx failed: {e}")))?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(None);
        };

        let state = match current.parse::<JobState>()? {
            JobState::Queued => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'cancelled', last_error = 'cancelled before start', updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
                JobState::Cancelled
            }
            JobState::Running => {
                sqlx::query("UPDATE jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1")
                    .bind(id.0)
                    .execute(&mut *tx)
                    .await?;
                JobState::Running
            }
            terminal => terminal,
        };

        tx.commit()
            .await
            .map_err(|e| MonitorError::Internal(format!("cancel tx commit failed: {e}")))?;
        Ok(Some(state))
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn lease_next(&self, worker_id: &str, ttl: chrono::Duration) -> Result<Option<JobLease>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Internal(format!("begin dequeue tx failed: {e}")))?;

        let next: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE state = 'queued'
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| MonitorError::Internal(format!("dequeue select failed: {e}")))?;

        let Some(id) = next else {
            // rollback implicit
            return Ok(None);
        };

        let expires_at = Utc::now() + ttl;
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'running',
                attempts = attempts + 1,
                lease_owner = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND state = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(expires_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| MonitorError::Internal(format!("dequeue update->running failed: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = JobRecord::try_from(row)?;

        tx.commit()
            .await
            .map_err(|e| MonitorError::Internal(format!("dequeue tx commit failed: {e}")))?;

        Ok(Some(JobLease {
            job,
            worker_id: worker_id.to_string(),
            expires_at,
        }))
    }

    async fn renew(&self, id: JobId, worker_id: &str, ttl: chrono::Duration) -> Result<DateTime<Utc>> {
        let expires_at = Utc::now() + ttl;
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3, updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(MonitorError::NotFound(format!("no running lease for job {id}")));
        }
        Ok(expires_at)
    }

    async fn finish(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = $2,
                last_error = $3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .bind(outcome.state().as_str())
            .bind(outcome.error())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MonitorError::Internal(format!("job finish failed: {e}")))?;

        match row {
            Some(row) => JobRecord::try_from(row),
            None => match self.job_state(id).await? {
                Some(state) => Err(MonitorError::Conflict(format!(
                    "job {id} is {state} and cannot be finished"
                ))),
                None => Err(MonitorError::NotFound(format!("job {id}"))),
            },
        }
    }

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn expire_stale_leases(&self) -> Result<Vec<JobRecord>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'failed',
                last_error = 'lease expired',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE state = 'running'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < NOW()
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MonitorError::Internal(format!("expire stale leases failed: {e}")))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('succeeded', 'failed', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("purge finished jobs failed: {e}")))?;
        Ok(result.rows_affected())
    }
}
