use async_trait::async_trait;

use super::{PostgresMonitoringStore, rows::ProcessRow};
use crate::{
    error::{MonitorError, Result},
    jobs::JobId,
    persistence::ports::SnapshotProcessRepository,
    types::SnapshotProcess,
};

#[async_trait]
impl SnapshotProcessRepository for PostgresMonitoringStore {
    async fn find_idle(&self, after_source: Option<&str>, limit: usize) -> Result<Vec<SnapshotProcess>> {
        let rows = sqlx::query_as::<_, ProcessRow>(
            r#"
            SELECT source, last_update_date, job_id
            FROM snapshot_processes
            WHERE job_id IS NULL
              AND ($1::text IS NULL OR source > $1)
            ORDER BY source ASC
            LIMIT $2
            "#,
        )
        .bind(after_source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("idle process scan failed: {e}")))?;

        Ok(rows.into_iter().map(SnapshotProcess::from).collect())
    }

    async fn find_running(&self, after_source: Option<&str>, limit: usize) -> Result<Vec<SnapshotProcess>> {
        let rows = sqlx::query_as::<_, ProcessRow>(
            r#"
            SELECT source, last_update_date, job_id
            FROM snapshot_processes
            WHERE job_id IS NOT NULL
              AND ($1::text IS NULL OR source > $1)
            ORDER BY source ASC
            LIMIT $2
            "#,
        )
        .bind(after_source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("running process scan failed: {e}")))?;

        Ok(rows.into_iter().map(SnapshotProcess::from).collect())
    }

    async fn find_by_source(&self, source: &str) -> Result<Option<SnapshotProcess>> {
        let row = sqlx::query_as::<_, ProcessRow>(
            "SELECT source, last_update_date, job_id FROM snapshot_processes WHERE source = $1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SnapshotProcess::from))
    }

    async fn save(&self, process: &SnapshotProcess) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshot_processes (source, last_update_date, job_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (source)
            DO UPDATE SET
                last_update_date = EXCLUDED.last_update_date,
                job_id = EXCLUDED.job_id
            "#,
        )
        .bind(&process.source)
        .bind(process.last_update_date)
        .bind(process.job_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_running(&self, source: &str, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE snapshot_processes SET job_id = $2 WHERE source = $1 AND job_id IS NULL",
        )
        .bind(source)
        .bind(job_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("marker write failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_job(&self, source: &str, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE snapshot_processes SET job_id = NULL WHERE source = $1 AND job_id = $2",
        )
        .bind(source)
        .bind(job_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("marker clear failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }
}
