use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    PostgresMonitoringStore,
    rows::{STEP_COLUMNS, StepRow},
};
use crate::{
    error::{MonitorError, Result},
    persistence::ports::{SessionStepRepository, StepCursor, StepWindow},
    types::SessionStep,
};

#[async_trait]
impl SessionStepRepository for PostgresMonitoringStore {
    async fn find_in_window(
        &self,
        source: &str,
        window: StepWindow,
        cursor: Option<&StepCursor>,
        limit: usize,
    ) -> Result<Vec<SessionStep>> {
        let sql = format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM session_steps
            WHERE source = $1
              AND ($2::timestamptz IS NULL OR last_update_date > $2)
              AND last_update_date <= $3
              AND ($4::timestamptz IS NULL
                   OR (last_update_date, session, step_type) > ($4, $5::text, $6::text))
            ORDER BY last_update_date ASC, session ASC, step_type ASC
            LIMIT $7
            "#
        );

        let rows = sqlx::query_as::<_, StepRow>(&sql)
            .bind(source)
            .bind(window.after)
            .bind(window.before)
            .bind(cursor.map(|c| c.last_update_date))
            .bind(cursor.map(|c| c.session.as_str()))
            .bind(cursor.map(|c| c.step_type.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MonitorError::Internal(format!("step window query failed: {e}")))?;

        rows.into_iter().map(SessionStep::try_from).collect()
    }

    async fn count_registered_between(
        &self,
        source: &str,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint
            FROM session_steps
            WHERE source = $1
              AND ($2::timestamptz IS NULL OR registration_date > $2)
              AND registration_date < $3
            "#,
        )
        .bind(source)
        .bind(after)
        .bind(before)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("step eligibility count failed: {e}")))?;

        Ok(count.max(0) as u64)
    }

    async fn upsert(&self, step: SessionStep) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Internal(format!("begin step upsert tx failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO session_steps (
                source, session, step_type, input_related, output_related,
                errors, waiting, running, last_update_date, registration_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source, session, step_type)
            DO UPDATE SET
                input_related = EXCLUDED.input_related,
                output_related = EXCLUDED.output_related,
                errors = EXCLUDED.errors,
                waiting = EXCLUDED.waiting,
                running = EXCLUDED.running,
                last_update_date = EXCLUDED.last_update_date,
                registration_date = EXCLUDED.registration_date
            "#,
        )
        .bind(&step.source)
        .bind(&step.session)
        .bind(step.step_type.as_str())
        .bind(step.input_related)
        .bind(step.output_related)
        .bind(step.state.errors)
        .bind(step.state.waiting)
        .bind(step.state.running)
        .bind(step.last_update_date)
        .bind(step.registration_date)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO snapshot_processes (source)
            VALUES ($1)
            ON CONFLICT (source) DO NOTHING
            "#,
        )
        .bind(&step.source)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| MonitorError::Internal(format!("step upsert tx commit failed: {e}")))?;
        Ok(())
    }

    async fn delete_folded_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM session_steps s
            USING snapshot_processes p
            WHERE p.source = s.source
              AND p.last_update_date IS NOT NULL
              AND s.last_update_date <= p.last_update_date
              AND s.last_update_date < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
