use async_trait::async_trait;
use tracing::debug;

use super::{
    PostgresMonitoringStore,
    rows::{AggregationRow, SessionRow, SourceRow, source_from_rows},
};
use crate::{
    error::{MonitorError, Result},
    persistence::ports::{AggregateRepository, SnapshotCommit},
    types::{Session, SessionStep, Source},
};

#[async_trait]
impl AggregateRepository for PostgresMonitoringStore {
    async fn find_source(&self, name: &str) -> Result<Option<Source>> {
        let Some(row) = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT name, nb_sessions, errors, waiting, running, last_update_date
            FROM sources
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let aggregations = sqlx::query_as::<_, AggregationRow>(
            r#"
            SELECT step_type, total_in, total_out, errors, waiting, running
            FROM source_step_aggregations
            WHERE source = $1
            "#,
        )
        .bind(&row.name)
        .fetch_all(&self.pool)
        .await?;

        source_from_rows(row, aggregations).map(Some)
    }

    async fn find_session(&self, source: &str, name: &str) -> Result<Option<Session>> {
        sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT source, name, errors, waiting, running, last_update_date, steps
            FROM sessions
            WHERE source = $1 AND name = $2
            "#,
        )
        .bind(source)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .map(Session::try_from)
        .transpose()
    }

    async fn commit(&self, commit: SnapshotCommit) -> Result<()> {
        let SnapshotCommit {
            sessions,
            source,
            process,
        } = commit;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Internal(format!("begin snapshot tx failed: {e}")))?;

        for session in &sessions {
            let steps: Vec<&SessionStep> = session.steps.values().collect();
            sqlx::query(
                r#"
                INSERT INTO sessions (source, name, errors, waiting, running, last_update_date, steps)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source, name)
                DO UPDATE SET
                    errors = EXCLUDED.errors,
                    waiting = EXCLUDED.waiting,
                    running = EXCLUDED.running,
                    last_update_date = EXCLUDED.last_update_date,
                    steps = EXCLUDED.steps
                "#,
            )
            .bind(&session.source)
            .bind(&session.name)
            .bind(session.manager_state.errors)
            .bind(session.manager_state.waiting)
            .bind(session.manager_state.running)
            .bind(session.last_update_date)
            .bind(serde_json::to_value(&steps)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| MonitorError::Internal(format!("session upsert failed: {e}")))?;
        }

        sqlx::query(
            r#"
            INSERT INTO sources (name, nb_sessions, errors, waiting, running, last_update_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name)
            DO UPDATE SET
                nb_sessions = EXCLUDED.nb_sessions,
                errors = EXCLUDED.errors,
                waiting = EXCLUDED.waiting,
                running = EXCLUDED.running,
                last_update_date = EXCLUDED.last_update_date
            "#,
        )
        .bind(&source.name)
        .bind(source.nb_sessions)
        .bind(source.manager_state.errors)
        .bind(source.manager_state.waiting)
        .bind(source.manager_state.running)
        .bind(source.last_update_date)
        .execute(&mut *tx)
        .await
        .map_err(|e| MonitorError::Internal(format!("source upsert failed: {e}")))?;

        for agg in source.steps.values() {
            sqlx::query(
                r#"
                INSERT INTO source_step_aggregations (
                    source, step_type, total_in, total_out, errors, waiting, running
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source, step_type)
                DO UPDATE SET
                    total_in = EXCLUDED.total_in,
                    total_out = EXCLUDED.total_out,
                    errors = EXCLUDED.errors,
                    waiting = EXCLUDED.waiting,
                    running = EXCLUDED.running
                "#,
            )
            .bind(&source.name)
            .bind(agg.step_type.as_str())
            .bind(agg.total_in)
            .bind(agg.total_out)
            .bind(agg.state.errors)
            .bind(agg.state.waiting)
            .bind(agg.state.running)
            .execute(&mut *tx)
            .await
            .map_err(|e| MonitorError::Internal(format!("aggregation upsert failed: {e}")))?;
        }

        // Only the watermark moves here; the marker belongs to the job runtime.
        sqlx::query(
            r#"
            INSERT INTO snapshot_processes (source, last_update_date)
            VALUES ($1, $2)
            ON CONFLICT (source)
            DO UPDATE SET last_update_date = EXCLUDED.last_update_date
            "#,
        )
        .bind(&process.source)
        .bind(process.last_update_date)
        .execute(&mut *tx)
        .await
        .map_err(|e| MonitorError::Internal(format!("watermark update failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| MonitorError::Internal(format!("snapshot tx commit failed: {e}")))?;

        debug!(
            target: "snapshot::store",
            source = %source.name,
            sessions = sessions.len(),
            "snapshot committed"
        );
        Ok(())
    }
}
