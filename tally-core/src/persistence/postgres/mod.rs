//! Postgres adapters for the monitoring repositories.
//!
//! One [`PostgresMonitoringStore`] serves the step store, the snapshot
//! process table and the session/source aggregates of a single tenant
//! database. Queries are runtime-checked (`query_as` + `FromRow`) so the
//! crate builds without a live database.

mod aggregates;
mod processes;
mod rows;
mod steps;

use std::fmt;

use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::error::{MonitorError, Result};

#[derive(Clone)]
pub struct PostgresMonitoringStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresMonitoringStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresMonitoringStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresMonitoringStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open a pool for a tenant database and verify it answers.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| MonitorError::Internal(format!("failed to connect to Postgres: {e}")))?;

    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("Postgres health check failed: {e}")))?;
    info!(target: "snapshot::store", "connected to Postgres");

    Ok(pool)
}

/// Apply the bundled migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    crate::MIGRATOR
        .run(pool)
        .await
        .map_err(|e| MonitorError::Internal(format!("migration failed: {e}")))
}
