use std::sync::Arc;

use anyhow::Context;
use tally_config::Config;
use tally_core::{
    jobs::JobWorkerPool,
    lease::{InMemoryLeaseService, LeaseService, RedisLeaseService},
    persistence::postgres,
    snapshot::{SnapshotJobDispatcher, SnapshotMarkerReleaser},
    tenant::{StaticTenantDirectory, TenantContext},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How tenant stores are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Postgres { migrate: bool },
    InMemory,
}

/// Build one context per configured tenant.
pub async fn tenant_directory(config: &Config, mode: StoreMode) -> anyhow::Result<StaticTenantDirectory> {
    let mut directory = StaticTenantDirectory::new();

    for tenant in &config.tenants {
        let context = match mode {
            StoreMode::InMemory => TenantContext::in_memory(tenant.name.as_str()).context,
            StoreMode::Postgres { migrate } => {
                let url = config
                    .tenant_database_url(tenant)
                    .with_context(|| format!("no database URL configured for tenant {}", tenant.name))?;
                let pool = postgres::connect(url, config.database.max_connections)
                    .await
                    .with_context(|| format!("failed to connect database for tenant {}", tenant.name))?;
                if migrate {
                    postgres::migrate(&pool)
                        .await
                        .with_context(|| format!("failed to migrate database for tenant {}", tenant.name))?;
                    info!(tenant = %tenant.name, "migrations applied");
                }
                TenantContext::postgres(tenant.name.as_str(), pool)
                    .await
                    .with_context(|| format!("failed to prepare job queue for tenant {}", tenant.name))?
            }
        };
        directory.insert(context);
    }

    info!(tenants = directory.len(), mode = ?mode, "tenant contexts ready");
    Ok(directory)
}

/// Redis when configured, otherwise a process-local lease.
pub async fn lease_service(config: &Config) -> anyhow::Result<Arc<dyn LeaseService>> {
    match &config.redis {
        Some(redis) => {
            let service = RedisLeaseService::new(&redis.url)
                .await
                .context("failed to connect to Redis for scheduling leases")?;
            info!("using Redis scheduling leases");
            Ok(Arc::new(service))
        }
        None => {
            warn!("no Redis configured; scheduling leases only exclude ticks within this process");
            Ok(Arc::new(InMemoryLeaseService::new()))
        }
    }
}

/// Worker pool running snapshot and cleanup jobs for one tenant.
pub fn worker_pool(context: &TenantContext, config: &Config, shutdown: &CancellationToken) -> JobWorkerPool {
    let dispatcher = Arc::new(SnapshotJobDispatcher::new(context, &config.snapshot));
    let releaser = Arc::new(SnapshotMarkerReleaser::new(
        context.tenant.clone(),
        context.processes.clone(),
    ));

    JobWorkerPool::builder(context.tenant.clone(), context.queue.clone(), dispatcher)
        .with_config(config.jobs)
        .with_listener(releaser)
        .with_shutdown(shutdown)
        .build()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tally_config::{ConfigLoader, TenantConfig, models::sources::EnvConfig};
    use tally_core::{
        jobs::{JobKind, JobState},
        persistence::SessionStepRepository,
        snapshot::{SnapshotScheduler, TenantTickOutcome},
        types::{SessionStep, StepType},
    };

    use super::*;

    fn config(tenants: &[&str]) -> Config {
        let mut config = ConfigLoader::new()
            .with_env(EnvConfig::default())
            .load()
            .unwrap()
            .config;
        config.tenants = tenants.iter().map(|name| TenantConfig::new(*name)).collect();
        config
    }

    #[tokio::test]
    async fn in_memory_directory_has_one_context_per_tenant() {
        let directory = tenant_directory(&config(&["acme", "beta"]), StoreMode::InMemory)
            .await
            .unwrap();
        let names: Vec<_> = directory.contexts().map(|c| c.tenant.to_string()).collect();
        assert_eq!(names, ["acme", "beta"]);
    }

    #[tokio::test]
    async fn missing_database_url_is_reported_per_tenant() {
        let err = tenant_directory(&config(&["acme"]), StoreMode::Postgres { migrate: false })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tenant acme"));
    }

    #[tokio::test]
    async fn wired_pool_runs_scheduled_snapshots_and_releases_markers() {
        let config = config(&["acme"]);
        let tenant = TenantContext::in_memory("acme");
        let directory = Arc::new(StaticTenantDirectory::new().with_tenant(tenant.context.clone()));
        let shutdown = CancellationToken::new();
        let pool = worker_pool(&tenant.context, &config, &shutdown);

        let registered = Utc::now() - Duration::minutes(5);
        tenant
            .store
            .upsert(SessionStep::new("S1", "session-1", StepType::Ingestion, registered).with_counts(3, 0))
            .await
            .unwrap();

        let scheduler = SnapshotScheduler::new(
            directory,
            Arc::new(InMemoryLeaseService::new()),
            config.service.name.clone(),
            config.snapshot.clone(),
        );
        let report = scheduler.tick().await.unwrap();
        assert!(matches!(
            report.outcome(&"acme".into()),
            Some(TenantTickOutcome::Scheduled(r)) if r.scheduled == 1
        ));

        assert!(pool.run_once("test-worker").await.unwrap());

        let jobs = tenant.queue.all().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind(), JobKind::ManagerSnapshot);
        assert_eq!(jobs[0].state, JobState::Succeeded);
        assert!(tenant.store.process("S1").await.unwrap().is_idle());
        let source = tenant.store.source("S1").await.unwrap();
        assert_eq!(source.aggregation(StepType::Ingestion).unwrap().total_in, 3);
    }
}
