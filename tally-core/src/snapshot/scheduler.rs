use std::{any::type_name_of_val, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SnapshotConfig,
    error::Result,
    jobs::{JobKind, JobState},
    lease::{LeaseGuard, LeaseService},
    snapshot::orchestrator::{ScheduleReport, SnapshotOrchestrator},
    tenant::{TenantContext, TenantDirectory},
    types::TenantId,
};

const LEASE_SUFFIX: &str = "_session-manager-snapshot";

/// Name of the lease guarding snapshot scheduling for one tenant.
pub fn snapshot_lease_name(tenant: &TenantId, service_name: &str) -> String {
    format!("{tenant}:{service_name}{LEASE_SUFFIX}")
}

/// What a tick did for one tenant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TenantTickOutcome {
    Scheduled(ScheduleReport),
    /// A cleanup job is queued or running; scheduling skipped.
    CleanupActive,
    /// Another replica holds the scheduling lease.
    LeaseBusy,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct TickReport {
    pub freeze_date: DateTime<Utc>,
    pub tenants: Vec<(TenantId, TenantTickOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, tenant: &TenantId) -> Option<&TenantTickOutcome> {
        self.tenants
            .iter()
            .find(|(id, _)| id == tenant)
            .map(|(_, outcome)| outcome)
    }
}

/// Fixed-delay driver of the snapshot pipeline across tenants.
///
/// Each tick fixes one freeze date, then per tenant: skips while step cleanup
/// is active, takes the tenant's scheduling lease without waiting, releases
/// orphaned markers and runs the orchestrator. A failing tenant is logged and
/// does not stop the others.
pub struct SnapshotScheduler {
    directory: Arc<dyn TenantDirectory>,
    leases: Arc<dyn LeaseService>,
    service_name: String,
    config: SnapshotConfig,
}

impl fmt::Debug for SnapshotScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotScheduler")
            .field("directory", &type_name_of_val(self.directory.as_ref()))
            .field("leases", &type_name_of_val(self.leases.as_ref()))
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .finish()
    }
}

impl SnapshotScheduler {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        leases: Arc<dyn LeaseService>,
        service_name: impl Into<String>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            directory,
            leases,
            service_name: service_name.into(),
            config,
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, freeze_date: DateTime<Utc>) -> Result<TickReport> {
        let tenants = self.directory.active_tenants().await?;
        let mut report = TickReport {
            freeze_date,
            tenants: Vec::with_capacity(tenants.len()),
        };

        for tenant in tenants {
            let outcome = match self.tick_tenant(&tenant, freeze_date).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(
                        target: "snapshot::scheduler",
                        tenant = %tenant,
                        "snapshot scheduling failed: {err}"
                    );
                    TenantTickOutcome::Failed(err.to_string())
                }
            };
            report.tenants.push((tenant, outcome));
        }
        Ok(report)
    }

    async fn tick_tenant(&self, tenant: &TenantId, freeze_date: DateTime<Utc>) -> Result<TenantTickOutcome> {
        let context = self.directory.context(tenant).await?;

        let cleaning = context
            .jobs
            .count_by_kind_and_state(JobKind::SessionStepClean, &JobState::ACTIVE)
            .await?;
        if cleaning > 0 {
            debug!(target: "snapshot::scheduler", tenant = %tenant, "step cleanup active; skipping tick");
            return Ok(TenantTickOutcome::CleanupActive);
        }

        let lease_name = snapshot_lease_name(tenant, &self.service_name);
        let Some(guard) =
            LeaseGuard::try_acquire(&self.leases, &lease_name, self.config.lease_max_duration()).await?
        else {
            debug!(target: "snapshot::scheduler", tenant = %tenant, lease = %lease_name, "lease held elsewhere");
            return Ok(TenantTickOutcome::LeaseBusy);
        };

        let result = self.schedule_locked(&context, freeze_date).await;

        if let Err(err) = guard.release().await {
            warn!(target: "snapshot::scheduler", tenant = %tenant, lease = %lease_name, "lease release failed: {err}");
        }
        result.map(TenantTickOutcome::Scheduled)
    }

    async fn schedule_locked(&self, context: &TenantContext, freeze_date: DateTime<Utc>) -> Result<ScheduleReport> {
        let orchestrator = SnapshotOrchestrator::new(context, self.config.clone());
        if let Err(err) = orchestrator.release_orphaned_markers().await {
            warn!(
                target: "snapshot::scheduler",
                tenant = %context.tenant,
                "orphaned marker sweep failed: {err}"
            );
        }
        orchestrator.schedule(freeze_date).await
    }

    /// Tick after the initial delay, then again `fixed_delay` after each
    /// tick completes, until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            target: "snapshot::scheduler",
            service = %self.service_name,
            initial_delay_ms = self.config.scheduler_initial_delay_ms,
            fixed_delay_ms = self.config.scheduler_fixed_delay_ms,
            "snapshot scheduler started"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.initial_delay()) => {}
        }

        loop {
            if let Err(err) = self.tick().await {
                error!(target: "snapshot::scheduler", "scheduler tick failed: {err}");
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(target: "snapshot::scheduler", "snapshot scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.fixed_delay()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::MonitorError,
        jobs::queue::MockJobRuntime,
        lease::InMemoryLeaseService,
        tenant::{StaticTenantDirectory, TenantContext},
    };

    #[test]
    fn lease_name_is_scoped_by_tenant_and_service() {
        assert_eq!(
            snapshot_lease_name(&TenantId::new("acme"), "tally"),
            "acme:tally_session-manager-snapshot"
        );
    }

    #[tokio::test]
    async fn active_cleanup_skips_without_touching_the_lease() {
        let mut jobs = MockJobRuntime::new();
        jobs.expect_count_by_kind_and_state()
            .withf(|kind, states| *kind == JobKind::SessionStepClean && states.iter().eq(JobState::ACTIVE.iter()))
            .times(1)
            .returning(|_, _| Ok(1));
        jobs.expect_submit().never();

        let mut context = TenantContext::in_memory("acme").context;
        context.jobs = Arc::new(jobs);
        let leases = Arc::new(InMemoryLeaseService::new());
        let scheduler = SnapshotScheduler::new(
            Arc::new(StaticTenantDirectory::new().with_tenant(context)),
            leases.clone(),
            "tally",
            SnapshotConfig::default(),
        );

        let report = scheduler.tick().await.unwrap();
        assert_eq!(
            report.outcome(&TenantId::new("acme")),
            Some(&TenantTickOutcome::CleanupActive)
        );
        assert!(leases.holder("acme:tally_session-manager-snapshot").await.is_none());
    }

    #[tokio::test]
    async fn failing_tenant_does_not_block_others() {
        let mut broken = MockJobRuntime::new();
        broken
            .expect_count_by_kind_and_state()
            .returning(|_, _| Err(MonitorError::Internal("runtime unavailable".into())));
        let mut broken_context = TenantContext::in_memory("broken").context;
        broken_context.jobs = Arc::new(broken);

        let healthy = TenantContext::in_memory("healthy");
        let directory = StaticTenantDirectory::new()
            .with_tenant(broken_context)
            .with_tenant(healthy.context);
        let scheduler = SnapshotScheduler::new(
            Arc::new(directory),
            Arc::new(InMemoryLeaseService::new()),
            "tally",
            SnapshotConfig::default(),
        );

        let report = scheduler.tick().await.unwrap();
        assert!(matches!(
            report.outcome(&TenantId::new("broken")),
            Some(TenantTickOutcome::Failed(_))
        ));
        assert!(matches!(
            report.outcome(&TenantId::new("healthy")),
            Some(TenantTickOutcome::Scheduled(_))
        ));
    }

    #[tokio::test]
    async fn held_lease_skips_the_tenant() {
        let tenant = TenantContext::in_memory("acme");
        let leases: Arc<dyn LeaseService> = Arc::new(InMemoryLeaseService::new());
        let _held = leases
            .try_acquire("acme:tally_session-manager-snapshot", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let scheduler = SnapshotScheduler::new(
            Arc::new(StaticTenantDirectory::new().with_tenant(tenant.context)),
            leases,
            "tally",
            SnapshotConfig::default(),
        );

        let report = scheduler.tick().await.unwrap();
        assert_eq!(
            report.outcome(&TenantId::new("acme")),
            Some(&TenantTickOutcome::LeaseBusy)
        );
    }
}
