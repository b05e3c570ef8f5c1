use std::{any::type_name_of_val, fmt, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::SnapshotConfig,
    error::MonitorError,
    jobs::{DispatchStatus, JobDispatcher, JobLease, JobPayload, ManagerSnapshotJob},
    persistence::SnapshotProcessRepository,
    snapshot::{
        cleanup::SessionStepCleaner,
        engine::{SnapshotEngine, SnapshotOutcome},
    },
    tenant::TenantContext,
    types::TenantId,
};

/// Routes leased jobs of one tenant to the snapshot engine or the cleaner.
pub struct SnapshotJobDispatcher {
    tenant: TenantId,
    processes: Arc<dyn SnapshotProcessRepository>,
    engine: SnapshotEngine,
    cleaner: SessionStepCleaner,
}

impl fmt::Debug for SnapshotJobDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotJobDispatcher")
            .field("tenant", &self.tenant)
            .field("processes", &type_name_of_val(self.processes.as_ref()))
            .field("engine", &self.engine)
            .finish()
    }
}

impl SnapshotJobDispatcher {
    pub fn new(context: &TenantContext, config: &SnapshotConfig) -> Self {
        Self {
            tenant: context.tenant.clone(),
            processes: Arc::clone(&context.processes),
            engine: SnapshotEngine::new(
                Arc::clone(&context.steps),
                Arc::clone(&context.aggregates),
                config.step_page_size,
            ),
            cleaner: SessionStepCleaner::new(Arc::clone(&context.steps)),
        }
    }

    async fn run_snapshot(
        &self,
        lease: &JobLease,
        job: &ManagerSnapshotJob,
        cancel: &CancellationToken,
    ) -> DispatchStatus {
        // The stored process carries the authoritative watermark.
        let process = match self.processes.find_by_source(&job.source).await {
            Ok(Some(process)) => process,
            Ok(None) => {
                return DispatchStatus::Failed {
                    error: format!("no snapshot process for source {}", job.source),
                };
            }
            Err(err) => {
                return DispatchStatus::Failed {
                    error: err.to_string(),
                };
            }
        };

        if process.job_id != Some(lease.job.id) {
            return DispatchStatus::Cancelled {
                reason: format!("source {} is not marked for this job", job.source),
            };
        }

        match self.engine.generate(&process, job.freeze_date, cancel).await {
            Ok(SnapshotOutcome::NoChanges) => {
                // Repeats every tick for steps registered after their last update.
                debug!(
                    target: "snapshot::dispatcher",
                    tenant = %self.tenant,
                    source = %job.source,
                    watermark = ?process.last_update_date,
                    freeze_date = %job.freeze_date,
                    "snapshot found nothing to aggregate"
                );
                DispatchStatus::Success
            }
            Ok(SnapshotOutcome::Committed(_)) => DispatchStatus::Success,
            Err(MonitorError::Cancelled(reason)) => DispatchStatus::Cancelled { reason },
            Err(err) => {
                warn!(
                    target: "snapshot::dispatcher",
                    tenant = %self.tenant,
                    source = %job.source,
                    "snapshot failed: {err}"
                );
                DispatchStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl JobDispatcher for SnapshotJobDispatcher {
    async fn dispatch(&self, lease: &JobLease, cancel: &CancellationToken) -> DispatchStatus {
        match &lease.job.payload {
            JobPayload::ManagerSnapshot(job) => self.run_snapshot(lease, job, cancel).await,
            JobPayload::SessionStepClean(job) => match self.cleaner.clean(job).await {
                Ok(_) => DispatchStatus::Success,
                Err(err) => DispatchStatus::Failed {
                    error: err.to_string(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::{
        jobs::{JobPriority, JobQueue, JobRequest, JobRuntime},
        persistence::SessionStepRepository,
        types::{SessionStep, StepType},
    };

    #[tokio::test]
    async fn job_without_matching_marker_is_not_run() {
        let tenant = TenantContext::in_memory("acme");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        tenant
            .store
            .upsert(SessionStep::new("S1", "a", StepType::Ingestion, t0).with_counts(3, 0))
            .await
            .unwrap();

        tenant
            .queue
            .submit(JobRequest::new(
                JobPriority::P1,
                JobPayload::ManagerSnapshot(ManagerSnapshotJob {
                    source: "S1".into(),
                    last_update_date: None,
                    freeze_date: t0 + Duration::seconds(5),
                }),
            ))
            .await
            .unwrap();
        let lease = tenant
            .queue
            .lease_next("w0", Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        let dispatcher = SnapshotJobDispatcher::new(&tenant.context, &SnapshotConfig::default());
        let status = dispatcher.dispatch(&lease, &CancellationToken::new()).await;

        assert!(matches!(status, DispatchStatus::Cancelled { .. }));
        assert_eq!(tenant.store.commit_count().await, 0);
    }
}
