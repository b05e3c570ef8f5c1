//! Retention of old step versions.
//!
//! Cleanup runs as a `SessionStepClean` job so the scheduler can see it and
//! hold snapshot scheduling back while it is active. The trigger, in turn,
//! waits while any snapshot job is queued or running.
//!
//! Only versions a source's watermark already covers are deleted: anything
//! newer has not been folded into the aggregates yet.

use std::{any::type_name_of_val, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    config::CleanupConfig,
    error::Result,
    jobs::{JobId, JobKind, JobPayload, JobPriority, JobRequest, JobState, SessionStepCleanJob},
    persistence::SessionStepRepository,
    tenant::TenantDirectory,
    types::TenantId,
};

/// Executes cleanup jobs.
#[derive(Clone)]
pub struct SessionStepCleaner {
    steps: Arc<dyn SessionStepRepository>,
}

impl fmt::Debug for SessionStepCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStepCleaner")
            .field("steps", &type_name_of_val(self.steps.as_ref()))
            .finish()
    }
}

impl SessionStepCleaner {
    pub fn new(steps: Arc<dyn SessionStepRepository>) -> Self {
        Self { steps }
    }

    pub async fn clean(&self, job: &SessionStepCleanJob) -> Result<u64> {
        let deleted = self.steps.delete_folded_before(job.cutoff).await?;
        info!(
            target: "snapshot::cleanup",
            cutoff = %job.cutoff,
            deleted,
            "old folded step versions deleted"
        );
        Ok(deleted)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CleanupTriggerOutcome {
    Submitted(JobId),
    SnapshotActive,
    AlreadyActive,
    Failed(String),
}

/// Periodically submits one cleanup job per tenant.
pub struct CleanupTrigger {
    directory: Arc<dyn TenantDirectory>,
    config: CleanupConfig,
    priority: JobPriority,
}

impl fmt::Debug for CleanupTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupTrigger")
            .field("directory", &type_name_of_val(self.directory.as_ref()))
            .field("config", &self.config)
            .field("priority", &self.priority)
            .finish()
    }
}

impl CleanupTrigger {
    pub fn new(directory: Arc<dyn TenantDirectory>, config: CleanupConfig) -> Self {
        Self {
            directory,
            config,
            priority: JobPriority::P2,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Submit cleanup for every tenant whose snapshot runtime is quiet.
    pub async fn trigger_at(&self, now: DateTime<Utc>) -> Result<Vec<(TenantId, CleanupTriggerOutcome)>> {
        let cutoff = now - self.config.retention();
        let mut outcomes = Vec::new();

        for tenant in self.directory.active_tenants().await? {
            let outcome = match self.trigger_tenant(&tenant, cutoff).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(target: "snapshot::cleanup", tenant = %tenant, "cleanup trigger failed: {err}");
                    CleanupTriggerOutcome::Failed(err.to_string())
                }
            };
            outcomes.push((tenant, outcome));
        }
        Ok(outcomes)
    }

    async fn trigger_tenant(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> Result<CleanupTriggerOutcome> {
        let context = self.directory.context(tenant).await?;

        let snapshots = context
            .jobs
            .count_by_kind_and_state(JobKind::ManagerSnapshot, &JobState::ACTIVE)
            .await?;
        if snapshots > 0 {
            debug!(target: "snapshot::cleanup", tenant = %tenant, snapshots, "snapshot jobs active; cleanup deferred");
            return Ok(CleanupTriggerOutcome::SnapshotActive);
        }

        let active = context
            .jobs
            .count_by_kind_and_state(JobKind::SessionStepClean, &JobState::ACTIVE)
            .await?;
        if active > 0 {
            return Ok(CleanupTriggerOutcome::AlreadyActive);
        }

        let job_id = context
            .jobs
            .submit(JobRequest::new(
                self.priority,
                JobPayload::SessionStepClean(SessionStepCleanJob { cutoff }),
            ))
            .await?;
        info!(target: "snapshot::cleanup", tenant = %tenant, job_id = %job_id, cutoff = %cutoff, "cleanup job submitted");
        Ok(CleanupTriggerOutcome::Submitted(job_id))
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!(target: "snapshot::cleanup", "step cleanup disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(target: "snapshot::cleanup", "cleanup trigger shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.trigger_at(Utc::now()).await {
                        error!(target: "snapshot::cleanup", "cleanup pass failed: {err}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        jobs::{JobQueue, JobRuntime, ManagerSnapshotJob, queue::MockJobRuntime},
        persistence::SnapshotProcessRepository,
        tenant::{StaticTenantDirectory, TenantContext},
        types::{SessionStep, SnapshotProcess, StepType},
    };

    fn t(offset_days: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::days(offset_days)
    }

    #[tokio::test]
    async fn cleaner_deletes_only_folded_versions_older_than_cutoff() {
        let tenant = TenantContext::in_memory("acme");
        let store = tenant.store;
        store.upsert(SessionStep::new("S1", "old", StepType::Ingestion, t(0))).await.unwrap();
        store.upsert(SessionStep::new("S1", "pending", StepType::Ingestion, t(8))).await.unwrap();
        store.upsert(SessionStep::new("S1", "new", StepType::Ingestion, t(40))).await.unwrap();
        store.upsert(SessionStep::new("S2", "never-snapshotted", StepType::Ingestion, t(0))).await.unwrap();
        store.save(&SnapshotProcess::new("S1").advanced_to(t(5))).await.unwrap();

        let deleted = SessionStepCleaner::new(store.clone())
            .clean(&SessionStepCleanJob { cutoff: t(10) })
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(store.step_count().await, 3);
    }

    #[tokio::test]
    async fn trigger_defers_while_a_snapshot_is_queued() {
        let tenant = TenantContext::in_memory("acme");
        let queue = tenant.queue.clone();
        queue
            .submit(JobRequest::new(
                JobPriority::P1,
                JobPayload::ManagerSnapshot(ManagerSnapshotJob {
                    source: "S1".into(),
                    last_update_date: None,
                    freeze_date: t(0),
                }),
            ))
            .await
            .unwrap();

        let directory = Arc::new(StaticTenantDirectory::new().with_tenant(tenant.context));
        let outcomes = CleanupTrigger::new(directory, CleanupConfig::default())
            .trigger_at(t(40))
            .await
            .unwrap();

        assert_eq!(outcomes[0].1, CleanupTriggerOutcome::SnapshotActive);
        assert_eq!(
            queue
                .count_by_kind_and_state(JobKind::SessionStepClean, &JobState::ACTIVE)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn trigger_defers_while_a_snapshot_runs() {
        let tenant = TenantContext::in_memory("acme");
        let queue = tenant.queue.clone();
        queue
            .submit(JobRequest::new(
                JobPriority::P1,
                JobPayload::ManagerSnapshot(ManagerSnapshotJob {
                    source: "S1".into(),
                    last_update_date: None,
                    freeze_date: t(0),
                }),
            ))
            .await
            .unwrap();
        queue
            .lease_next("w0", chrono::Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        let directory = Arc::new(StaticTenantDirectory::new().with_tenant(tenant.context));
        let trigger = CleanupTrigger::new(directory, CleanupConfig::default());

        let outcomes = trigger.trigger_at(t(40)).await.unwrap();
        assert_eq!(outcomes[0].1, CleanupTriggerOutcome::SnapshotActive);
        assert_eq!(
            queue
                .count_by_kind_and_state(JobKind::SessionStepClean, &JobState::ACTIVE)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn trigger_submits_cutoff_from_retention() {
        let mut jobs = MockJobRuntime::new();
        jobs.expect_count_by_kind_and_state().returning(|_, _| Ok(0));
        jobs.expect_submit()
            .withf(|request| {
                matches!(
                    &request.payload,
                    JobPayload::SessionStepClean(job) if job.cutoff == t(10)
                )
            })
            .times(1)
            .returning(|_| Ok(JobId::new()));

        let mut context = TenantContext::in_memory("acme").context;
        context.jobs = Arc::new(jobs);
        let directory = Arc::new(StaticTenantDirectory::new().with_tenant(context));

        let outcomes = CleanupTrigger::new(directory, CleanupConfig::default())
            .trigger_at(t(40))
            .await
            .unwrap();
        assert!(matches!(outcomes[0].1, CleanupTriggerOutcome::Submitted(_)));
    }
}
