use std::{any::type_name_of_val, fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    jobs::{JobCompletionListener, JobPayload, JobRecord},
    persistence::SnapshotProcessRepository,
    types::TenantId,
};

/// Clears a source's job marker once its snapshot job reaches a terminal
/// state, whatever the outcome.
pub struct SnapshotMarkerReleaser {
    tenant: TenantId,
    processes: Arc<dyn SnapshotProcessRepository>,
}

impl fmt::Debug for SnapshotMarkerReleaser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotMarkerReleaser")
            .field("tenant", &self.tenant)
            .field("processes", &type_name_of_val(self.processes.as_ref()))
            .finish()
    }
}

impl SnapshotMarkerReleaser {
    pub fn new(tenant: TenantId, processes: Arc<dyn SnapshotProcessRepository>) -> Self {
        Self { tenant, processes }
    }
}

#[async_trait]
impl JobCompletionListener for SnapshotMarkerReleaser {
    async fn on_terminal(&self, job: &JobRecord) {
        let JobPayload::ManagerSnapshot(payload) = &job.payload else {
            return;
        };

        match self.processes.clear_job(&payload.source, job.id).await {
            Ok(true) => debug!(
                target: "snapshot::markers",
                tenant = %self.tenant,
                source = %payload.source,
                job_id = %job.id,
                state = %job.state,
                "snapshot marker released"
            ),
            Ok(false) => debug!(
                target: "snapshot::markers",
                tenant = %self.tenant,
                source = %payload.source,
                job_id = %job.id,
                "marker no longer held by job"
            ),
            // The scheduler's orphan sweep retries this.
            Err(err) => warn!(
                target: "snapshot::markers",
                tenant = %self.tenant,
                source = %payload.source,
                job_id = %job.id,
                "snapshot marker release failed: {err}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        jobs::{JobPriority, JobRequest, JobState, ManagerSnapshotJob, SessionStepCleanJob},
        persistence::InMemoryMonitoringStore,
        types::SnapshotProcess,
    };

    fn snapshot_record(source: &str) -> JobRecord {
        let mut record = JobRecord::new(JobRequest::new(
            JobPriority::P1,
            JobPayload::ManagerSnapshot(ManagerSnapshotJob {
                source: source.to_string(),
                last_update_date: None,
                freeze_date: Utc::now(),
            }),
        ));
        record.state = JobState::Failed;
        record
    }

    #[tokio::test]
    async fn failed_job_still_releases_its_marker() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        let record = snapshot_record("S1");
        store
            .save(&SnapshotProcess::new("S1").with_job(record.id))
            .await
            .unwrap();

        SnapshotMarkerReleaser::new(TenantId::new("acme"), store.clone())
            .on_terminal(&record)
            .await;

        assert!(store.process("S1").await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn other_kinds_and_foreign_markers_are_left_alone() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        let holder = snapshot_record("S1");
        store
            .save(&SnapshotProcess::new("S1").with_job(holder.id))
            .await
            .unwrap();
        let releaser = SnapshotMarkerReleaser::new(TenantId::new("acme"), store.clone());

        releaser.on_terminal(&snapshot_record("S1")).await;
        releaser
            .on_terminal(&JobRecord::new(JobRequest::new(
                JobPriority::P2,
                JobPayload::SessionStepClean(SessionStepCleanJob { cutoff: Utc::now() }),
            )))
            .await;

        assert_eq!(store.process("S1").await.unwrap().job_id, Some(holder.id));
    }
}
