use std::{any::type_name_of_val, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::{
    config::SnapshotConfig,
    error::Result,
    jobs::{JobId, JobPayload, JobRequest, JobRuntime, ManagerSnapshotJob},
    persistence::{SessionStepRepository, SnapshotProcessRepository},
    tenant::TenantContext,
    types::{SnapshotProcess, TenantId},
};

/// Totals of one orchestrator pass over a tenant.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScheduleReport {
    pub pages: usize,
    pub examined: usize,
    pub scheduled: usize,
    /// Sources whose submission or marker write failed; retried next tick.
    pub failed: usize,
}

/// Result of one idle-process page.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SchedulePage {
    pub examined: usize,
    pub scheduled: usize,
    pub failed: usize,
    /// Source name to resume after when the page was full.
    pub next_after: Option<String>,
}

/// Finds idle snapshot processes with pending steps and hands each one to the
/// job runtime, marking it running so no second job is scheduled for it.
pub struct SnapshotOrchestrator {
    tenant: TenantId,
    steps: Arc<dyn SessionStepRepository>,
    processes: Arc<dyn SnapshotProcessRepository>,
    jobs: Arc<dyn JobRuntime>,
    config: SnapshotConfig,
}

impl fmt::Debug for SnapshotOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotOrchestrator")
            .field("tenant", &self.tenant)
            .field("processes", &type_name_of_val(self.processes.as_ref()))
            .field("jobs", &type_name_of_val(self.jobs.as_ref()))
            .field("config", &self.config)
            .finish()
    }
}

impl SnapshotOrchestrator {
    pub fn new(context: &TenantContext, config: SnapshotConfig) -> Self {
        Self {
            tenant: context.tenant.clone(),
            steps: Arc::clone(&context.steps),
            processes: Arc::clone(&context.processes),
            jobs: Arc::clone(&context.jobs),
            config,
        }
    }

    /// Walk every idle process page and submit a snapshot job per eligible
    /// source, all against the same `freeze_date`.
    pub async fn schedule(&self, freeze_date: DateTime<Utc>) -> Result<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let mut after: Option<String> = None;

        loop {
            let page = self.schedule_page(freeze_date, after.as_deref()).await?;
            report.pages += 1;
            report.examined += page.examined;
            report.scheduled += page.scheduled;
            report.failed += page.failed;

            match page.next_after {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        if report.scheduled > 0 || report.failed > 0 {
            info!(
                target: "snapshot::orchestrator",
                tenant = %self.tenant,
                scheduled = report.scheduled,
                failed = report.failed,
                examined = report.examined,
                pages = report.pages,
                "snapshot jobs scheduled"
            );
        }
        Ok(report)
    }

    /// Process one page of idle processes after `after_source`.
    pub async fn schedule_page(
        &self,
        freeze_date: DateTime<Utc>,
        after_source: Option<&str>,
    ) -> Result<SchedulePage> {
        let page_size = self.config.process_page_size.max(1);
        let processes = self.processes.find_idle(after_source, page_size).await?;

        let mut result = SchedulePage {
            examined: processes.len(),
            next_after: (processes.len() == page_size)
                .then(|| processes.last().map(|p| p.source.clone()))
                .flatten(),
            ..SchedulePage::default()
        };

        for process in &processes {
            match self.try_schedule(process, freeze_date).await {
                Ok(true) => result.scheduled += 1,
                Ok(false) => {}
                Err(err) => {
                    result.failed += 1;
                    warn!(
                        target: "snapshot::orchestrator",
                        tenant = %self.tenant,
                        source = %process.source,
                        "snapshot scheduling failed: {err}"
                    );
                }
            }
        }
        Ok(result)
    }

    /// A source is eligible when at least one step was registered after its
    /// watermark and before the freeze date.
    ///
    /// Eligibility reads `registration_date` while the engine windows on
    /// `last_update_date`. A step registered after its own last update stays
    /// eligible once the watermark passes it, so the source gets a
    /// `NoChanges` run every tick until a newer version arrives.
    pub async fn is_eligible(
        &self,
        process: &SnapshotProcess,
        freeze_date: DateTime<Utc>,
    ) -> Result<bool> {
        let pending = self
            .steps
            .count_registered_between(&process.source, process.last_update_date, freeze_date)
            .await?;
        if pending > 0 {
            trace!(
                target: "snapshot::orchestrator",
                tenant = %self.tenant,
                source = %process.source,
                watermark = ?process.last_update_date,
                pending,
                "source eligible"
            );
        }
        Ok(pending > 0)
    }

    /// The marker is written under a pre-allocated id before the job exists,
    /// so a worker can never lease a job its source does not point at.
    async fn try_schedule(&self, process: &SnapshotProcess, freeze_date: DateTime<Utc>) -> Result<bool> {
        if !self.is_eligible(process, freeze_date).await? {
            return Ok(false);
        }

        let job_id = JobId::new();
        if !self.processes.mark_running(&process.source, job_id).await? {
            // Another replica marked the source between our read and write.
            return Ok(false);
        }

        let request = JobRequest::new(
            self.config.job_priority,
            JobPayload::ManagerSnapshot(ManagerSnapshotJob {
                source: process.source.clone(),
                last_update_date: process.last_update_date,
                freeze_date,
            }),
        )
        .with_id(job_id);
        if let Err(err) = self.jobs.submit(request).await {
            self.unmark(&process.source, job_id).await;
            return Err(err);
        }

        debug!(
            target: "snapshot::orchestrator",
            tenant = %self.tenant,
            source = %process.source,
            job_id = %job_id,
            freeze_date = %freeze_date,
            "snapshot job submitted"
        );
        Ok(true)
    }

    async fn unmark(&self, source: &str, job_id: JobId) {
        // Left in place on failure; the orphan sweep clears it next tick.
        if let Err(err) = self.processes.clear_job(source, job_id).await {
            warn!(
                target: "snapshot::orchestrator",
                tenant = %self.tenant,
                source = %source,
                job_id = %job_id,
                "releasing marker of unsubmitted job failed: {err}"
            );
        }
    }

    /// Clear markers whose job is terminal or unknown to the runtime. Covers
    /// jobs cancelled while queued and runtimes that lost their records.
    pub async fn release_orphaned_markers(&self) -> Result<usize> {
        let page_size = self.config.process_page_size.max(1);
        let mut released = 0usize;
        let mut after: Option<String> = None;

        loop {
            let page = self.processes.find_running(after.as_deref(), page_size).await?;
            let full = page.len() == page_size;

            for process in &page {
                let Some(job_id) = process.job_id else {
                    continue;
                };
                let state = self.jobs.job_state(job_id).await?;
                if state.is_some_and(|s| !s.is_terminal()) {
                    continue;
                }
                if self.processes.clear_job(&process.source, job_id).await? {
                    released += 1;
                    debug!(
                        target: "snapshot::orchestrator",
                        tenant = %self.tenant,
                        source = %process.source,
                        job_id = %job_id,
                        job_state = ?state,
                        "orphaned snapshot marker released"
                    );
                }
            }

            if !full {
                break;
            }
            after = page.last().map(|p| p.source.clone());
        }
        Ok(released)
    }
}
