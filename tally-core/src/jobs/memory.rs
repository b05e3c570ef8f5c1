use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::{MonitorError, Result},
    jobs::{
        job::{JobId, JobKind, JobOutcome, JobRecord, JobRequest, JobState},
        queue::{JobLease, JobQueue, JobRuntime},
    },
};

/// Process-local job queue used by tests and the `--in-memory` server mode.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.lock().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<_> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }
}

#[async_trait]
impl JobRuntime for InMemoryJobQueue {
    async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let record = JobRecord::new(request);
        let id = record.id;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&id) {
            return Err(MonitorError::Conflict(format!("job {id} already exists")));
        }
        debug!(target: "jobs::queue", job_id = %id, kind = %record.kind(), "job queued");
        jobs.insert(id, record);
        Ok(id)
    }

    async fn count_by_kind_and_state(&self, kind: JobKind, states: &[JobState]) -> Result<u64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|job| job.kind() == kind && states.contains(&job.state))
            .count() as u64)
    }

    async fn job_state(&self, id: JobId) -> Result<Option<JobState>> {
        Ok(self.jobs.lock().await.get(&id).map(|job| job.state))
    }

    async fn cancel(&self, id: JobId) -> Result<Option<JobState>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        match job.state {
            JobState::Queued => {
                job.state = JobState::Cancelled;
                job.last_error = Some("cancelled before start".into());
                job.updated_at = Utc::now();
            }
            JobState::Running => {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
            }
            _ => {}
        }
        Ok(Some(job.state))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn lease_next(&self, worker_id: &str, ttl: chrono::Duration) -> Result<Option<JobLease>> {
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .min_by_key(|job| (job.priority, job.created_at, job.id.0))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        let now = Utc::now();
        let expires_at = now + ttl;
        job.state = JobState::Running;
        job.attempts += 1;
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;

        Ok(Some(JobLease {
            job: job.clone(),
            worker_id: worker_id.to_string(),
            expires_at,
        }))
    }

    async fn renew(&self, id: JobId, worker_id: &str, ttl: chrono::Duration) -> Result<DateTime<Utc>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .filter(|job| {
                job.state == JobState::Running && job.lease_owner.as_deref() == Some(worker_id)
            })
            .ok_or_else(|| MonitorError::NotFound(format!("no running lease for job {id}")))?;
        let expires_at = Utc::now() + ttl;
        job.lease_expires_at = Some(expires_at);
        Ok(expires_at)
    }

    async fn finish(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| MonitorError::NotFound(format!("job {id}")))?;
        if job.state != JobState::Running {
            return Err(MonitorError::Conflict(format!(
                "job {id} is {} and cannot be finished",
                job.state
            )));
        }
        job.state = outcome.state();
        job.last_error = outcome.error().map(str::to_string);
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&id)
            .is_some_and(|job| job.cancel_requested))
    }

    async fn expire_stale_leases(&self) -> Result<Vec<JobRecord>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let mut expired = Vec::new();
        for job in jobs.values_mut() {
            if job.state == JobState::Running
                && job.lease_expires_at.is_some_and(|expires| expires < now)
            {
                job.state = JobState::Failed;
                job.last_error = Some("lease expired".into());
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                expired.push(job.clone());
            }
        }
        Ok(expired)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let len = jobs.len();
        jobs.retain(|_, job| !job.state.is_terminal() || job.updated_at >= before);
        Ok((len - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobPayload, JobPriority, SessionStepCleanJob};

    fn clean_request(priority: JobPriority) -> JobRequest {
        JobRequest::new(
            priority,
            JobPayload::SessionStepClean(SessionStepCleanJob { cutoff: Utc::now() }),
        )
    }

    #[tokio::test]
    async fn lease_prefers_higher_priority() {
        let queue = InMemoryJobQueue::new();
        let low = queue.submit(clean_request(JobPriority::P3)).await.unwrap();
        let high = queue.submit(clean_request(JobPriority::P0)).await.unwrap();

        let lease = queue
            .lease_next("w0", chrono::Duration::seconds(30))
            .await
            .unwrap()
            .expect("job ready");
        assert_eq!(lease.job.id, high);
        assert_eq!(queue.job_state(low).await.unwrap(), Some(JobState::Queued));
        assert_eq!(queue.job_state(high).await.unwrap(), Some(JobState::Running));
    }

    #[tokio::test]
    async fn cancel_queued_job_is_terminal_immediately() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(clean_request(JobPriority::P1)).await.unwrap();

        assert_eq!(queue.cancel(id).await.unwrap(), Some(JobState::Cancelled));
        assert!(queue.lease_next("w0", chrono::Duration::seconds(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_running_job_sets_request_flag() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(clean_request(JobPriority::P1)).await.unwrap();
        queue.lease_next("w0", chrono::Duration::seconds(30)).await.unwrap();

        assert_eq!(queue.cancel(id).await.unwrap(), Some(JobState::Running));
        assert!(queue.is_cancel_requested(id).await.unwrap());
    }

    #[tokio::test]
    async fn finishing_twice_is_a_conflict() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(clean_request(JobPriority::P1)).await.unwrap();
        queue.lease_next("w0", chrono::Duration::seconds(30)).await.unwrap();

        let record = queue.finish(id, JobOutcome::Succeeded).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(matches!(
            queue.finish(id, JobOutcome::Succeeded).await,
            Err(MonitorError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn purge_keeps_active_and_recent_jobs() {
        let queue = InMemoryJobQueue::new();
        let done = queue.submit(clean_request(JobPriority::P1)).await.unwrap();
        queue.lease_next("w0", chrono::Duration::seconds(30)).await.unwrap();
        queue.finish(done, JobOutcome::Succeeded).await.unwrap();
        let waiting = queue.submit(clean_request(JobPriority::P1)).await.unwrap();

        assert_eq!(queue.purge_finished(Utc::now() - chrono::Duration::minutes(5)).await.unwrap(), 0);
        assert_eq!(queue.purge_finished(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(queue.get(done).await.is_none());
        assert_eq!(queue.job_state(waiting).await.unwrap(), Some(JobState::Queued));
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let queue = InMemoryJobQueue::new();
        let id = JobId::new();
        queue.submit(clean_request(JobPriority::P1).with_id(id)).await.unwrap();
        assert!(matches!(
            queue.submit(clean_request(JobPriority::P1).with_id(id)).await,
            Err(MonitorError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn expired_leases_fail() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(clean_request(JobPriority::P1)).await.unwrap();
        queue
            .lease_next("w0", chrono::Duration::milliseconds(-1))
            .await
            .unwrap();

        let expired = queue.expire_stale_leases().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.job_state(id).await.unwrap(), Some(JobState::Failed));
        assert_eq!(
            queue.count_by_kind_and_state(JobKind::SessionStepClean, &JobState::ACTIVE).await.unwrap(),
            0
        );
    }
}
