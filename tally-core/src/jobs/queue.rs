use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    jobs::job::{JobId, JobKind, JobOutcome, JobRecord, JobRequest, JobState},
};

/// Contract the snapshot pipeline needs from a job runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Store the job as queued and return its id.
    async fn submit(&self, request: JobRequest) -> Result<JobId>;

    async fn count_by_kind_and_state(&self, kind: JobKind, states: &[JobState]) -> Result<u64>;

    async fn job_state(&self, id: JobId) -> Result<Option<JobState>>;

    /// Queued jobs move straight to `Cancelled`; running jobs get a cancel
    /// request their worker turns into a cancellation signal. Returns the
    /// state after the call, `None` for unknown ids.
    async fn cancel(&self, id: JobId) -> Result<Option<JobState>>;
}

/// Lease metadata returned when a worker takes a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub job: JobRecord,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Worker-facing side of the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Take the next queued job, highest priority then oldest first, and mark
    /// it running under `worker_id` until `ttl` elapses.
    async fn lease_next(&self, worker_id: &str, ttl: chrono::Duration) -> Result<Option<JobLease>>;

    async fn renew(&self, id: JobId, worker_id: &str, ttl: chrono::Duration) -> Result<DateTime<Utc>>;

    /// Record the terminal state of a running job and return the final record.
    async fn finish(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord>;

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool>;

    /// Fail running jobs whose lease expired. Returns the records moved.
    async fn expire_stale_leases(&self) -> Result<Vec<JobRecord>>;

    /// Delete terminal jobs last updated before `before`. Returns how many
    /// were removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Observer notified once per job that reaches a terminal state.
#[async_trait]
pub trait JobCompletionListener: Send + Sync {
    async fn on_terminal(&self, job: &JobRecord);
}
