use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::jobs::{job::JobOutcome, queue::JobLease};

/// Outcome of dispatcher execution for a single job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    Failed { error: String },
    Cancelled { reason: String },
}

impl DispatchStatus {
    pub fn into_outcome(self) -> JobOutcome {
        match self {
            DispatchStatus::Success => JobOutcome::Succeeded,
            DispatchStatus::Failed { error } => JobOutcome::Failed { error },
            DispatchStatus::Cancelled { reason } => JobOutcome::Cancelled { reason },
        }
    }
}

/// Primary contract exposed to worker loops for executing leased jobs.
///
/// `cancel` fires on shutdown or when the job is cancelled through the
/// runtime; implementations check it cooperatively.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, lease: &JobLease, cancel: &CancellationToken) -> DispatchStatus;
}
