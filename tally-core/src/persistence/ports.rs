//! Repository contracts used by the snapshot pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    jobs::JobId,
    types::{Session, SessionStep, SnapshotProcess, Source, StepType},
};

/// Time window over step `last_update_date`: `(after, before]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepWindow {
    pub after: Option<DateTime<Utc>>,
    pub before: DateTime<Utc>,
}

impl StepWindow {
    pub fn new(after: Option<DateTime<Utc>>, before: DateTime<Utc>) -> Self {
        Self { after, before }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.after.is_none_or(|after| at > after) && at <= self.before
    }
}

/// Keyset position inside a window: the last step returned by the previous
/// page. Ordering is `(last_update_date, session, step_type)`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepCursor {
    pub last_update_date: DateTime<Utc>,
    pub session: String,
    pub step_type: StepType,
}

impl StepCursor {
    pub fn after(step: &SessionStep) -> Self {
        Self {
            last_update_date: step.last_update_date,
            session: step.session.clone(),
            step_type: step.step_type,
        }
    }

    pub fn precedes(&self, step: &SessionStep) -> bool {
        (self.last_update_date, self.session.as_str(), self.step_type)
            < (step.last_update_date, step.session.as_str(), step.step_type)
    }
}

#[async_trait]
pub trait SessionStepRepository: Send + Sync {
    /// One page of a source's steps inside `window`, ordered by
    /// `(last_update_date, session, step_type)` and strictly after `cursor`.
    async fn find_in_window(
        &self,
        source: &str,
        window: StepWindow,
        cursor: Option<&StepCursor>,
        limit: usize,
    ) -> Result<Vec<SessionStep>>;

    /// Number of steps of `source` registered strictly between `after` (if
    /// any) and `before`.
    async fn count_registered_between(
        &self,
        source: &str,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
    ) -> Result<u64>;

    /// Producer write path: replace the step by `(source, session, type)` and
    /// make sure a snapshot process exists for the source.
    async fn upsert(&self, step: SessionStep) -> Result<()>;

    /// Delete step versions last updated before `cutoff` and at or below
    /// their source's watermark. Sources without a watermark keep every
    /// version.
    async fn delete_folded_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SnapshotProcessRepository: Send + Sync {
    /// Processes with no job marker, ordered by source name, strictly after
    /// `after_source`.
    async fn find_idle(&self, after_source: Option<&str>, limit: usize) -> Result<Vec<SnapshotProcess>>;

    /// Processes carrying a job marker, ordered by source name.
    async fn find_running(&self, after_source: Option<&str>, limit: usize) -> Result<Vec<SnapshotProcess>>;

    async fn find_by_source(&self, source: &str) -> Result<Option<SnapshotProcess>>;

    async fn save(&self, process: &SnapshotProcess) -> Result<()>;

    /// Set the marker only if the process is still idle. Returns `false` when
    /// another writer got there first.
    async fn mark_running(&self, source: &str, job_id: JobId) -> Result<bool>;

    /// Clear the marker only if it still names `job_id`.
    async fn clear_job(&self, source: &str, job_id: JobId) -> Result<bool>;
}

/// Everything a successful snapshot writes, persisted in one transaction.
#[derive(Clone, Debug)]
pub struct SnapshotCommit {
    pub sessions: Vec<Session>,
    pub source: Source,
    pub process: SnapshotProcess,
}

#[async_trait]
pub trait AggregateRepository: Send + Sync {
    async fn find_source(&self, name: &str) -> Result<Option<Source>>;

    async fn find_session(&self, source: &str, name: &str) -> Result<Option<Session>>;

    /// Persist sessions, the source and the advanced watermark atomically.
    async fn commit(&self, commit: SnapshotCommit) -> Result<()>;
}
