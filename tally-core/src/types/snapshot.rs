use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::JobId;

/// Watermark and in-flight marker for one source.
///
/// `last_update_date` is the exclusive lower bound of the next snapshot
/// window and only moves together with an aggregate commit. `job_id` is set
/// while a snapshot job for the source is queued or running.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SnapshotProcess {
    pub source: String,
    pub last_update_date: Option<DateTime<Utc>>,
    pub job_id: Option<JobId>,
}

impl SnapshotProcess {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            last_update_date: None,
            job_id: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.job_id.is_none()
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn advanced_to(mut self, watermark: DateTime<Utc>) -> Self {
        self.last_update_date = Some(watermark);
        self
    }
}
