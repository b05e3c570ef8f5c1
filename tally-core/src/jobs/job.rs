use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MonitorError;

/// Unique identifier for runtime jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority bands, lower value is dequeued first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobPriority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl JobPriority {
    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            0 => Some(JobPriority::P0),
            1 => Some(JobPriority::P1),
            2 => Some(JobPriority::P2),
            3 => Some(JobPriority::P3),
            _ => None,
        }
    }
}

/// Lifecycle of a job. Everything past `Running` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ACTIVE: [JobState; 2] = [JobState::Queued, JobState::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = MonitorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(MonitorError::Internal(format!("invalid job state {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ManagerSnapshot,
    SessionStepClean,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ManagerSnapshot => "manager_snapshot",
            JobKind::SessionStepClean => "session_step_clean",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload per job kind.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobPayload {
    ManagerSnapshot(ManagerSnapshotJob),
    SessionStepClean(SessionStepCleanJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ManagerSnapshot(_) => JobKind::ManagerSnapshot,
            JobPayload::SessionStepClean(_) => JobKind::SessionStepClean,
        }
    }
}

/// Aggregate the pending steps of one source up to `freeze_date`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ManagerSnapshotJob {
    pub source: String,
    /// Watermark observed when the job was scheduled. Informational; the
    /// engine works from the stored watermark.
    pub last_update_date: Option<DateTime<Utc>>,
    pub freeze_date: DateTime<Utc>,
}

/// Delete step versions last updated before `cutoff`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionStepCleanJob {
    pub cutoff: DateTime<Utc>,
}

/// Submission request accepted by the job runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    /// Caller-chosen id; the runtime allocates one when absent.
    #[serde(default)]
    pub id: Option<JobId>,
    pub payload: JobPayload,
    pub priority: JobPriority,
}

impl JobRequest {
    pub fn new(priority: JobPriority, payload: JobPayload) -> Self {
        Self {
            id: None,
            payload,
            priority,
        }
    }

    /// Submit under an id the caller already recorded elsewhere.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Envelope stored in persistence for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts: u16,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id.unwrap_or_default(),
            payload: request.payload,
            priority: request.priority,
            state: JobState::Queued,
            attempts: 0,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Final result reported by a worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded,
    Failed { error: String },
    Cancelled { reason: String },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded => JobState::Succeeded,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::Cancelled { .. } => JobState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed { error } => Some(error),
            JobOutcome::Cancelled { reason } => Some(reason),
        }
    }
}
