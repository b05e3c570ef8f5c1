//! In-process job runtime: queue contract, worker pool and dispatch seam.

pub mod dispatcher;
pub mod job;
pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;
pub mod queue;
pub mod worker;

pub use dispatcher::{DispatchStatus, JobDispatcher};
pub use job::{
    JobId, JobKind, JobOutcome, JobPayload, JobPriority, JobRecord, JobRequest, JobState,
    ManagerSnapshotJob, SessionStepCleanJob,
};
pub use memory::InMemoryJobQueue;
#[cfg(feature = "database")]
pub use postgres::PostgresJobQueue;
pub use queue::{JobCompletionListener, JobLease, JobQueue, JobRuntime};
pub use worker::{JobWorkerPool, JobWorkerPoolBuilder};
