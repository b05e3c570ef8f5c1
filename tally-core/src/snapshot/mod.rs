//! Session monitoring snapshots: scheduling, orchestration and the
//! incremental aggregation engine.

pub mod cleanup;
pub mod delta;
pub mod dispatcher;
pub mod engine;
pub mod markers;
pub mod orchestrator;
pub mod scheduler;

pub use cleanup::{CleanupTrigger, CleanupTriggerOutcome, SessionStepCleaner};
pub use delta::StepDelta;
pub use dispatcher::SnapshotJobDispatcher;
pub use engine::{SnapshotEngine, SnapshotOutcome, SnapshotSummary};
pub use markers::SnapshotMarkerReleaser;
pub use orchestrator::{SchedulePage, ScheduleReport, SnapshotOrchestrator};
pub use scheduler::{SnapshotScheduler, TenantTickOutcome, TickReport, snapshot_lease_name};
