pub mod ids;
pub mod session;
pub mod snapshot;
pub mod source;
pub mod step;

pub use ids::TenantId;
pub use session::{ManagerState, Session, SessionChange};
pub use snapshot::SnapshotProcess;
pub use source::{Source, SourceStepAggregation};
pub use step::{SessionStep, StepKey, StepState, StepType};
