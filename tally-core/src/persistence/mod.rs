pub mod memory;
pub mod ports;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryMonitoringStore;
pub use ports::{
    AggregateRepository, SessionStepRepository, SnapshotCommit, SnapshotProcessRepository,
    StepCursor, StepWindow,
};
#[cfg(feature = "database")]
pub use postgres::PostgresMonitoringStore;
