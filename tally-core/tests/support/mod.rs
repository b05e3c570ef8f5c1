//! Shared fixtures for core integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use tally_core::types::{SessionStep, StepState, StepType};

/// Fixed origin so windows and watermarks are reproducible.
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(offset_secs)
}

/// Step version with counters `(in, out, errors, waiting, running)`.
pub fn step(
    source: &str,
    session: &str,
    step_type: StepType,
    counts: (i64, i64, i64, i64, i64),
    updated_at: DateTime<Utc>,
) -> SessionStep {
    let (input, output, errors, waiting, running) = counts;
    SessionStep::new(source, session, step_type, updated_at)
        .with_counts(input, output)
        .with_state(StepState::new(errors, waiting, running))
}

pub fn ingestion(session: &str, counts: (i64, i64, i64, i64, i64), updated_at: DateTime<Utc>) -> SessionStep {
    step("S1", session, StepType::Ingestion, counts, updated_at)
}
