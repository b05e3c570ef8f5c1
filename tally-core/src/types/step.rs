use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

/// Pipeline stage a step belongs to. Aggregations are kept per stage.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Acquisition,
    Ingestion,
    Referencing,
    Storage,
    Dissemination,
}

impl StepType {
    pub const ALL: [StepType; 5] = [
        StepType::Acquisition,
        StepType::Ingestion,
        StepType::Referencing,
        StepType::Storage,
        StepType::Dissemination,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Acquisition => "ACQUISITION",
            StepType::Ingestion => "INGESTION",
            StepType::Referencing => "REFERENCING",
            StepType::Storage => "STORAGE",
            StepType::Dissemination => "DISSEMINATION",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = MonitorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| {
                MonitorError::InvalidInput(format!("unknown step type {raw}"))
            })
    }
}

/// Live state counters reported by a producer for one step.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StepState {
    pub errors: i64,
    pub waiting: i64,
    pub running: i64,
}

impl StepState {
    pub fn new(errors: i64, waiting: i64, running: i64) -> Self {
        Self {
            errors,
            waiting,
            running,
        }
    }
}

/// One version of the progress record for a (source, session, step type).
///
/// Producers replace the record in place; the snapshot engine only ever reads
/// versions and never mutates them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionStep {
    pub source: String,
    pub session: String,
    pub step_type: StepType,
    pub input_related: i64,
    pub output_related: i64,
    pub state: StepState,
    /// Timestamp of this version, set by the producer.
    pub last_update_date: DateTime<Utc>,
    /// Write time in the step store.
    pub registration_date: DateTime<Utc>,
}

impl SessionStep {
    pub fn new(
        source: impl Into<String>,
        session: impl Into<String>,
        step_type: StepType,
        last_update_date: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            session: session.into(),
            step_type,
            input_related: 0,
            output_related: 0,
            state: StepState::default(),
            last_update_date,
            registration_date: last_update_date,
        }
    }

    pub fn with_counts(mut self, input_related: i64, output_related: i64) -> Self {
        self.input_related = input_related;
        self.output_related = output_related;
        self
    }

    pub fn with_state(mut self, state: StepState) -> Self {
        self.state = state;
        self
    }

    pub fn registered_at(mut self, registration_date: DateTime<Utc>) -> Self {
        self.registration_date = registration_date;
        self
    }

    /// Replace-semantics identity within a source.
    pub fn key(&self) -> StepKey {
        StepKey {
            session: self.session.clone(),
            step_type: self.step_type,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub session: String,
    pub step_type: StepType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_type_parses_case_insensitively() {
        assert_eq!("ingestion".parse::<StepType>().unwrap(), StepType::Ingestion);
        assert_eq!("STORAGE".parse::<StepType>().unwrap(), StepType::Storage);
        assert!("bogus".parse::<StepType>().is_err());
    }

    #[test]
    fn step_type_serializes_upper_snake() {
        let json = serde_json::to_string(&StepType::Dissemination).unwrap();
        assert_eq!(json, "\"DISSEMINATION\"");
    }
}
