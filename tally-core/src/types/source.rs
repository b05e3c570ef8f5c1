use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    snapshot::delta::StepDelta,
    types::{ManagerState, StepState, StepType},
};

/// Running totals for one step type across every session of a source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceStepAggregation {
    pub step_type: StepType,
    pub total_in: i64,
    pub total_out: i64,
    pub state: StepState,
}

impl SourceStepAggregation {
    pub fn empty(step_type: StepType) -> Self {
        Self {
            step_type,
            total_in: 0,
            total_out: 0,
            state: StepState::default(),
        }
    }

    pub fn with_delta(self, delta: &StepDelta) -> Self {
        Self {
            step_type: self.step_type,
            total_in: self.total_in + delta.input_related,
            total_out: self.total_out + delta.output_related,
            state: delta.apply_to_state(self.state),
        }
    }
}

/// Aggregate for one source name.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub steps: BTreeMap<StepType, SourceStepAggregation>,
    pub nb_sessions: i64,
    pub manager_state: ManagerState,
    pub last_update_date: Option<DateTime<Utc>>,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: BTreeMap::new(),
            nb_sessions: 0,
            manager_state: ManagerState::default(),
            last_update_date: None,
        }
    }

    pub fn aggregation(&self, step_type: StepType) -> Option<&SourceStepAggregation> {
        self.steps.get(&step_type)
    }

    /// Folds one step delta into the per-type totals. Derived state is left
    /// alone until [`Source::finalize`] runs once at the end of a snapshot.
    pub fn with_delta(mut self, step_type: StepType, delta: &StepDelta, session_added: bool) -> Self {
        let current = self
            .steps
            .remove(&step_type)
            .unwrap_or_else(|| SourceStepAggregation::empty(step_type));
        self.steps.insert(step_type, current.with_delta(delta));
        if session_added {
            self.nb_sessions += 1;
        }
        self
    }

    pub fn finalize(mut self, last_update_date: DateTime<Utc>) -> Self {
        self.manager_state = ManagerState::from_states(self.steps.values().map(|agg| &agg.state));
        self.last_update_date = Some(match self.last_update_date {
            Some(current) => current.max(last_update_date),
            None => last_update_date,
        });
        self
    }
}
