use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    snapshot::delta::StepDelta,
    types::{SessionStep, StepState, StepType},
};

/// Derived flags shown for a session or a source.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    pub errors: bool,
    pub waiting: bool,
    pub running: bool,
}

impl ManagerState {
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a StepState>) -> Self {
        states
            .into_iter()
            .fold(ManagerState::default(), |acc, state| ManagerState {
                errors: acc.errors || state.errors > 0,
                waiting: acc.waiting || state.waiting > 0,
                running: acc.running || state.running > 0,
            })
    }
}

/// Aggregate for one (source, session name): the latest version of every
/// step type seen for it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub source: String,
    pub name: String,
    pub steps: BTreeMap<StepType, SessionStep>,
    pub manager_state: ManagerState,
    pub last_update_date: Option<DateTime<Utc>>,
}

/// Result of folding one step version into a session.
#[derive(Clone, Debug)]
pub struct SessionChange {
    pub session: Session,
    pub delta: StepDelta,
    /// No previous version of this step type existed in the session.
    pub new_step: bool,
    /// The session had no steps at all before this one.
    pub session_added: bool,
}

impl Session {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            steps: BTreeMap::new(),
            manager_state: ManagerState::default(),
            last_update_date: None,
        }
    }

    pub fn step(&self, step_type: StepType) -> Option<&SessionStep> {
        self.steps.get(&step_type)
    }

    /// Builds the next session value with `step` replacing whatever version of
    /// the same step type was held before.
    pub fn with_step(self, step: SessionStep) -> SessionChange {
        let Session {
            source,
            name,
            mut steps,
            last_update_date,
            ..
        } = self;

        let session_added = steps.is_empty();
        let (delta, new_step) = match steps.remove(&step.step_type) {
            Some(previous) => (StepDelta::between(&previous, &step), false),
            None => (StepDelta::initial(&step), true),
        };

        let last_update_date = Some(match last_update_date {
            Some(current) => current.max(step.last_update_date),
            None => step.last_update_date,
        });
        steps.insert(step.step_type, step);
        let manager_state = ManagerState::from_states(steps.values().map(|s| &s.state));

        SessionChange {
            session: Session {
                source,
                name,
                steps,
                manager_state,
                last_update_date,
            },
            delta,
            new_step,
            session_added: session_added && new_step,
        }
    }
}
