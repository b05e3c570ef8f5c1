use serde::{Deserialize, Serialize};

use crate::types::{SessionStep, StepState};

/// Signed difference between two versions of the same step.
///
/// Never clamped: an error that later resolves yields a negative `errors`
/// component and the running totals follow it down.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepDelta {
    pub input_related: i64,
    pub output_related: i64,
    pub errors: i64,
    pub waiting: i64,
    pub running: i64,
}

impl StepDelta {
    /// Delta contributed by a step seen for the first time.
    pub fn initial(step: &SessionStep) -> Self {
        Self {
            input_related: step.input_related,
            output_related: step.output_related,
            errors: step.state.errors,
            waiting: step.state.waiting,
            running: step.state.running,
        }
    }

    pub fn between(previous: &SessionStep, next: &SessionStep) -> Self {
        Self {
            input_related: next.input_related - previous.input_related,
            output_related: next.output_related - previous.output_related,
            errors: next.state.errors - previous.state.errors,
            waiting: next.state.waiting - previous.state.waiting,
            running: next.state.running - previous.state.running,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to_state(&self, state: StepState) -> StepState {
        StepState {
            errors: state.errors + self.errors,
            waiting: state.waiting + self.waiting,
            running: state.running + self.running,
        }
    }
}

impl std::ops::Add for StepDelta {
    type Output = StepDelta;

    fn add(self, rhs: StepDelta) -> StepDelta {
        StepDelta {
            input_related: self.input_related + rhs.input_related,
            output_related: self.output_related + rhs.output_related,
            errors: self.errors + rhs.errors,
            waiting: self.waiting + rhs.waiting,
            running: self.running + rhs.running,
        }
    }
}
