use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{MonitorError, Result},
    jobs::JobId,
    types::{
        ManagerState, Session, SessionStep, SnapshotProcess, Source, SourceStepAggregation,
        StepState,
    },
};

pub(super) const STEP_COLUMNS: &str = "source, session, step_type, input_related, \
     output_related, errors, waiting, running, last_update_date, registration_date";

#[derive(sqlx::FromRow)]
pub(super) struct StepRow {
    source: String,
    session: String,
    step_type: String,
    input_related: i64,
    output_related: i64,
    errors: i64,
    waiting: i64,
    running: i64,
    last_update_date: DateTime<Utc>,
    registration_date: DateTime<Utc>,
}

impl TryFrom<StepRow> for SessionStep {
    type Error = MonitorError;

    fn try_from(row: StepRow) -> Result<Self> {
        Ok(SessionStep {
            source: row.source,
            session: row.session,
            step_type: row.step_type.parse()?,
            input_related: row.input_related,
            output_related: row.output_related,
            state: StepState::new(row.errors, row.waiting, row.running),
            last_update_date: row.last_update_date,
            registration_date: row.registration_date,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct ProcessRow {
    source: String,
    last_update_date: Option<DateTime<Utc>>,
    job_id: Option<Uuid>,
}

impl From<ProcessRow> for SnapshotProcess {
    fn from(row: ProcessRow) -> Self {
        SnapshotProcess {
            source: row.source,
            last_update_date: row.last_update_date,
            job_id: row.job_id.map(JobId),
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct SessionRow {
    source: String,
    name: String,
    errors: bool,
    waiting: bool,
    running: bool,
    last_update_date: Option<DateTime<Utc>>,
    steps: serde_json::Value,
}

impl TryFrom<SessionRow> for Session {
    type Error = MonitorError;

    fn try_from(row: SessionRow) -> Result<Self> {
        let steps: Vec<SessionStep> = serde_json::from_value(row.steps)?;
        Ok(Session {
            source: row.source,
            name: row.name,
            steps: steps.into_iter().map(|step| (step.step_type, step)).collect(),
            manager_state: ManagerState {
                errors: row.errors,
                waiting: row.waiting,
                running: row.running,
            },
            last_update_date: row.last_update_date,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct SourceRow {
    pub(super) name: String,
    nb_sessions: i64,
    errors: bool,
    waiting: bool,
    running: bool,
    last_update_date: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
pub(super) struct AggregationRow {
    step_type: String,
    total_in: i64,
    total_out: i64,
    errors: i64,
    waiting: i64,
    running: i64,
}

impl TryFrom<AggregationRow> for SourceStepAggregation {
    type Error = MonitorError;

    fn try_from(row: AggregationRow) -> Result<Self> {
        Ok(SourceStepAggregation {
            step_type: row.step_type.parse()?,
            total_in: row.total_in,
            total_out: row.total_out,
            state: StepState::new(row.errors, row.waiting, row.running),
        })
    }
}

pub(super) fn source_from_rows(row: SourceRow, aggregations: Vec<AggregationRow>) -> Result<Source> {
    let steps = aggregations
        .into_iter()
        .map(|agg| SourceStepAggregation::try_from(agg).map(|agg| (agg.step_type, agg)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(Source {
        name: row.name,
        steps,
        nb_sessions: row.nb_sessions,
        manager_state: ManagerState {
            errors: row.errors,
            waiting: row.waiting,
            running: row.running,
        },
        last_update_date: row.last_update_date,
    })
}
