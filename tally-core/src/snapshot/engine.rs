use std::{any::type_name_of_val, collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{MonitorError, Result},
    persistence::ports::{
        AggregateRepository, SessionStepRepository, SnapshotCommit, StepCursor, StepWindow,
    },
    types::{Session, SnapshotProcess, Source},
};

/// Result of one engine invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotOutcome {
    /// No step fell inside the window; nothing was written.
    NoChanges,
    Committed(SnapshotSummary),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotSummary {
    pub source: String,
    pub steps_processed: usize,
    pub sessions_touched: usize,
    pub sessions_added: i64,
    pub watermark: DateTime<Utc>,
}

/// Folds new step versions of one source into its session and source
/// aggregates.
///
/// All work happens on in-memory values; the only write is the final
/// [`AggregateRepository::commit`], so an error or a cancellation before it
/// leaves the store untouched.
#[derive(Clone)]
pub struct SnapshotEngine {
    steps: Arc<dyn SessionStepRepository>,
    aggregates: Arc<dyn AggregateRepository>,
    page_size: usize,
}

impl fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("steps", &type_name_of_val(self.steps.as_ref()))
            .field("aggregates", &type_name_of_val(self.aggregates.as_ref()))
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Aggregation state threaded through the page loop.
struct Accumulator {
    source: Source,
    sessions: HashMap<String, Session>,
    watermark: Option<DateTime<Utc>>,
    steps_processed: usize,
    sessions_added: i64,
}

impl SnapshotEngine {
    pub fn new(
        steps: Arc<dyn SessionStepRepository>,
        aggregates: Arc<dyn AggregateRepository>,
        page_size: usize,
    ) -> Self {
        Self {
            steps,
            aggregates,
            page_size: page_size.max(1),
        }
    }

    /// Aggregate every step of `process.source` updated in
    /// `(process.last_update_date, freeze_date]` and commit the result.
    pub async fn generate(
        &self,
        process: &SnapshotProcess,
        freeze_date: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SnapshotOutcome> {
        ensure_running(cancel, &process.source)?;

        let window = StepWindow::new(process.last_update_date, freeze_date);
        let source = self
            .aggregates
            .find_source(&process.source)
            .await?
            .unwrap_or_else(|| Source::new(&process.source));

        let mut acc = Accumulator {
            source,
            sessions: HashMap::new(),
            watermark: None,
            steps_processed: 0,
            sessions_added: 0,
        };

        let mut cursor: Option<StepCursor> = None;
        loop {
            let page = self
                .steps
                .find_in_window(&process.source, window, cursor.as_ref(), self.page_size)
                .await?;
            let page_len = page.len();
            cursor = page.last().map(StepCursor::after).or(cursor);

            for step in page {
                let session = match acc.sessions.remove(&step.session) {
                    Some(session) => session,
                    None => self
                        .aggregates
                        .find_session(&process.source, &step.session)
                        .await?
                        .unwrap_or_else(|| Session::new(&process.source, &step.session)),
                };

                let step_type = step.step_type;
                let updated_at = step.last_update_date;
                let change = session.with_step(step);

                acc.source = acc
                    .source
                    .with_delta(step_type, &change.delta, change.session_added);
                if change.session_added {
                    acc.sessions_added += 1;
                }
                acc.watermark = Some(acc.watermark.map_or(updated_at, |w| w.max(updated_at)));
                acc.steps_processed += 1;
                acc.sessions
                    .insert(change.session.name.clone(), change.session);
            }

            if page_len < self.page_size {
                break;
            }
            ensure_running(cancel, &process.source)?;
        }

        ensure_running(cancel, &process.source)?;

        let Some(watermark) = acc.watermark else {
            debug!(
                target: "snapshot::engine",
                source = %process.source,
                freeze_date = %freeze_date,
                "no step changes in window"
            );
            return Ok(SnapshotOutcome::NoChanges);
        };

        let summary = SnapshotSummary {
            source: process.source.clone(),
            steps_processed: acc.steps_processed,
            sessions_touched: acc.sessions.len(),
            sessions_added: acc.sessions_added,
            watermark,
        };

        self.aggregates
            .commit(SnapshotCommit {
                sessions: acc.sessions.into_values().collect(),
                source: acc.source.finalize(watermark),
                process: process.clone().advanced_to(watermark),
            })
            .await?;

        info!(
            target: "snapshot::engine",
            source = %summary.source,
            steps = summary.steps_processed,
            sessions = summary.sessions_touched,
            sessions_added = summary.sessions_added,
            watermark = %summary.watermark,
            "snapshot committed"
        );
        Ok(SnapshotOutcome::Committed(summary))
    }
}

fn ensure_running(cancel: &CancellationToken, source: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(MonitorError::Cancelled(format!("snapshot of source {source}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        persistence::memory::InMemoryMonitoringStore,
        persistence::ports::SessionStepRepository,
        types::{SessionStep, StepState, StepType},
    };

    fn t(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(offset)
    }

    fn engine(store: &Arc<InMemoryMonitoringStore>, page_size: usize) -> SnapshotEngine {
        SnapshotEngine::new(store.clone(), store.clone(), page_size)
    }

    #[tokio::test]
    async fn pages_smaller_than_input_still_cover_the_window() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        for i in 0..7 {
            store
                .upsert(
                    SessionStep::new("S1", format!("s{i}"), StepType::Storage, t(i))
                        .with_counts(1, 1)
                        .with_state(StepState::new(0, 1, 0)),
                )
                .await
                .unwrap();
        }

        let outcome = engine(&store, 3)
            .generate(&SnapshotProcess::new("S1"), t(100), &CancellationToken::new())
            .await
            .unwrap();

        let SnapshotOutcome::Committed(summary) = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(summary.steps_processed, 7);
        assert_eq!(summary.sessions_added, 7);
        assert_eq!(summary.watermark, t(6));

        let source = store.source("S1").await.unwrap();
        let agg = source.aggregation(StepType::Storage).unwrap();
        assert_eq!((agg.total_in, agg.total_out, agg.state.waiting), (7, 7, 7));
        assert_eq!(source.nb_sessions, 7);
        assert!(source.manager_state.waiting);
    }

    #[tokio::test]
    async fn cancelled_before_start_reads_nothing() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        store
            .upsert(SessionStep::new("S1", "a", StepType::Ingestion, t(0)))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine(&store, 10)
            .generate(&SnapshotProcess::new("S1"), t(10), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test]
    async fn steps_after_freeze_wait_for_the_next_run() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        store
            .upsert(SessionStep::new("S1", "a", StepType::Ingestion, t(0)).with_counts(1, 0))
            .await
            .unwrap();
        store
            .upsert(SessionStep::new("S1", "b", StepType::Ingestion, t(20)).with_counts(1, 0))
            .await
            .unwrap();

        let outcome = engine(&store, 10)
            .generate(&SnapshotProcess::new("S1"), t(10), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, SnapshotOutcome::Committed(ref s) if s.steps_processed == 1));
        assert_eq!(store.process("S1").await.unwrap().last_update_date, Some(t(0)));
        assert!(store.session("S1", "b").await.is_none());
    }
}
