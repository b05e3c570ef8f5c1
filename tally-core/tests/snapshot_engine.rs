mod support;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{
    persistence::{InMemoryMonitoringStore, SessionStepRepository, StepCursor, StepWindow},
    snapshot::{SnapshotEngine, SnapshotOutcome},
    types::{ManagerState, SessionStep, SnapshotProcess, StepType},
};
use tokio_util::sync::CancellationToken;

use support::{at, ingestion};

fn engine(store: &Arc<InMemoryMonitoringStore>) -> SnapshotEngine {
    SnapshotEngine::new(store.clone(), store.clone(), 1_000)
}

async fn stored_process(store: &InMemoryMonitoringStore) -> SnapshotProcess {
    store.process("S1").await.expect("process registered on upsert")
}

#[tokio::test]
async fn two_runs_track_ingestion_totals() -> Result<()> {
    let store = Arc::new(InMemoryMonitoringStore::new());
    let (t1, t2, t3, t4, t5) = (at(1), at(2), at(3), at(4), at(5));
    store.upsert(ingestion("sessA", (10, 8, 1, 0, 1), t1)).await?;
    store.upsert(ingestion("sessB", (5, 5, 0, 0, 0), t2)).await?;

    let run1 = engine(&store)
        .generate(&stored_process(&store).await, t3, &CancellationToken::new())
        .await?;
    assert!(matches!(run1, SnapshotOutcome::Committed(ref s) if s.watermark == t2));

    let source = store.source("S1").await.expect("source committed");
    let agg = source.aggregation(StepType::Ingestion).expect("ingestion aggregated");
    assert_eq!((agg.total_in, agg.total_out), (15, 13));
    assert_eq!((agg.state.errors, agg.state.waiting, agg.state.running), (1, 0, 1));
    assert_eq!(source.nb_sessions, 2);
    assert_eq!(source.last_update_date, Some(t2));
    assert_eq!(
        source.manager_state,
        ManagerState {
            errors: true,
            waiting: false,
            running: true
        }
    );
    assert_eq!(stored_process(&store).await.last_update_date, Some(t2));

    store.upsert(ingestion("sessA", (10, 10, 0, 0, 0), t4)).await?;

    let process = stored_process(&store).await;
    assert_eq!(process.last_update_date, Some(t2));
    engine(&store)
        .generate(&process, t5, &CancellationToken::new())
        .await?;

    let source = store.source("S1").await.expect("source committed");
    let agg = source.aggregation(StepType::Ingestion).expect("ingestion aggregated");
    assert_eq!((agg.total_in, agg.total_out), (15, 15));
    assert_eq!((agg.state.errors, agg.state.waiting, agg.state.running), (0, 0, 0));
    assert_eq!(source.nb_sessions, 2);
    assert_eq!(source.last_update_date, Some(t4));
    assert_eq!(source.manager_state, ManagerState::default());
    assert_eq!(stored_process(&store).await.last_update_date, Some(t4));

    let sess_a = store.session("S1", "sessA").await.expect("session stored");
    assert_eq!(sess_a.step(StepType::Ingestion).map(|s| s.output_related), Some(10));
    assert!(!sess_a.manager_state.errors);
    Ok(())
}

#[tokio::test]
async fn updated_step_moves_totals_by_its_delta() -> Result<()> {
    let store = Arc::new(InMemoryMonitoringStore::new());
    store.upsert(ingestion("sessA", (10, 8, 1, 0, 1), at(1))).await?;
    engine(&store)
        .generate(&stored_process(&store).await, at(2), &CancellationToken::new())
        .await?;
    let before = store
        .source("S1")
        .await
        .and_then(|s| s.aggregation(StepType::Ingestion).cloned())
        .expect("first aggregation");

    store.upsert(ingestion("sessA", (10, 10, 0, 0, 0), at(3))).await?;
    engine(&store)
        .generate(&stored_process(&store).await, at(4), &CancellationToken::new())
        .await?;
    let after = store
        .source("S1")
        .await
        .and_then(|s| s.aggregation(StepType::Ingestion).cloned())
        .expect("second aggregation");

    assert_eq!(after.total_in - before.total_in, 0);
    assert_eq!(after.total_out - before.total_out, 2);
    assert_eq!(after.state.errors - before.state.errors, -1);
    assert_eq!(after.state.waiting - before.state.waiting, 0);
    assert_eq!(after.state.running - before.state.running, -1);
    Ok(())
}

async fn seeded(steps: &[SessionStep]) -> Result<Arc<InMemoryMonitoringStore>> {
    let store = Arc::new(InMemoryMonitoringStore::new());
    for step in steps {
        store.upsert(step.clone()).await?;
    }
    Ok(store)
}

#[tokio::test]
async fn split_window_matches_single_window() -> Result<()> {
    let steps = [
        ingestion("sessA", (3, 1, 0, 1, 0), at(1)),
        support::step("S1", "sessA", StepType::Storage, (1, 0, 0, 0, 1), at(2)),
        ingestion("sessB", (7, 7, 2, 0, 0), at(4)),
        ingestion("sessC", (1, 0, 0, 0, 1), at(6)),
    ];
    let (f1, f2) = (at(3), at(10));

    let once = seeded(&steps).await?;
    engine(&once)
        .generate(&stored_process(&once).await, f2, &CancellationToken::new())
        .await?;

    let twice = seeded(&steps).await?;
    engine(&twice)
        .generate(&stored_process(&twice).await, f1, &CancellationToken::new())
        .await?;
    assert_eq!(stored_process(&twice).await.last_update_date, Some(at(2)));
    engine(&twice)
        .generate(&stored_process(&twice).await, f2, &CancellationToken::new())
        .await?;

    assert_eq!(once.source("S1").await, twice.source("S1").await);
    assert_eq!(once.sessions_of("S1").await, twice.sessions_of("S1").await);
    assert_eq!(stored_process(&once).await, stored_process(&twice).await);
    Ok(())
}

#[tokio::test]
async fn empty_window_commits_nothing() -> Result<()> {
    let store = Arc::new(InMemoryMonitoringStore::new());
    store.upsert(ingestion("sessA", (1, 1, 0, 0, 0), at(1))).await?;
    engine(&store)
        .generate(&stored_process(&store).await, at(2), &CancellationToken::new())
        .await?;
    assert_eq!(store.commit_count().await, 1);

    let outcome = engine(&store)
        .generate(&stored_process(&store).await, at(5), &CancellationToken::new())
        .await?;

    assert_eq!(outcome, SnapshotOutcome::NoChanges);
    assert_eq!(store.commit_count().await, 1);
    assert_eq!(stored_process(&store).await.last_update_date, Some(at(1)));
    Ok(())
}

/// Step store that signals cancellation while serving a given page.
struct CancelOnPage {
    inner: Arc<InMemoryMonitoringStore>,
    cancel: CancellationToken,
    cancel_on_call: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl SessionStepRepository for CancelOnPage {
    async fn find_in_window(
        &self,
        source: &str,
        window: StepWindow,
        cursor: Option<&StepCursor>,
        limit: usize,
    ) -> tally_core::Result<Vec<SessionStep>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.cancel_on_call {
            self.cancel.cancel();
        }
        self.inner.find_in_window(source, window, cursor, limit).await
    }

    async fn count_registered_between(
        &self,
        source: &str,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
    ) -> tally_core::Result<u64> {
        self.inner.count_registered_between(source, after, before).await
    }

    async fn upsert(&self, step: SessionStep) -> tally_core::Result<()> {
        self.inner.upsert(step).await
    }

    async fn delete_folded_before(&self, cutoff: DateTime<Utc>) -> tally_core::Result<u64> {
        self.inner.delete_folded_before(cutoff).await
    }
}

#[tokio::test]
async fn cancellation_mid_run_persists_nothing() -> Result<()> {
    let store = seeded(&[
        ingestion("sessA", (1, 0, 0, 1, 0), at(1)),
        ingestion("sessB", (2, 0, 0, 1, 0), at(2)),
        ingestion("sessC", (3, 0, 0, 1, 0), at(3)),
    ])
    .await?;
    let cancel = CancellationToken::new();
    let steps = Arc::new(CancelOnPage {
        inner: store.clone(),
        cancel: cancel.clone(),
        cancel_on_call: 2,
        calls: AtomicUsize::new(0),
    });

    let err = SnapshotEngine::new(steps.clone(), store.clone(), 1)
        .generate(&stored_process(&store).await, at(10), &cancel)
        .await
        .expect_err("run must stop on cancellation");

    assert!(err.is_cancelled());
    assert!(steps.calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(store.commit_count().await, 0);
    assert!(store.source("S1").await.is_none());
    assert!(store.sessions_of("S1").await.is_empty());
    assert_eq!(stored_process(&store).await.last_update_date, None);
    Ok(())
}
