use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::Result,
    jobs::JobId,
    persistence::ports::{
        AggregateRepository, SessionStepRepository, SnapshotCommit, SnapshotProcessRepository,
        StepCursor, StepWindow,
    },
    types::{Session, SessionStep, SnapshotProcess, Source, StepType},
};

type StepRowKey = (String, String, StepType);

#[derive(Debug, Default)]
struct MonitoringState {
    steps: BTreeMap<StepRowKey, SessionStep>,
    processes: BTreeMap<String, SnapshotProcess>,
    sessions: BTreeMap<(String, String), Session>,
    sources: BTreeMap<String, Source>,
    commits: u64,
}

/// Every monitoring store behind one lock, so a commit is atomic with
/// respect to readers.
#[derive(Debug, Default)]
pub struct InMemoryMonitoringStore {
    state: RwLock<MonitoringState>,
}

impl InMemoryMonitoringStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn source(&self, name: &str) -> Option<Source> {
        self.state.read().await.sources.get(name).cloned()
    }

    pub async fn session(&self, source: &str, name: &str) -> Option<Session> {
        self.state
            .read()
            .await
            .sessions
            .get(&(source.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn sessions_of(&self, source: &str) -> Vec<Session> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|session| session.source == source)
            .cloned()
            .collect()
    }

    pub async fn process(&self, source: &str) -> Option<SnapshotProcess> {
        self.state.read().await.processes.get(source).cloned()
    }

    pub async fn step_count(&self) -> usize {
        self.state.read().await.steps.len()
    }

    /// Number of successful aggregate commits so far.
    pub async fn commit_count(&self) -> u64 {
        self.state.read().await.commits
    }
}

#[async_trait]
impl SessionStepRepository for InMemoryMonitoringStore {
    async fn find_in_window(
        &self,
        source: &str,
        window: StepWindow,
        cursor: Option<&StepCursor>,
        limit: usize,
    ) -> Result<Vec<SessionStep>> {
        let state = self.state.read().await;
        let mut page: Vec<SessionStep> = state
            .steps
            .values()
            .filter(|step| step.source == source)
            .filter(|step| window.contains(step.last_update_date))
            .filter(|step| cursor.is_none_or(|c| c.precedes(step)))
            .cloned()
            .collect();
        page.sort_by(|a, b| {
            (a.last_update_date, &a.session, a.step_type).cmp(&(
                b.last_update_date,
                &b.session,
                b.step_type,
            ))
        });
        page.truncate(limit);
        Ok(page)
    }

    async fn count_registered_between(
        &self,
        source: &str,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .values()
            .filter(|step| step.source == source)
            .filter(|step| {
                after.is_none_or(|after| step.registration_date > after)
                    && step.registration_date < before
            })
            .count() as u64)
    }

    async fn upsert(&self, step: SessionStep) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .processes
            .entry(step.source.clone())
            .or_insert_with(|| SnapshotProcess::new(step.source.clone()));
        state.steps.insert(
            (step.source.clone(), step.session.clone(), step.step_type),
            step,
        );
        Ok(())
    }

    async fn delete_folded_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.state.write().await;
        let MonitoringState { steps, processes, .. } = &mut *guard;
        let before = steps.len();
        steps.retain(|_, step| {
            let folded = processes
                .get(&step.source)
                .and_then(|process| process.last_update_date)
                .is_some_and(|watermark| step.last_update_date <= watermark);
            !(folded && step.last_update_date < cutoff)
        });
        Ok((before - steps.len()) as u64)
    }
}

#[async_trait]
impl SnapshotProcessRepository for InMemoryMonitoringStore {
    async fn find_idle(&self, after_source: Option<&str>, limit: usize) -> Result<Vec<SnapshotProcess>> {
        let state = self.state.read().await;
        Ok(state
            .processes
            .values()
            .filter(|process| process.is_idle())
            .filter(|process| after_source.is_none_or(|after| process.source.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_running(&self, after_source: Option<&str>, limit: usize) -> Result<Vec<SnapshotProcess>> {
        let state = self.state.read().await;
        Ok(state
            .processes
            .values()
            .filter(|process| !process.is_idle())
            .filter(|process| after_source.is_none_or(|after| process.source.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_source(&self, source: &str) -> Result<Option<SnapshotProcess>> {
        Ok(self.state.read().await.processes.get(source).cloned())
    }

    async fn save(&self, process: &SnapshotProcess) -> Result<()> {
        self.state
            .write()
            .await
            .processes
            .insert(process.source.clone(), process.clone());
        Ok(())
    }

    async fn mark_running(&self, source: &str, job_id: JobId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.processes.get_mut(source) {
            Some(process) if process.is_idle() => {
                process.job_id = Some(job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_job(&self, source: &str, job_id: JobId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.processes.get_mut(source) {
            Some(process) if process.job_id == Some(job_id) => {
                process.job_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AggregateRepository for InMemoryMonitoringStore {
    async fn find_source(&self, name: &str) -> Result<Option<Source>> {
        Ok(self.state.read().await.sources.get(name).cloned())
    }

    async fn find_session(&self, source: &str, name: &str) -> Result<Option<Session>> {
        Ok(self.session(source, name).await)
    }

    async fn commit(&self, commit: SnapshotCommit) -> Result<()> {
        let SnapshotCommit {
            sessions,
            source,
            process,
        } = commit;
        let mut state = self.state.write().await;

        debug!(
            target: "snapshot::store",
            source = %source.name,
            sessions = sessions.len(),
            "committing snapshot"
        );
        for session in sessions {
            state
                .sessions
                .insert((session.source.clone(), session.name.clone()), session);
        }
        state.sources.insert(source.name.clone(), source);

        // The marker belongs to the job runtime; only the watermark moves here.
        let stored = state
            .processes
            .entry(process.source.clone())
            .or_insert_with(|| process.clone());
        stored.last_update_date = process.last_update_date;
        state.commits += 1;
        Ok(())
    }
}
