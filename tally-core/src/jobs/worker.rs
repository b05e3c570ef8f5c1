use std::{any::type_name_of_val, fmt, sync::Arc};

use chrono::Utc;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::JobRuntimeConfig,
    error::{MonitorError, Result},
    jobs::{
        dispatcher::{DispatchStatus, JobDispatcher},
        job::{JobId, JobRecord},
        queue::{JobCompletionListener, JobLease, JobQueue},
    },
    types::TenantId,
};

struct WorkerShared {
    tenant: TenantId,
    config: JobRuntimeConfig,
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<dyn JobDispatcher>,
    listeners: Vec<Arc<dyn JobCompletionListener>>,
}

impl WorkerShared {
    async fn notify(&self, record: &JobRecord) {
        for listener in &self.listeners {
            listener.on_terminal(record).await;
        }
    }

    /// Lease and execute at most one job. Returns `false` when the queue was
    /// empty.
    async fn run_one(&self, worker_id: &str, shutdown: &CancellationToken) -> Result<bool> {
        let Some(lease) = self
            .queue
            .lease_next(worker_id, self.config.lease_ttl())
            .await?
        else {
            return Ok(false);
        };

        let job_id = lease.job.id;
        let kind = lease.job.kind();
        debug!(
            target: "jobs::worker",
            tenant = %self.tenant,
            worker = %worker_id,
            job_id = %job_id,
            kind = %kind,
            "job leased"
        );

        let job_token = shutdown.child_token();
        let done = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(&lease, job_token.clone(), done.clone());

        let status = self.dispatcher.dispatch(&lease, &job_token).await;
        done.cancel();
        if let Err(err) = heartbeat.await {
            warn!(target: "jobs::worker", job_id = %job_id, "heartbeat task failed: {err}");
        }

        match &status {
            DispatchStatus::Success => {
                debug!(target: "jobs::worker", job_id = %job_id, kind = %kind, "job succeeded")
            }
            DispatchStatus::Failed { error } => {
                warn!(target: "jobs::worker", job_id = %job_id, kind = %kind, error = %error, "job failed")
            }
            DispatchStatus::Cancelled { reason } => {
                info!(target: "jobs::worker", job_id = %job_id, kind = %kind, reason = %reason, "job cancelled")
            }
        }

        match self.queue.finish(job_id, status.into_outcome()).await {
            Ok(record) => self.notify(&record).await,
            Err(MonitorError::Conflict(msg)) => {
                // The housekeeper already expired this lease and notified.
                warn!(target: "jobs::worker", job_id = %job_id, "finish skipped: {msg}");
            }
            Err(err) => return Err(err),
        }
        Ok(true)
    }

    /// Expire stale leases, notifying listeners, then drop finished jobs
    /// older than the retention window.
    async fn housekeep(&self) {
        match self.queue.expire_stale_leases().await {
            Ok(expired) => {
                for record in &expired {
                    warn!(
                        target: "jobs::worker",
                        tenant = %self.tenant,
                        job_id = %record.id,
                        kind = %record.kind(),
                        "job lease expired"
                    );
                    self.notify(record).await;
                }
            }
            Err(err) => warn!(target: "jobs::worker", "housekeeper expire_stale_leases error: {err}"),
        }

        let before = Utc::now() - self.config.finished_retention();
        match self.queue.purge_finished(before).await {
            Ok(0) => {}
            Ok(purged) => debug!(target: "jobs::worker", tenant = %self.tenant, purged, "finished jobs purged"),
            Err(err) => warn!(target: "jobs::worker", "housekeeper purge_finished error: {err}"),
        }
    }

    /// Renews the lease at half-life and turns a stored cancel request into
    /// the job's cancellation token.
    fn spawn_heartbeat(
        &self,
        lease: &JobLease,
        job_token: CancellationToken,
        done: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let job_id: JobId = lease.job.id;
        let worker_id = lease.worker_id.clone();
        let ttl = self.config.lease_ttl();
        let poll = self.config.poll_interval();
        let mut expires_at = lease.expires_at;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }

                match queue.is_cancel_requested(job_id).await {
                    Ok(true) if !job_token.is_cancelled() => {
                        info!(target: "jobs::worker", job_id = %job_id, "cancel requested");
                        job_token.cancel();
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "jobs::worker", job_id = %job_id, "cancel poll failed: {err}")
                    }
                }

                if expires_at - Utc::now() < ttl / 2 {
                    match queue.renew(job_id, &worker_id, ttl).await {
                        Ok(next) => expires_at = next,
                        Err(MonitorError::NotFound(_)) => break,
                        Err(err) => {
                            warn!(target: "jobs::worker", job_id = %job_id, "lease renew failed: {err}")
                        }
                    }
                }
            }
        })
    }
}

/// Per-tenant pool of workers draining a [`JobQueue`] through a
/// [`JobDispatcher`], plus a housekeeper expiring stale leases.
pub struct JobWorkerPool {
    shared: Arc<WorkerShared>,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for JobWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("JobWorkerPool")
            .field("tenant", &self.shared.tenant)
            .field("config", &self.shared.config)
            .field("dispatcher_type", &type_name_of_val(self.shared.dispatcher.as_ref()))
            .field("listener_count", &self.shared.listeners.len())
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl JobWorkerPool {
    pub fn builder(
        tenant: TenantId,
        queue: Arc<dyn JobQueue>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> JobWorkerPoolBuilder {
        JobWorkerPoolBuilder {
            tenant,
            config: JobRuntimeConfig::default(),
            queue,
            dispatcher,
            listeners: Vec::new(),
            shutdown_token: None,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.shared.tenant
    }

    /// Run a single job on the caller's task. Used by one-shot tooling and
    /// tests that need deterministic ordering.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool> {
        self.shared.run_one(worker_id, &self.shutdown_token).await
    }

    pub async fn start(&self) {
        self.spawn_workers().await;
        self.spawn_housekeeper().await;
        info!(
            target: "jobs::worker",
            tenant = %self.shared.tenant,
            workers = self.shared.config.workers,
            "job worker pool started"
        );
    }

    async fn spawn_workers(&self) {
        let worker_group = format!("{}-{}", self.shared.tenant, std::process::id());
        let mut handles = self.worker_handles.lock().await;

        for i in 0..self.shared.config.workers.max(1) {
            let worker_id = format!("{worker_group}-w{i}");
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown_token.clone();
            let poll = shared.config.poll_interval();

            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        debug!(target: "jobs::worker", "worker {} shutting down", worker_id);
                        break;
                    }

                    match shared.run_one(&worker_id, &shutdown).await {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(target: "jobs::worker", worker = %worker_id, "worker iteration failed: {err}");
                        }
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }));
        }
    }

    async fn spawn_housekeeper(&self) {
        let shared = Arc::clone(&self.shared);
        let interval = shared.config.housekeeper_interval();
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "jobs::worker", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => shared.housekeep().await,
                }
            }
        });

        self.worker_handles.lock().await.push(handle);
    }

    pub async fn shutdown(&self) {
        info!(target: "jobs::worker", tenant = %self.shared.tenant, "stopping job worker pool");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "jobs::worker", "worker task failed: {:?}", e),
                Err(_) => warn!(target: "jobs::worker", "worker task timed out during shutdown"),
            }
        }
    }
}

pub struct JobWorkerPoolBuilder {
    tenant: TenantId,
    config: JobRuntimeConfig,
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<dyn JobDispatcher>,
    listeners: Vec<Arc<dyn JobCompletionListener>>,
    shutdown_token: Option<CancellationToken>,
}

impl fmt::Debug for JobWorkerPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobWorkerPoolBuilder")
            .field("tenant", &self.tenant)
            .field("config", &self.config)
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

impl JobWorkerPoolBuilder {
    pub fn with_config(mut self, config: JobRuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobCompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Tie the pool to an outer shutdown signal; the pool cancels a child.
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown_token = Some(parent.child_token());
        self
    }

    pub fn build(self) -> JobWorkerPool {
        JobWorkerPool {
            shared: Arc::new(WorkerShared {
                tenant: self.tenant,
                config: self.config,
                queue: self.queue,
                dispatcher: self.dispatcher,
                listeners: self.listeners,
            }),
            shutdown_token: self.shutdown_token.unwrap_or_default(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::{
        job::{JobPayload, JobPriority, JobRequest, JobState, SessionStepCleanJob},
        memory::InMemoryJobQueue,
        queue::JobRuntime,
    };

    struct Scripted(DispatchStatus);

    #[async_trait]
    impl JobDispatcher for Scripted {
        async fn dispatch(&self, _lease: &JobLease, _cancel: &CancellationToken) -> DispatchStatus {
            self.0.clone()
        }
    }

    struct WaitForCancel;

    #[async_trait]
    impl JobDispatcher for WaitForCancel {
        async fn dispatch(&self, _lease: &JobLease, cancel: &CancellationToken) -> DispatchStatus {
            cancel.cancelled().await;
            DispatchStatus::Cancelled {
                reason: "cancel observed".into(),
            }
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl JobCompletionListener for Counting {
        async fn on_terminal(&self, _job: &JobRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request() -> JobRequest {
        JobRequest::new(
            JobPriority::P1,
            JobPayload::SessionStepClean(SessionStepCleanJob { cutoff: Utc::now() }),
        )
    }

    fn fast_config() -> JobRuntimeConfig {
        JobRuntimeConfig {
            workers: 1,
            poll_interval_ms: 10,
            lease_ttl_ms: 60_000,
            housekeeper_interval_ms: 50,
            finished_retention_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn run_once_records_outcome_and_notifies() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let listener = Arc::new(Counting::default());
        let pool = JobWorkerPool::builder(
            TenantId::from("t1"),
            queue.clone(),
            Arc::new(Scripted(DispatchStatus::Failed { error: "boom".into() })),
        )
        .with_config(fast_config())
        .with_listener(listener.clone())
        .build();

        let id = queue.submit(request()).await.unwrap();
        assert!(pool.run_once("w0").await.unwrap());
        assert!(!pool.run_once("w0").await.unwrap());

        let record = queue.get(id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runtime_cancel_reaches_running_dispatch() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(
            JobWorkerPool::builder(TenantId::from("t1"), queue.clone(), Arc::new(WaitForCancel))
                .with_config(fast_config())
                .build(),
        );

        let id = queue.submit(request()).await.unwrap();
        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run_once("w0").await })
        };

        while queue.job_state(id).await.unwrap() != Some(JobState::Running) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        queue.cancel(id).await.unwrap();

        let ran = tokio::time::timeout(std::time::Duration::from_secs(5), runner)
            .await
            .expect("dispatch observes cancel")
            .unwrap()
            .unwrap();
        assert!(ran);
        assert_eq!(queue.job_state(id).await.unwrap(), Some(JobState::Cancelled));
    }

    #[tokio::test]
    async fn housekeeping_purges_only_expired_finished_jobs() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let listener = Arc::new(Counting::default());
        let pool = JobWorkerPool::builder(
            TenantId::from("t1"),
            queue.clone(),
            Arc::new(Scripted(DispatchStatus::Success)),
        )
        .with_config(JobRuntimeConfig {
            finished_retention_ms: 0,
            ..fast_config()
        })
        .with_listener(listener.clone())
        .build();

        let finished = queue.submit(request()).await.unwrap();
        assert!(pool.run_once("w0").await.unwrap());
        let stale = queue.submit(request()).await.unwrap();
        queue
            .lease_next("gone", chrono::Duration::milliseconds(-1))
            .await
            .unwrap();
        let queued = queue.submit(request()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        pool.shared.housekeep().await;

        assert!(queue.get(finished).await.is_none());
        assert_eq!(queue.job_state(queued).await.unwrap(), Some(JobState::Queued));
        // Listeners hear about the expired lease before its record goes.
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert_ne!(queue.job_state(stale).await.unwrap(), Some(JobState::Running));

        let kept = JobWorkerPool::builder(
            TenantId::from("t1"),
            queue.clone(),
            Arc::new(Scripted(DispatchStatus::Success)),
        )
        .with_config(fast_config())
        .build();
        let recent = queue.submit(request()).await.unwrap();
        assert!(kept.run_once("w0").await.unwrap());
        kept.shared.housekeep().await;
        assert_eq!(queue.job_state(recent).await.unwrap(), Some(JobState::Succeeded));
    }

    #[tokio::test]
    async fn started_pool_drains_queue_and_stops() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let listener = Arc::new(Counting::default());
        let pool = JobWorkerPool::builder(
            TenantId::from("t1"),
            queue.clone(),
            Arc::new(Scripted(DispatchStatus::Success)),
        )
        .with_config(JobRuntimeConfig {
            workers: 2,
            ..fast_config()
        })
        .with_listener(listener.clone())
        .build();

        for _ in 0..5 {
            queue.submit(request()).await.unwrap();
        }
        pool.start().await;

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while listener.0.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all jobs complete");
        pool.shutdown().await;

        let states: Vec<_> = queue.all().await.into_iter().map(|job| job.state).collect();
        assert!(states.iter().all(|state| *state == JobState::Succeeded));
    }
}
