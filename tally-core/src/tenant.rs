//! Per-tenant wiring of stores and job runtime.

use std::{any::type_name_of_val, collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{MonitorError, Result},
    jobs::{InMemoryJobQueue, JobQueue, JobRuntime},
    persistence::{
        AggregateRepository, InMemoryMonitoringStore, SessionStepRepository,
        SnapshotProcessRepository,
    },
    types::TenantId,
};

/// Everything the snapshot pipeline touches for one tenant. Tenants never
/// share a store or a queue.
#[derive(Clone)]
pub struct TenantContext {
    pub tenant: TenantId,
    pub steps: Arc<dyn SessionStepRepository>,
    pub processes: Arc<dyn SnapshotProcessRepository>,
    pub aggregates: Arc<dyn AggregateRepository>,
    pub jobs: Arc<dyn JobRuntime>,
    pub queue: Arc<dyn JobQueue>,
}

impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("tenant", &self.tenant)
            .field("steps", &type_name_of_val(self.steps.as_ref()))
            .field("aggregates", &type_name_of_val(self.aggregates.as_ref()))
            .field("jobs", &type_name_of_val(self.jobs.as_ref()))
            .finish()
    }
}

/// In-memory tenant with direct handles on its stores.
#[derive(Clone, Debug)]
pub struct InMemoryTenant {
    pub context: TenantContext,
    pub store: Arc<InMemoryMonitoringStore>,
    pub queue: Arc<InMemoryJobQueue>,
}

impl TenantContext {
    pub fn in_memory(tenant: impl Into<TenantId>) -> InMemoryTenant {
        let store = Arc::new(InMemoryMonitoringStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let context = TenantContext {
            tenant: tenant.into(),
            steps: store.clone(),
            processes: store.clone(),
            aggregates: store.clone(),
            jobs: queue.clone(),
            queue: queue.clone(),
        };
        InMemoryTenant {
            context,
            store,
            queue,
        }
    }

    /// Postgres-backed tenant: one pool per tenant database.
    #[cfg(feature = "database")]
    pub async fn postgres(tenant: impl Into<TenantId>, pool: sqlx::PgPool) -> Result<Self> {
        use crate::{jobs::PostgresJobQueue, persistence::PostgresMonitoringStore};

        let store = Arc::new(PostgresMonitoringStore::new(pool.clone()));
        let queue = Arc::new(PostgresJobQueue::new(pool).await?);
        Ok(TenantContext {
            tenant: tenant.into(),
            steps: store.clone(),
            processes: store.clone(),
            aggregates: store,
            jobs: queue.clone(),
            queue,
        })
    }
}

/// Source of the tenants a scheduler tick iterates.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<TenantId>>;

    async fn context(&self, tenant: &TenantId) -> Result<TenantContext>;
}

/// Fixed tenant set resolved at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticTenantDirectory {
    contexts: BTreeMap<TenantId, TenantContext>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, context: TenantContext) -> Self {
        self.insert(context);
        self
    }

    pub fn insert(&mut self, context: TenantContext) {
        self.contexts.insert(context.tenant.clone(), context);
    }

    pub fn contexts(&self) -> impl Iterator<Item = &TenantContext> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn active_tenants(&self) -> Result<Vec<TenantId>> {
        Ok(self.contexts.keys().cloned().collect())
    }

    async fn context(&self, tenant: &TenantId) -> Result<TenantContext> {
        self.contexts
            .get(tenant)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(format!("tenant {tenant}")))
    }
}
