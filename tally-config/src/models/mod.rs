pub mod sources;

use std::path::PathBuf;

use tally_core::config::{CleanupConfig, JobRuntimeConfig, MonitorConfig, SnapshotConfig};

/// Tenant used when neither the file nor the environment lists any.
pub const DEFAULT_TENANT: &str = "default";
pub const DEFAULT_SERVICE_NAME: &str = "session-manager";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Effective configuration after merging defaults, file, environment and
/// command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub tenants: Vec<TenantConfig>,
    pub snapshot: SnapshotConfig,
    pub jobs: JobRuntimeConfig,
    pub cleanup: CleanupConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Connection URL for `tenant`, falling back to the shared database URL.
    pub fn tenant_database_url<'a>(&'a self, tenant: &'a TenantConfig) -> Option<&'a str> {
        tenant
            .database_url
            .as_deref()
            .or(self.database.url.as_deref())
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            snapshot: self.snapshot.clone(),
            jobs: self.jobs,
            cleanup: self.cleanup,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Prefix of every scheduling lease name.
    pub name: String,
    /// Identity of this replica in logs and job lease owners.
    pub instance_id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVICE_NAME.to_string(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::now_v7().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[suffix.len() - 8..])
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub name: String,
    pub database_url: Option<String>,
}

impl TenantConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database_url: None,
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    File(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}
