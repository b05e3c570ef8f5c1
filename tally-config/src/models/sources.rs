use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tally_core::config::{CleanupConfig, JobRuntimeConfig, SnapshotConfig};

use crate::util::{parse_bool, parse_csv, parse_duration};

use super::TenantConfig;

/// Raw configuration as defined in a TOML or JSON file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub service: FileServiceConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub tenants: Vec<FileTenantConfig>,
    pub snapshot: Option<SnapshotConfig>,
    pub jobs: Option<JobRuntimeConfig>,
    pub cleanup: Option<CleanupConfig>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServiceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileTenantConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

impl From<FileTenantConfig> for TenantConfig {
    fn from(value: FileTenantConfig) -> Self {
        TenantConfig {
            name: value.name,
            database_url: value.database_url,
        }
    }
}

/// Environment-derived configuration values.
///
/// Values that are present but unparsable are collected in `rejected` so the
/// loader can warn about them instead of failing.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub service_name: Option<String>,
    pub instance_id: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub tenants: Option<Vec<TenantConfig>>,
    pub snapshot_initial_delay: Option<Duration>,
    pub snapshot_fixed_delay: Option<Duration>,
    pub snapshot_lease_max_duration: Option<Duration>,
    pub snapshot_process_page_size: Option<usize>,
    pub snapshot_step_page_size: Option<usize>,
    pub jobs_workers: Option<usize>,
    pub jobs_poll_interval: Option<Duration>,
    pub jobs_lease_ttl: Option<Duration>,
    pub jobs_housekeeper_interval: Option<Duration>,
    pub jobs_finished_retention: Option<Duration>,
    pub cleanup_enabled: Option<bool>,
    pub cleanup_interval: Option<Duration>,
    pub cleanup_retention_days: Option<u32>,
    pub rejected: Vec<(String, String)>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut rejected = Vec::new();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut parsed = |key: &str, parse: &dyn Fn(&str) -> bool| -> Option<String> {
            let raw = get(key)?;
            if parse(&raw) {
                Some(raw)
            } else {
                rejected.push((key.to_string(), raw));
                None
            }
        };

        let duration = |raw: &str| parse_duration(raw).is_some();
        let number = |raw: &str| raw.trim().parse::<u64>().is_ok();
        let boolean = |raw: &str| parse_bool(raw).is_some();

        let snapshot_initial_delay =
            parsed("TALLY_SNAPSHOT_INITIAL_DELAY", &duration).and_then(|raw| parse_duration(&raw));
        let snapshot_fixed_delay =
            parsed("TALLY_SNAPSHOT_FIXED_DELAY", &duration).and_then(|raw| parse_duration(&raw));
        let snapshot_lease_max_duration = parsed("TALLY_SNAPSHOT_LEASE_MAX_DURATION", &duration)
            .and_then(|raw| parse_duration(&raw));
        let snapshot_process_page_size = parsed("TALLY_SNAPSHOT_PROCESS_PAGE_SIZE", &number)
            .and_then(|raw| raw.trim().parse().ok());
        let snapshot_step_page_size =
            parsed("TALLY_SNAPSHOT_STEP_PAGE_SIZE", &number).and_then(|raw| raw.trim().parse().ok());
        let jobs_workers =
            parsed("TALLY_JOBS_WORKERS", &number).and_then(|raw| raw.trim().parse().ok());
        let jobs_poll_interval =
            parsed("TALLY_JOBS_POLL_INTERVAL", &duration).and_then(|raw| parse_duration(&raw));
        let jobs_lease_ttl =
            parsed("TALLY_JOBS_LEASE_TTL", &duration).and_then(|raw| parse_duration(&raw));
        let jobs_housekeeper_interval = parsed("TALLY_JOBS_HOUSEKEEPER_INTERVAL", &duration)
            .and_then(|raw| parse_duration(&raw));
        let jobs_finished_retention = parsed("TALLY_JOBS_FINISHED_RETENTION", &duration)
            .and_then(|raw| parse_duration(&raw));
        let cleanup_enabled =
            parsed("TALLY_CLEANUP_ENABLED", &boolean).and_then(|raw| parse_bool(&raw));
        let cleanup_interval =
            parsed("TALLY_CLEANUP_INTERVAL", &duration).and_then(|raw| parse_duration(&raw));
        let cleanup_retention_days = parsed("TALLY_CLEANUP_RETENTION_DAYS", &number)
            .and_then(|raw| raw.trim().parse().ok());
        let database_max_connections = parsed("TALLY_DATABASE_MAX_CONNECTIONS", &number)
            .and_then(|raw| raw.trim().parse().ok());

        Self {
            config_path: get("TALLY_CONFIG_PATH").map(PathBuf::from),
            service_name: get("TALLY_SERVICE_NAME"),
            instance_id: get("TALLY_INSTANCE_ID"),
            database_url: get("TALLY_DATABASE_URL").or_else(|| get("DATABASE_URL")),
            database_max_connections,
            redis_url: get("TALLY_REDIS_URL").or_else(|| get("REDIS_URL")),
            tenants: get("TALLY_TENANTS").map(|raw| parse_tenants(&raw)),
            snapshot_initial_delay,
            snapshot_fixed_delay,
            snapshot_lease_max_duration,
            snapshot_process_page_size,
            snapshot_step_page_size,
            jobs_workers,
            jobs_poll_interval,
            jobs_lease_ttl,
            jobs_housekeeper_interval,
            jobs_finished_retention,
            cleanup_enabled,
            cleanup_interval,
            cleanup_retention_days,
            rejected,
        }
    }
}

/// `TALLY_TENANTS=acme=postgres://db/acme,beta` lists tenants, each with an
/// optional database URL.
pub fn parse_tenants(raw: &str) -> Vec<TenantConfig> {
    parse_csv(raw)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) => TenantConfig {
                name: name.trim().to_string(),
                database_url: Some(url.trim().to_string()).filter(|url| !url.is_empty()),
            },
            None => TenantConfig::new(entry),
        })
        .collect()
}
