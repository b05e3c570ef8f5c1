use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::JobPriority;

/// Knobs for the snapshot pipeline. Every field has a default so partial
/// configuration payloads deserialize cleanly.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    /// Scheduler cadence, lease and paging for snapshot runs.
    pub snapshot: SnapshotConfig,
    /// Worker pool sizing and lease policy for the job runtime.
    pub jobs: JobRuntimeConfig,
    /// Periodic deletion of old step versions.
    pub cleanup: CleanupConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Delay before the first scheduler tick (ms).
    pub scheduler_initial_delay_ms: u64,
    /// Delay between the end of one tick and the start of the next (ms).
    pub scheduler_fixed_delay_ms: u64,
    /// Upper bound a replica may hold the per-tenant scheduler lease (ms).
    pub lease_max_duration_ms: u64,
    /// Idle snapshot processes examined per orchestrator page.
    pub process_page_size: usize,
    /// Step versions fetched per engine page.
    pub step_page_size: usize,
    /// Priority band used for every snapshot job.
    pub job_priority: JobPriority,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            scheduler_initial_delay_ms: 10_000,
            scheduler_fixed_delay_ms: 2_000,
            lease_max_duration_ms: 60_000,
            process_page_size: 1_000,
            step_page_size: 1_000,
            job_priority: JobPriority::P1,
        }
    }
}

impl SnapshotConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.scheduler_initial_delay_ms)
    }

    pub fn fixed_delay(&self) -> Duration {
        Duration::from_millis(self.scheduler_fixed_delay_ms)
    }

    pub fn lease_max_duration(&self) -> Duration {
        Duration::from_millis(self.lease_max_duration_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRuntimeConfig {
    /// Worker tasks per tenant.
    pub workers: usize,
    /// Idle poll interval for workers and the cancel-request watcher (ms).
    pub poll_interval_ms: u64,
    /// TTL for a worker's lease on a running job (ms); renewed at half-life.
    pub lease_ttl_ms: u64,
    /// Cadence for expiring stale leases and purging finished jobs (ms).
    pub housekeeper_interval_ms: u64,
    /// How long succeeded, failed and cancelled jobs are kept (ms).
    pub finished_retention_ms: u64,
}

impl Default for JobRuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            lease_ttl_ms: 300_000,
            housekeeper_interval_ms: 15_000,
            finished_retention_ms: 60 * 60 * 1_000,
        }
    }
}

impl JobRuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_ttl_ms as i64)
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }

    pub fn finished_retention(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.finished_retention_ms as i64)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// How often a cleanup job is submitted per tenant (ms).
    pub interval_ms: u64,
    /// Step versions last updated longer ago than this are deleted.
    pub step_retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 24 * 60 * 60 * 1_000,
            step_retention_days: 30,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.step_retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SnapshotConfig::default();
        assert_eq!(cfg.initial_delay(), Duration::from_secs(10));
        assert_eq!(cfg.fixed_delay(), Duration::from_secs(2));
        assert_eq!(cfg.lease_max_duration(), Duration::from_secs(60));
        assert_eq!(cfg.process_page_size, 1_000);
        assert_eq!(cfg.step_page_size, 1_000);
    }

    #[test]
    fn partial_payload_keeps_defaults() {
        let cfg: MonitorConfig =
            serde_json::from_str(r#"{"snapshot":{"step_page_size":50}}"#).unwrap();
        assert_eq!(cfg.snapshot.step_page_size, 50);
        assert_eq!(cfg.snapshot.process_page_size, 1_000);
        assert_eq!(cfg.jobs.workers, 4);
        assert_eq!(cfg.jobs.finished_retention(), chrono::Duration::hours(1));
        assert!(cfg.cleanup.enabled);
    }
}
