use std::{collections::HashSet, fmt};

use thiserror::Error;
use url::Url;

use crate::models::Config;

/// Hard configuration errors. The service refuses to start on any of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("snapshot.{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("at least one tenant must be configured")]
    NoTenants,
    #[error("tenant names must be non-empty")]
    EmptyTenantName,
    #[error("tenant `{0}` is configured more than once")]
    DuplicateTenant(String),
    #[error("invalid {what} URL `{url}`: {reason}")]
    InvalidUrl {
        what: &'static str,
        url: String,
        reason: String,
    },
}

/// Soft findings surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The scheduling lease can lapse between two ticks of the same replica.
    LeaseShorterThanFixedDelay { lease_ms: u64, fixed_delay_ms: u64 },
    /// Jobs run longer than their worker lease can be renewed for.
    JobLeaseShorterThanPoll { lease_ttl_ms: u64, poll_ms: u64 },
    /// An environment variable held a value that could not be parsed.
    IgnoredEnvValue { key: String, value: String },
    /// Multiple replicas without Redis cannot share scheduling leases.
    NoDistributedLease,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::LeaseShorterThanFixedDelay {
                lease_ms,
                fixed_delay_ms,
            } => write!(
                f,
                "snapshot lease ({lease_ms}ms) is shorter than the scheduler fixed delay ({fixed_delay_ms}ms)"
            ),
            ConfigWarning::JobLeaseShorterThanPoll {
                lease_ttl_ms,
                poll_ms,
            } => write!(
                f,
                "job lease ttl ({lease_ttl_ms}ms) is not longer than twice the poll interval ({poll_ms}ms)"
            ),
            ConfigWarning::IgnoredEnvValue { key, value } => {
                write!(f, "ignoring unparsable value `{value}` for {key}")
            }
            ConfigWarning::NoDistributedLease => {
                write!(f, "no Redis configured; scheduling leases are process-local")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, warning: ConfigWarning) {
        self.items.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Enforce guard rails and collect warnings.
pub fn validate(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let snapshot = &config.snapshot;
    for (field, value) in [
        ("process_page_size", snapshot.process_page_size as u64),
        ("step_page_size", snapshot.step_page_size as u64),
        ("scheduler_fixed_delay_ms", snapshot.scheduler_fixed_delay_ms),
        ("lease_max_duration_ms", snapshot.lease_max_duration_ms),
        ("finished_retention_ms", config.jobs.finished_retention_ms),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroValue { field });
        }
    }

    if config.tenants.is_empty() {
        return Err(ConfigGuardRailError::NoTenants);
    }
    let mut seen = HashSet::new();
    for tenant in &config.tenants {
        if tenant.name.trim().is_empty() {
            return Err(ConfigGuardRailError::EmptyTenantName);
        }
        if !seen.insert(tenant.name.as_str()) {
            return Err(ConfigGuardRailError::DuplicateTenant(tenant.name.clone()));
        }
        if let Some(url) = config.tenant_database_url(tenant) {
            check_url("database", url, &["postgres", "postgresql"])?;
        }
    }
    if let Some(redis) = &config.redis {
        check_url("redis", &redis.url, &["redis", "rediss"])?;
    }

    let mut warnings = ConfigWarnings::default();
    if snapshot.lease_max_duration_ms < snapshot.scheduler_fixed_delay_ms {
        warnings.push(ConfigWarning::LeaseShorterThanFixedDelay {
            lease_ms: snapshot.lease_max_duration_ms,
            fixed_delay_ms: snapshot.scheduler_fixed_delay_ms,
        });
    }
    if config.jobs.lease_ttl_ms <= config.jobs.poll_interval_ms.saturating_mul(2) {
        warnings.push(ConfigWarning::JobLeaseShorterThanPoll {
            lease_ttl_ms: config.jobs.lease_ttl_ms,
            poll_ms: config.jobs.poll_interval_ms,
        });
    }
    if config.redis.is_none() {
        warnings.push(ConfigWarning::NoDistributedLease);
    }
    Ok(warnings)
}

fn check_url(what: &'static str, raw: &str, schemes: &[&str]) -> Result<(), ConfigGuardRailError> {
    let invalid = |reason: String| ConfigGuardRailError::InvalidUrl {
        what,
        url: redact(raw),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(format!("expected scheme {}", schemes.join(" or "))));
    }
    Ok(())
}

/// Drop credentials before a URL ends up in an error message.
fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}
