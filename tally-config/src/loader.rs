use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    models::{
        Config, ConfigMetadata, ConfigSource, DEFAULT_TENANT, DatabaseConfig, RedisConfig,
        ServiceConfig, TenantConfig,
        sources::{EnvConfig, FileConfig},
    },
    util::duration_ms,
    validation::{self, ConfigGuardRailError, ConfigWarning, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 3] = ["tally.toml", "config/tally.toml", "tally.json"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Composes the effective [`Config`]: environment over file over defaults.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: Option<EnvConfig>,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options, env: None }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Use `env` instead of reading `.env` and the process environment.
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env, env_file_loaded) = match &self.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather(), loaded)
            }
        };

        let (file_config, source) = self.load_file_config(&env)?;
        let (config, warnings) = compose_config(
            file_config,
            env,
            ConfigMetadata {
                source,
                env_file_loaded,
            },
        )?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match result {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, ConfigSource), ConfigLoadError> {
        let (path, source) = if let Some(explicit) = &self.options.config_path {
            (explicit.clone(), ConfigSource::File(explicit.clone()))
        } else if let Some(from_env) = &env.config_path {
            (from_env.clone(), ConfigSource::EnvPath(from_env.clone()))
        } else {
            match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(found) => (found.clone(), ConfigSource::File(found)),
                None => return Ok((None, ConfigSource::Default)),
            }
        };

        if !path.exists() {
            return Err(ConfigLoadError::MissingConfig { path });
        }
        let file_config = read_file_config(&path)?;
        debug!(target: "config", path = %path.display(), "configuration file loaded");
        Ok((Some(file_config), source))
    }
}

/// Parse a TOML or JSON configuration file, chosen by extension.
pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&contents).map_err(|source| ConfigLoadError::ParseJson {
            path: path.to_path_buf(),
            source,
        })
    } else {
        toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn compose_config(
    file: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();
    for (key, value) in &env.rejected {
        warnings.push(ConfigWarning::IgnoredEnvValue {
            key: key.clone(),
            value: value.clone(),
        });
    }

    let FileConfig {
        service: file_service,
        database: file_database,
        redis: file_redis,
        tenants: file_tenants,
        snapshot: file_snapshot,
        jobs: file_jobs,
        cleanup: file_cleanup,
    } = file.unwrap_or_default();

    let service_defaults = ServiceConfig::default();
    let service = ServiceConfig {
        name: env
            .service_name
            .clone()
            .or(file_service.name)
            .unwrap_or(service_defaults.name),
        instance_id: env
            .instance_id
            .clone()
            .or(file_service.instance_id)
            .unwrap_or(service_defaults.instance_id),
    };

    let database_defaults = DatabaseConfig::default();
    let database = DatabaseConfig {
        url: env
            .database_url
            .clone()
            .or(file_database.url)
            .filter(|url| !url.trim().is_empty()),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(database_defaults.max_connections),
    };

    let redis = env
        .redis_url
        .clone()
        .map(|url| RedisConfig { url })
        .or_else(|| file_redis.map(|redis| RedisConfig { url: redis.url }));

    let mut tenants = env
        .tenants
        .clone()
        .unwrap_or_else(|| file_tenants.into_iter().map(TenantConfig::from).collect());
    if tenants.is_empty() {
        tenants.push(TenantConfig::new(DEFAULT_TENANT));
    }

    let mut snapshot = file_snapshot.unwrap_or_default();
    if let Some(delay) = env.snapshot_initial_delay {
        snapshot.scheduler_initial_delay_ms = duration_ms(delay);
    }
    if let Some(delay) = env.snapshot_fixed_delay {
        snapshot.scheduler_fixed_delay_ms = duration_ms(delay);
    }
    if let Some(lease) = env.snapshot_lease_max_duration {
        snapshot.lease_max_duration_ms = duration_ms(lease);
    }
    if let Some(size) = env.snapshot_process_page_size {
        snapshot.process_page_size = size;
    }
    if let Some(size) = env.snapshot_step_page_size {
        snapshot.step_page_size = size;
    }

    let mut jobs = file_jobs.unwrap_or_default();
    if let Some(workers) = env.jobs_workers {
        jobs.workers = workers;
    }
    if let Some(poll) = env.jobs_poll_interval {
        jobs.poll_interval_ms = duration_ms(poll);
    }
    if let Some(ttl) = env.jobs_lease_ttl {
        jobs.lease_ttl_ms = duration_ms(ttl);
    }
    if let Some(interval) = env.jobs_housekeeper_interval {
        jobs.housekeeper_interval_ms = duration_ms(interval);
    }
    if let Some(retention) = env.jobs_finished_retention {
        jobs.finished_retention_ms = duration_ms(retention);
    }

    let mut cleanup = file_cleanup.unwrap_or_default();
    if let Some(enabled) = env.cleanup_enabled {
        cleanup.enabled = enabled;
    }
    if let Some(interval) = env.cleanup_interval {
        cleanup.interval_ms = duration_ms(interval);
    }
    if let Some(days) = env.cleanup_retention_days {
        cleanup.step_retention_days = days;
    }

    let config = Config {
        service,
        database,
        redis,
        tenants,
        snapshot,
        jobs,
        cleanup,
        metadata,
    };

    warnings.items.extend(validation::validate(&config)?.items);
    Ok((config, warnings))
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse configuration {path}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
