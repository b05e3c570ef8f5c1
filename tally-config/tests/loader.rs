use std::{collections::HashMap, fs};

use tally_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, ConfigSource, ConfigWarning,
    models::sources::EnvConfig,
};
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> EnvConfig {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    EnvConfig::from_lookup(|key| map.get(key).cloned())
}

#[test]
fn toml_file_is_loaded_from_explicit_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tally.toml");
    fs::write(
        &path,
        r#"
        [service]
        name = "billing"

        [database]
        url = "postgres://tally@localhost/tally"

        [redis]
        url = "redis://localhost:6379"

        [[tenants]]
        name = "acme"

        [[tenants]]
        name = "beta"
        database_url = "postgres://tally@localhost/beta"

        [snapshot]
        process_page_size = 200
        "#,
    )
    .unwrap();

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .unwrap();
    let config = load.config;

    assert_eq!(config.metadata.source, ConfigSource::File(path));
    assert_eq!(config.service.name, "billing");
    assert_eq!(config.tenants.len(), 2);
    assert_eq!(
        config.tenant_database_url(&config.tenants[0]),
        Some("postgres://tally@localhost/tally")
    );
    assert_eq!(
        config.tenant_database_url(&config.tenants[1]),
        Some("postgres://tally@localhost/beta")
    );
    assert_eq!(config.snapshot.process_page_size, 200);
    assert_eq!(config.snapshot.step_page_size, 1_000);
    assert!(load.warnings.is_empty());
}

#[test]
fn json_file_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tally.json");
    fs::write(
        &path,
        r#"{"tenants":[{"name":"acme"}],"cleanup":{"enabled":false}}"#,
    )
    .unwrap();

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .unwrap()
        .config;

    assert_eq!(config.tenants[0].name, "acme");
    assert!(!config.cleanup.enabled);
}

#[test]
fn config_path_from_env_is_tracked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(&path, "[snapshot]\nscheduler_fixed_delay_ms = 4000\n").unwrap();
    let path_str = path.to_string_lossy().into_owned();

    let config = ConfigLoader::new()
        .with_env(env(&[
            ("TALLY_CONFIG_PATH", path_str.as_str()),
            ("TALLY_TENANTS", "acme,beta"),
        ]))
        .load()
        .unwrap()
        .config;

    assert_eq!(config.metadata.source, ConfigSource::EnvPath(path));
    assert_eq!(config.snapshot.scheduler_fixed_delay_ms, 4_000);
    assert_eq!(config.tenants.len(), 2);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_file_reports_its_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tally.toml");
    fs::write(&path, "[snapshot\n").unwrap();

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { path: p, .. } if p == path));
}

#[test]
fn duplicate_tenants_are_refused() {
    let err = ConfigLoader::new()
        .with_env(env(&[("TALLY_TENANTS", "acme,acme")]))
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::DuplicateTenant(name)) if name == "acme"
    ));
}

#[test]
fn non_postgres_database_url_is_refused() {
    let err = ConfigLoader::new()
        .with_env(env(&[("TALLY_DATABASE_URL", "mysql://localhost/tally")]))
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidUrl { what: "database", .. })
    ));
}

#[test]
fn short_lease_and_bad_env_values_warn() {
    let load = ConfigLoader::new()
        .with_env(env(&[
            ("TALLY_SNAPSHOT_FIXED_DELAY", "30s"),
            ("TALLY_SNAPSHOT_LEASE_MAX_DURATION", "10s"),
            ("TALLY_SNAPSHOT_STEP_PAGE_SIZE", "lots"),
        ]))
        .load()
        .unwrap();

    let warnings: Vec<_> = load.warnings.iter().cloned().collect();
    assert!(warnings.contains(&ConfigWarning::LeaseShorterThanFixedDelay {
        lease_ms: 10_000,
        fixed_delay_ms: 30_000,
    }));
    assert!(warnings.contains(&ConfigWarning::IgnoredEnvValue {
        key: "TALLY_SNAPSHOT_STEP_PAGE_SIZE".into(),
        value: "lots".into(),
    }));
    assert_eq!(load.config.snapshot.step_page_size, 1_000);
}

#[test]
fn finished_job_retention_comes_from_env_and_must_be_positive() {
    let load = ConfigLoader::new()
        .with_env(env(&[("TALLY_JOBS_FINISHED_RETENTION", "10m")]))
        .load()
        .unwrap();
    assert_eq!(load.config.jobs.finished_retention_ms, 600_000);

    let err = ConfigLoader::new()
        .with_env(env(&[("TALLY_JOBS_FINISHED_RETENTION", "0s")]))
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroValue {
            field: "finished_retention_ms"
        })
    ));
}
