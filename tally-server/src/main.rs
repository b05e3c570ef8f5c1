//! # Tally Server
//!
//! Runs the session monitoring snapshot pipeline for a fixed set of tenants.
//!
//! ## Overview
//!
//! - **Scheduler**: per-tenant fixed-delay tick behind a named lease
//! - **Job workers**: execute snapshot and step cleanup jobs
//! - **Cleanup trigger**: periodic retention pass over step versions
//!
//! Each tenant owns a Postgres database (or an in-memory store with
//! `--in-memory`); Redis, when configured, backs the scheduling lease so
//! several replicas can run side by side.

mod bootstrap;
mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tally_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions, ConfigSource};
use tally_core::{
    jobs::JobWorkerPool,
    snapshot::{CleanupTrigger, SnapshotScheduler, TenantTickOutcome},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    bootstrap::{StoreMode, lease_service, tenant_directory, worker_pool},
    cli::{Cli, Command, DbCommand, GlobalArgs, RunOnceArgs, ServeArgs, SnapshotCommand},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.global.log_json)?;

    let config = load_config(&cli.global)?;

    match cli.command {
        None => serve(config, ServeArgs::default()).await,
        Some(Command::Serve(args)) => serve(config, args).await,
        Some(Command::Db {
            command: DbCommand::Migrate,
        }) => migrate(config).await,
        Some(Command::Snapshot {
            command: SnapshotCommand::RunOnce(args),
        }) => run_once(config, args).await,
    }
}

fn load_config(args: &GlobalArgs) -> anyhow::Result<Config> {
    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    args.apply(&mut config)
        .context("invalid command line overrides")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    match &config.metadata.source {
        ConfigSource::Default => info!("no configuration file; using environment and defaults"),
        ConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "configuration loaded from TALLY_CONFIG_PATH")
        }
        ConfigSource::File(path) => info!(path = %path.display(), "configuration loaded from file"),
    }
    for warning in warnings.iter() {
        warn!(message = %warning, "configuration warning");
    }

    info!(
        service = %config.service.name,
        instance = %config.service.instance_id,
        tenants = config.tenants.len(),
        snapshot.initial_delay_ms = config.snapshot.scheduler_initial_delay_ms,
        snapshot.fixed_delay_ms = config.snapshot.scheduler_fixed_delay_ms,
        snapshot.lease_max_duration_ms = config.snapshot.lease_max_duration_ms,
        jobs.workers = config.jobs.workers,
        cleanup.enabled = config.cleanup.enabled,
        "configuration in effect"
    );
    Ok(config)
}

async fn serve(config: Config, args: ServeArgs) -> anyhow::Result<()> {
    let mode = if args.in_memory {
        StoreMode::InMemory
    } else {
        StoreMode::Postgres {
            migrate: !args.skip_migrations,
        }
    };
    let directory = Arc::new(tenant_directory(&config, mode).await?);
    let leases = lease_service(&config).await?;
    let shutdown = CancellationToken::new();

    let pools: Vec<JobWorkerPool> = directory
        .contexts()
        .map(|context| worker_pool(context, &config, &shutdown))
        .collect();
    for pool in &pools {
        pool.start().await;
    }

    let scheduler = SnapshotScheduler::new(
        directory.clone(),
        leases,
        config.service.name.clone(),
        config.snapshot.clone(),
    );
    let scheduler_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let cleanup = CleanupTrigger::new(directory.clone(), config.cleanup);
    let cleanup_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { cleanup.run(shutdown).await }
    });

    info!(instance = %config.service.instance_id, "tally-server running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown requested");
    shutdown.cancel();

    for (name, task) in [("scheduler", scheduler_task), ("cleanup", cleanup_task)] {
        if let Err(err) = task.await {
            error!(task = name, "background task failed: {err}");
        }
    }
    for pool in &pools {
        pool.shutdown().await;
    }

    info!("tally-server stopped");
    Ok(())
}

async fn migrate(config: Config) -> anyhow::Result<()> {
    let directory = tenant_directory(&config, StoreMode::Postgres { migrate: true }).await?;
    info!(tenants = directory.len(), "migrations complete");
    Ok(())
}

async fn run_once(config: Config, args: RunOnceArgs) -> anyhow::Result<()> {
    let mode = if args.in_memory {
        StoreMode::InMemory
    } else {
        StoreMode::Postgres { migrate: false }
    };
    let directory = Arc::new(tenant_directory(&config, mode).await?);
    let leases = lease_service(&config).await?;

    let scheduler = SnapshotScheduler::new(
        directory.clone(),
        leases,
        config.service.name.clone(),
        config.snapshot.clone(),
    );
    let report = scheduler.tick().await.context("scheduler tick failed")?;

    for (tenant, outcome) in &report.tenants {
        match outcome {
            TenantTickOutcome::Scheduled(summary) => info!(
                tenant = %tenant,
                freeze_date = %report.freeze_date,
                examined = summary.examined,
                scheduled = summary.scheduled,
                failed = summary.failed,
                "snapshot jobs scheduled"
            ),
            TenantTickOutcome::CleanupActive => info!(tenant = %tenant, "skipped: step cleanup active"),
            TenantTickOutcome::LeaseBusy => info!(tenant = %tenant, "skipped: lease held elsewhere"),
            TenantTickOutcome::Failed(reason) => error!(tenant = %tenant, "tick failed: {reason}"),
        }
    }

    if args.drain {
        let shutdown = CancellationToken::new();
        let worker_id = format!("{}-run-once", config.service.instance_id);
        for context in directory.contexts() {
            let pool = worker_pool(context, &config, &shutdown);
            let mut executed = 0usize;
            while pool.run_once(&worker_id).await? {
                executed += 1;
            }
            info!(tenant = %context.tenant, executed, "queued jobs drained");
        }
    }
    Ok(())
}
