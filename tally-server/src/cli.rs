use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tally_config::{Config, ConfigGuardRailError, models::sources::parse_tenants, validation};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "tally-server")]
#[command(about = "Incremental session/source snapshot scheduler and job workers", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (TOML or JSON); overrides TALLY_CONFIG_PATH
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Dotenv file to load instead of ./.env
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Service name used as the scheduling lease prefix
    #[arg(long, global = true)]
    pub service_name: Option<String>,

    /// Tenant to serve, optionally `name=postgres://...`; repeatable
    #[arg(long = "tenant", global = true)]
    pub tenants: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TALLY_LOG_JSON")]
    pub log_json: bool,
}

impl GlobalArgs {
    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigGuardRailError> {
        if let Some(name) = &self.service_name {
            config.service.name = name.clone();
        }
        if !self.tenants.is_empty() {
            config.tenants = self
                .tenants
                .iter()
                .flat_map(|raw| parse_tenants(raw))
                .collect();
        }
        validation::validate(config).map(|_| ())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler, cleanup trigger and job workers (default)
    Serve(ServeArgs),
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Snapshot operations
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Keep every tenant in process memory instead of Postgres
    #[arg(long)]
    pub in_memory: bool,

    /// Skip applying migrations at startup
    #[arg(long)]
    pub skip_migrations: bool,
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Apply migrations for every configured tenant
    Migrate,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Run a single scheduler tick for every tenant and exit
    RunOnce(RunOnceArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunOnceArgs {
    /// Also execute the queued jobs on this process before exiting
    #[arg(long)]
    pub drain: bool,

    #[arg(long)]
    pub in_memory: bool,
}
