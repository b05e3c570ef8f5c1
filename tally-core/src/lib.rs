//! # Tally Core
//!
//! Incremental snapshot engine for the session monitoring service. Producers
//! record per-step progress of ingestion sessions; this crate periodically
//! folds new step versions into per-session and per-source aggregates.
//!
//! ## Overview
//!
//! - **Scheduler**: fixed-delay tick per tenant, guarded by a named lease and
//!   held back while step cleanup runs
//! - **Orchestrator**: pages idle sources, submits one snapshot job per
//!   eligible source and marks it running
//! - **Engine**: aggregates the `(watermark, freeze]` window with signed
//!   deltas and commits sessions, source and watermark together
//! - **Job runtime**: per-tenant queue plus worker pool with cooperative
//!   cancellation
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL stores and job queue through SQLx
//! - `redis`: Redis-backed lease service
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use tally_core::{
//!     config::SnapshotConfig,
//!     lease::InMemoryLeaseService,
//!     snapshot::SnapshotScheduler,
//!     tenant::{StaticTenantDirectory, TenantContext},
//! };
//!
//! async fn tick_once() -> tally_core::Result<()> {
//!     let tenant = TenantContext::in_memory("acme");
//!     let directory = StaticTenantDirectory::new().with_tenant(tenant.context);
//!     let scheduler = SnapshotScheduler::new(
//!         Arc::new(directory),
//!         Arc::new(InMemoryLeaseService::new()),
//!         "tally",
//!         SnapshotConfig::default(),
//!     );
//!     scheduler.tick_at(Utc::now()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod persistence;
pub mod snapshot;
pub mod tenant;
pub mod types;

pub use error::{MonitorError, Result};

/// Embedded schema migrations for the Postgres stores.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
