//! # strata-migrate
//!
//! Code-first schema migration engine.
//!
//! This crate provides functionality for:
//! - Versioned change units written as Rust types (no SQL files on disk)
//! - A total-order registry of every known unit
//! - Applied-version tracking in a `_strata_migrations` table
//! - Safe, transactional application and rollback, one unit per transaction
//! - An idempotent schema primitive library (add-if-absent / remove-if-present)
//! - LIST partitioning transitions that preserve indexes and foreign keys
//! - Temporal exclusion constraints for overlap-free history tables
//!
//! ## Architecture
//!
//! Change units are compiled into the binary and registered at startup. The
//! runner diffs the registry against the applied-version set recorded in the
//! target database and applies what is missing, each unit bracketed in its
//! own transaction together with its bookkeeping row. A non-blocking
//! advisory lock keeps concurrent runners out.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ Change Units │────▶│    Registry    │────▶│    Runner    │
//! └──────────────┘     └────────────────┘     └──────────────┘
//!                                                    │
//!                              ┌─────────────────────┤
//!                              ▼                     ▼
//!                      ┌────────────────┐     ┌──────────────┐
//!                      │ State Tracker  │     │ SchemaAccess │
//!                      └────────────────┘     └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use strata_migrate::{
//!     ChangeUnit, MigrateResult, MigrationCtx, MigrationRegistry, MigrationRunner,
//! };
//!
//! struct AddCellToMachine;
//!
//! #[async_trait::async_trait]
//! impl ChangeUnit for AddCellToMachine {
//!     fn version(&self) -> i64 {
//!         37
//!     }
//!
//!     fn name(&self) -> &str {
//!         "add cell column to machine"
//!     }
//!
//!     fn reversible(&self) -> bool {
//!         true
//!     }
//!
//!     async fn up(&self, ctx: &MigrationCtx<'_>) -> MigrateResult<()> {
//!         ctx.schema()
//!             .add_column_if_absent("machine", "cellid", "INTEGER")
//!             .await
//!     }
//!
//!     async fn down(&self, ctx: &MigrationCtx<'_>) -> MigrateResult<()> {
//!         ctx.schema()
//!             .remove_column_if_present("machine", "cellid")
//!             .await
//!     }
//! }
//!
//! async fn migrate(access: &dyn strata_migrate::SchemaAccess) -> MigrateResult<()> {
//!     let registry = MigrationRegistry::from_units([
//!         Arc::new(AddCellToMachine) as Arc<dyn ChangeUnit>,
//!     ])?;
//!     let report = MigrationRunner::new(&registry, access).up().await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod change;
pub mod error;
pub mod exclusion;
pub mod partition;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod sql;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use access::{Capabilities, SchemaAccess, SchemaObject};
pub use change::{ChangeUnit, MigrationCtx};
pub use error::{MigrateResult, MigrationError};
pub use exclusion::{ExclusionHelper, ExclusionPath};
pub use partition::PartitionManager;
pub use registry::MigrationRegistry;
pub use runner::{
    DEFAULT_LOCK_KEY, MigrationReport, MigrationRunner, MigrationStatus, RunnerConfig, Target,
};
pub use schema::{SchemaEdit, object_name};
pub use state::{MigrationRecord, STATE_TABLE, StateTracker};
