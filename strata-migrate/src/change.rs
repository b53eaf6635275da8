//! Change units and the context they execute against.

use async_trait::async_trait;

use crate::access::SchemaAccess;
use crate::error::{MigrateResult, MigrationError};
use crate::exclusion::ExclusionHelper;
use crate::partition::PartitionManager;
use crate::schema::SchemaEdit;

/// A single versioned, named forward/backward schema change.
///
/// A change unit is immutable once shipped: its version number never changes
/// and its content is only ever superseded by a later-numbered unit. A
/// deprecated unit stays registered as a no-op forever - its version number
/// is permanently occupied. Version numbers need not be contiguous.
///
/// Idempotency is the unit's own responsibility: guard additive and
/// destructive operations through the if-absent/if-present primitives on
/// [`MigrationCtx`] whenever a re-run after a partial failure or a
/// hand-patched database is plausible.
#[async_trait]
pub trait ChangeUnit: Send + Sync {
    /// Globally unique, positive version number.
    fn version(&self) -> i64;

    /// Human-readable name, for logs and reports.
    fn name(&self) -> &str;

    /// Whether this unit can be reverted. `false` unless overridden, in
    /// agreement with the default `down`: a unit that implements a real
    /// `down` declares `reversible() == true` alongside it. The runner
    /// refuses a whole down batch up front when any unit in it reports
    /// `false`, with a structured
    /// [`MigrationError::IrreversibleMigration`] instead of silently doing
    /// nothing.
    fn reversible(&self) -> bool {
        false
    }

    /// Apply the change.
    async fn up(&self, ctx: &MigrationCtx<'_>) -> MigrateResult<()>;

    /// Revert the change. The default marks the unit irreversible, matching
    /// the default `reversible()`.
    async fn down(&self, _ctx: &MigrationCtx<'_>) -> MigrateResult<()> {
        Err(MigrationError::IrreversibleMigration {
            version: self.version(),
            name: self.name().to_string(),
        })
    }
}

/// Handle passed to a change unit's `up`/`down`, exposing the schema
/// primitive library, the partitioning manager, the temporal exclusion
/// helper, and raw statement execution. Everything runs inside the unit's
/// transaction.
pub struct MigrationCtx<'a> {
    access: &'a dyn SchemaAccess,
}

impl<'a> MigrationCtx<'a> {
    /// Build a context over an access surface.
    pub fn new(access: &'a dyn SchemaAccess) -> Self {
        Self { access }
    }

    /// The schema primitive library.
    pub fn schema(&self) -> SchemaEdit<'a> {
        SchemaEdit::new(self.access)
    }

    /// The table partitioning manager.
    pub fn partitions(&self) -> PartitionManager<'a> {
        PartitionManager::new(self.access)
    }

    /// The temporal exclusion helper.
    pub fn exclusion(&self) -> ExclusionHelper<'a> {
        ExclusionHelper::new(self.access)
    }

    /// Execute a raw statement.
    pub async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        self.access.execute(sql).await
    }

    /// The underlying access surface, for anything the helpers don't cover.
    pub fn access(&self) -> &'a dyn SchemaAccess {
        self.access
    }
}
