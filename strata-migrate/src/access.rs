//! The database access surface consumed by the engine.
//!
//! The engine never opens connections itself: everything it does to the
//! target database goes through [`SchemaAccess`]. The surface is deliberately
//! narrow - raw statement execution, a handful of existence and introspection
//! queries, transaction demarcation on the session, and an advisory lock.
//! How the connection is configured is the implementor's business.

use async_trait::async_trait;

use crate::error::MigrateResult;

/// What the backend can do. Probed once by the implementor; the helpers
/// degrade to documented fallbacks when a capability is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Exclusion-style constraints (`EXCLUDE USING gist`) are usable,
    /// including multi-column grouping keys.
    pub exclusion_constraints: bool,
    /// Native (declarative) table partitioning is available.
    pub native_partitioning: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            exclusion_constraints: true,
            native_partitioning: true,
        }
    }
}

/// A re-executable piece of DDL attached to a table: an index or a foreign
/// key. `definition` is a complete statement that recreates the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    /// Table the object belongs to (for a foreign key, the referencing table).
    pub table: String,
    /// Object name.
    pub name: String,
    /// Full statement that recreates the object.
    pub definition: String,
}

/// Raw access to the target database.
///
/// Transactions are session-scoped: `begin`/`commit`/`rollback` bracket
/// statements on the one connection a migration run owns. Existence queries
/// always hit the live catalog - the engine keeps no cached schema model.
#[async_trait]
pub trait SchemaAccess: Send + Sync {
    /// Execute a single statement, returning the affected row count.
    async fn execute(&self, sql: &str) -> MigrateResult<u64>;

    /// Execute a batch of statements in one round-trip (used for idempotent
    /// bootstrap DDL).
    async fn batch_execute(&self, sql: &str) -> MigrateResult<()>;

    /// Run a query returning a single `BIGINT` column.
    async fn query_i64_column(&self, sql: &str) -> MigrateResult<Vec<i64>>;

    /// Run a query returning a single text column.
    async fn query_strings(&self, sql: &str) -> MigrateResult<Vec<String>>;

    /// Run a query returning rows of text columns.
    async fn query_string_rows(&self, sql: &str) -> MigrateResult<Vec<Vec<String>>>;

    /// Does the table exist?
    async fn table_exists(&self, table: &str) -> MigrateResult<bool>;

    /// Does the column exist on the table?
    async fn column_exists(&self, table: &str, column: &str) -> MigrateResult<bool>;

    /// Storage type of a column (`None` when the column is absent).
    async fn column_type(&self, table: &str, column: &str) -> MigrateResult<Option<String>>;

    /// Does a constraint with this name exist on the table?
    async fn constraint_exists(&self, table: &str, name: &str) -> MigrateResult<bool>;

    /// Does an index with this name exist?
    async fn index_exists(&self, name: &str) -> MigrateResult<bool>;

    /// Is the table currently partitioned? Always a live query.
    async fn table_is_partitioned(&self, table: &str) -> MigrateResult<bool>;

    /// All index definitions on the table.
    async fn index_definitions(&self, table: &str) -> MigrateResult<Vec<SchemaObject>>;

    /// All foreign keys touching the table - both the table's own and those of
    /// other tables referencing it.
    async fn foreign_key_definitions(&self, table: &str) -> MigrateResult<Vec<SchemaObject>>;

    /// Open a transaction on the session.
    async fn begin(&self) -> MigrateResult<()>;

    /// Commit the open transaction.
    async fn commit(&self) -> MigrateResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> MigrateResult<()>;

    /// Try to take the run-scoped advisory lock without blocking. Returns
    /// `false` when another session holds it.
    async fn try_advisory_lock(&self, key: i64) -> MigrateResult<bool>;

    /// Release the advisory lock. The backend also releases it implicitly
    /// when the session dies.
    async fn release_advisory_lock(&self, key: i64) -> MigrateResult<()>;

    /// Capability report for this backend.
    fn capabilities(&self) -> Capabilities;
}
