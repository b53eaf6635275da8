//! The schema primitive library: idempotent building blocks for change units.
//!
//! Every operation here is a thin wrapper over the access surface in one of
//! two canonical shapes - "add if absent" or "remove if present" - so calling
//! any of them twice never throws. Existence is always checked against the
//! live catalog, never a cached model.

use std::hash::{DefaultHasher, Hash, Hasher};

use tracing::{debug, warn};

use crate::access::SchemaAccess;
use crate::error::MigrateResult;

/// Build a deterministic object name from table, suffix kind and columns,
/// truncated to PostgreSQL's 63-byte identifier limit. With five or more
/// columns the column list collapses to a hash. Deterministic so that Up and
/// Down can always find what the other created.
pub fn object_name(table: &str, suffix: &str, columns: &[&str]) -> String {
    let mut name = if columns.is_empty() {
        table.to_string()
    } else if columns.len() < 5 {
        format!("{table}_{}", columns.join("_"))
    } else {
        let mut hasher = DefaultHasher::new();
        columns.join("_").hash(&mut hasher);
        format!("{table}_{:08x}", hasher.finish() as u32)
    };

    // 62 leaves room for the separator. Back off to a char boundary so a
    // multi-byte identifier cannot panic the truncation.
    let max = 62usize.saturating_sub(suffix.len());
    if name.len() > max {
        let mut cut = max;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name.push('_');
    name.push_str(suffix);
    name.to_lowercase()
}

/// Entry point to the primitive library.
///
/// `optional()` returns a copy whose operations downgrade statement faults to
/// warnings - the explicit opt-in for best-effort cleanup steps (dropping a
/// constraint that historical drift may already have removed). It is never
/// the default.
pub struct SchemaEdit<'a> {
    access: &'a dyn SchemaAccess,
    optional: bool,
}

impl<'a> SchemaEdit<'a> {
    pub(crate) fn new(access: &'a dyn SchemaAccess) -> Self {
        Self {
            access,
            optional: false,
        }
    }

    /// Mark the following operations as best-effort: faults are logged and
    /// swallowed instead of aborting the unit.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    async fn run(&self, sql: &str) -> MigrateResult<()> {
        match self.access.execute(sql).await {
            Ok(_) => Ok(()),
            Err(err) if self.optional => {
                warn!(%err, sql, "optional schema step failed, continuing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // --- columns ---

    /// Add a column unless it already exists. `definition` is the type plus
    /// any constraints and default, e.g. `"INTEGER NOT NULL DEFAULT 0"`.
    pub async fn add_column_if_absent(
        &self,
        table: &str,
        column: &str,
        definition: &str,
    ) -> MigrateResult<()> {
        if self.access.column_exists(table, column).await? {
            debug!(table, column, "column already present, skipping add");
            return Ok(());
        }
        self.run(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {definition}"
        ))
        .await
    }

    /// Drop a column (cascading to dependents) if it exists.
    pub async fn remove_column_if_present(&self, table: &str, column: &str) -> MigrateResult<()> {
        if !self.access.column_exists(table, column).await? {
            debug!(table, column, "column already absent, skipping drop");
            return Ok(());
        }
        self.run(&format!("ALTER TABLE {table} DROP COLUMN {column} CASCADE"))
            .await
    }

    /// Forbid NULL in a column.
    pub async fn set_not_null(&self, table: &str, column: &str) -> MigrateResult<()> {
        self.run(&format!(
            "ALTER TABLE {table} ALTER COLUMN {column} SET NOT NULL"
        ))
        .await
    }

    /// Allow NULL in a column again.
    pub async fn drop_not_null(&self, table: &str, column: &str) -> MigrateResult<()> {
        self.run(&format!(
            "ALTER TABLE {table} ALTER COLUMN {column} DROP NOT NULL"
        ))
        .await
    }

    /// Remove a column's default value.
    pub async fn drop_default(&self, table: &str, column: &str) -> MigrateResult<()> {
        self.run(&format!(
            "ALTER TABLE {table} ALTER COLUMN {column} DROP DEFAULT"
        ))
        .await
    }

    /// Widen a text-ish column to unconstrained TEXT.
    pub async fn make_column_text(&self, table: &str, column: &str) -> MigrateResult<()> {
        self.run(&format!(
            "ALTER TABLE {table} ALTER COLUMN {column} SET DATA TYPE TEXT"
        ))
        .await
    }

    /// Convert a text column to case/accent-insensitive comparison semantics
    /// without rewriting stored bytes (CITEXT).
    pub async fn make_column_case_insensitive(
        &self,
        table: &str,
        column: &str,
    ) -> MigrateResult<()> {
        self.run("CREATE EXTENSION IF NOT EXISTS citext").await?;
        self.run(&format!(
            "ALTER TABLE {table} ALTER COLUMN {column} SET DATA TYPE CITEXT"
        ))
        .await
    }

    // --- indexes ---

    /// Add a btree index with a generated name unless it already exists.
    pub async fn add_index_if_absent(&self, table: &str, columns: &[&str]) -> MigrateResult<()> {
        let name = object_name(table, "idx", columns);
        self.add_named_index_if_absent(&name, table, columns, None)
            .await
    }

    /// Add a partial btree index with a generated name.
    pub async fn add_index_if_absent_where(
        &self,
        table: &str,
        columns: &[&str],
        condition: &str,
    ) -> MigrateResult<()> {
        let name = object_name(table, "idx", columns);
        self.add_named_index_if_absent(&name, table, columns, Some(condition))
            .await
    }

    /// Add an explicitly named btree index unless it already exists.
    pub async fn add_named_index_if_absent(
        &self,
        name: &str,
        table: &str,
        columns: &[&str],
        condition: Option<&str>,
    ) -> MigrateResult<()> {
        if self.access.index_exists(name).await? {
            debug!(name, "index already present, skipping add");
            return Ok(());
        }
        let mut sql = format!(
            "CREATE INDEX {name} ON {table} USING btree ({})",
            columns.join(", ")
        );
        if let Some(condition) = condition {
            sql.push_str(&format!(" WHERE {condition}"));
        }
        self.run(&sql).await
    }

    /// Drop the generated-name index on these columns if it exists.
    pub async fn remove_index_if_present(&self, table: &str, columns: &[&str]) -> MigrateResult<()> {
        let name = object_name(table, "idx", columns);
        self.remove_named_index_if_present(&name).await
    }

    /// Drop an explicitly named index if it exists.
    pub async fn remove_named_index_if_present(&self, name: &str) -> MigrateResult<()> {
        self.run(&format!("DROP INDEX IF EXISTS {name}")).await
    }

    // --- constraints ---

    /// Add a check constraint with a name generated from table and column.
    pub async fn add_check_constraint(
        &self,
        table: &str,
        column: &str,
        predicate: &str,
    ) -> MigrateResult<()> {
        let name = object_name(table, "check", &[column]);
        self.add_named_check_constraint(&name, table, predicate)
            .await
    }

    /// Add an explicitly named check constraint unless it already exists.
    pub async fn add_named_check_constraint(
        &self,
        name: &str,
        table: &str,
        predicate: &str,
    ) -> MigrateResult<()> {
        if self.access.constraint_exists(table, name).await? {
            debug!(table, name, "constraint already present, skipping add");
            return Ok(());
        }
        self.run(&format!(
            "ALTER TABLE {table} ADD CONSTRAINT {name} CHECK ({predicate})"
        ))
        .await
    }

    /// Add a deferrable unique constraint with a generated name.
    pub async fn add_unique_constraint(&self, table: &str, columns: &[&str]) -> MigrateResult<()> {
        let name = object_name(table, "unique", columns);
        if self.access.constraint_exists(table, &name).await? {
            debug!(table, name, "unique constraint already present, skipping add");
            return Ok(());
        }
        self.run(&format!(
            "ALTER TABLE {table} ADD CONSTRAINT {name} UNIQUE ({}) \
             DEFERRABLE INITIALLY DEFERRED",
            columns.join(", ")
        ))
        .await
    }

    /// Remove the generated-name unique constraint on these columns.
    pub async fn remove_unique_constraint(
        &self,
        table: &str,
        columns: &[&str],
    ) -> MigrateResult<()> {
        let name = object_name(table, "unique", columns);
        self.remove_constraint(table, &name).await
    }

    /// Drop a constraint by name if it exists.
    pub async fn remove_constraint(&self, table: &str, name: &str) -> MigrateResult<()> {
        self.run(&format!(
            "ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {name}"
        ))
        .await
    }

    // --- sequences ---

    /// Advance a column's backing sequence past the largest present id so
    /// externally seeded rows do not collide with future generated ids.
    /// With `minimum`, the sequence never lands below that value.
    pub async fn reset_sequence(
        &self,
        table: &str,
        id_column: &str,
        minimum: Option<i64>,
    ) -> MigrateResult<()> {
        let floor = minimum.unwrap_or(1);
        self.run(&format!(
            "SELECT SETVAL('{table}_{id_column}_seq', \
             GREATEST(COALESCE((SELECT MAX({id_column}) + 1 FROM {table}), 1), {floor}))"
        ))
        .await
    }

    /// Set a column's backing sequence to an absolute value.
    pub async fn set_sequence(&self, table: &str, id_column: &str, value: i64) -> MigrateResult<()> {
        self.run(&format!(
            "SELECT SETVAL('{table}_{id_column}_seq', {value})"
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAccess;

    #[test]
    fn test_object_name_basic() {
        assert_eq!(object_name("machine", "idx", &["cellid"]), "machine_cellid_idx");
        assert_eq!(object_name("machinestate", "nooverlap", &[]), "machinestate_nooverlap");
    }

    #[test]
    fn test_object_name_truncates_to_identifier_limit() {
        let table = "a".repeat(80);
        let name = object_name(&table, "idx", &["col"]);
        assert!(name.len() <= 63);
        assert!(name.ends_with("_idx"));
    }

    #[test]
    fn test_object_name_truncates_multibyte_identifiers() {
        // 2-byte characters put the cutoff inside a character
        let table = "é".repeat(40);
        let name = object_name(&table, "idx", &["col"]);
        assert!(name.len() <= 63);
        assert!(name.ends_with("_idx"));
    }

    #[test]
    fn test_object_name_hashes_wide_column_lists() {
        let cols = ["a", "b", "c", "d", "e", "f"];
        let name = object_name("t", "unique", &cols);
        let again = object_name("t", "unique", &cols);
        assert_eq!(name, again);
        assert!(!name.contains("a_b_c"));
    }

    #[tokio::test]
    async fn test_add_column_if_absent_is_idempotent() {
        let access = MemoryAccess::new();
        access.seed_table("machine", &[("machineid", "integer")]);
        let edit = SchemaEdit::new(&access);

        edit.add_column_if_absent("machine", "cellid", "INTEGER")
            .await
            .unwrap();
        edit.add_column_if_absent("machine", "cellid", "INTEGER")
            .await
            .unwrap();

        assert!(access.column_exists("machine", "cellid").await.unwrap());
        let adds = access
            .executed()
            .iter()
            .filter(|sql| sql.contains("ADD COLUMN cellid"))
            .count();
        assert_eq!(adds, 1);
    }

    #[tokio::test]
    async fn test_remove_column_if_present_twice_never_throws() {
        let access = MemoryAccess::new();
        access.seed_table("machine", &[("machineid", "integer"), ("obsolete", "text")]);
        let edit = SchemaEdit::new(&access);

        edit.remove_column_if_present("machine", "obsolete")
            .await
            .unwrap();
        edit.remove_column_if_present("machine", "obsolete")
            .await
            .unwrap();
        assert!(!access.column_exists("machine", "obsolete").await.unwrap());
    }

    #[tokio::test]
    async fn test_optional_swallows_statement_faults() {
        let access = MemoryAccess::new();
        access.seed_table("machine", &[("machineid", "integer")]);
        access.fail_on("DROP CONSTRAINT");
        let edit = SchemaEdit::new(&access);

        edit.remove_constraint("machine", "gone_check")
            .await
            .unwrap_err();
        edit.optional()
            .remove_constraint("machine", "gone_check")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unique_constraint_generated_name_round_trip() {
        let access = MemoryAccess::new();
        access.seed_table("shift", &[("shiftid", "integer"), ("day", "date")]);
        let edit = SchemaEdit::new(&access);

        edit.add_unique_constraint("shift", &["day", "shiftid"])
            .await
            .unwrap();
        let name = object_name("shift", "unique", &["day", "shiftid"]);
        assert!(access.constraint_exists("shift", &name).await.unwrap());

        edit.remove_unique_constraint("shift", &["day", "shiftid"])
            .await
            .unwrap();
        assert!(!access.constraint_exists("shift", &name).await.unwrap());
    }
}
