//! Applied-version tracking, persisted in the target database itself.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::SchemaAccess;
use crate::error::{MigrateResult, MigrationError};
use crate::sql::quote_literal;

/// Name of the state table.
pub const STATE_TABLE: &str = "_strata_migrations";

/// Idempotent bootstrap DDL for the state table. Creating it is the one
/// operation allowed to run outside the per-unit transaction loop.
pub const STATE_TABLE_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _strata_migrations (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS _strata_migrations_applied_at_idx
    ON _strata_migrations (applied_at DESC);
"#;

/// Persisted evidence that a change unit's Up has been applied and not yet
/// reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Applied version.
    pub version: i64,
    /// Unit name at the time it was applied.
    pub name: String,
    /// When Up committed.
    pub applied_at: DateTime<Utc>,
}

/// Reads and mutates the applied-version set.
///
/// `record_applied` and `record_reverted` run on the same session as the
/// unit's own statements, inside the unit's transaction: the schema change
/// and its bookkeeping commit or roll back together.
pub struct StateTracker<'a> {
    access: &'a dyn SchemaAccess,
}

impl<'a> StateTracker<'a> {
    /// Build a tracker over an access surface.
    pub fn new(access: &'a dyn SchemaAccess) -> Self {
        Self { access }
    }

    /// Create the state table if it does not exist yet.
    pub async fn ensure_table(&self) -> MigrateResult<()> {
        self.access.batch_execute(STATE_TABLE_INIT_SQL).await
    }

    /// The set of versions currently considered present in the schema.
    pub async fn applied_versions(&self) -> MigrateResult<BTreeSet<i64>> {
        let versions = self
            .access
            .query_i64_column(&format!(
                "SELECT version FROM {STATE_TABLE} ORDER BY version"
            ))
            .await?;
        Ok(versions.into_iter().collect())
    }

    /// Full applied records, ascending by version.
    pub async fn applied_records(&self) -> MigrateResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version::text, name, \
             to_char(applied_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS\"Z\"') \
             FROM {STATE_TABLE} ORDER BY version"
        );
        let rows = self.access.query_string_rows(&sql).await?;
        rows.into_iter()
            .map(|row| {
                if row.len() != 3 {
                    return Err(MigrationError::statement(
                        sql.clone(),
                        format!("expected 3 columns, got {}", row.len()),
                    ));
                }
                let version = row[0].parse::<i64>().map_err(|e| {
                    MigrationError::statement(sql.clone(), format!("bad version column: {e}"))
                })?;
                let applied_at = DateTime::parse_from_rfc3339(&row[2])
                    .map_err(|e| {
                        MigrationError::statement(
                            sql.clone(),
                            format!("bad applied_at column '{}': {e}", row[2]),
                        )
                    })?
                    .with_timezone(&Utc);
                Ok(MigrationRecord {
                    version,
                    name: row[1].clone(),
                    applied_at,
                })
            })
            .collect()
    }

    /// Record that a version was applied. Runs inside the unit's transaction.
    pub async fn record_applied(&self, version: i64, name: &str) -> MigrateResult<()> {
        self.access
            .execute(&format!(
                "INSERT INTO {STATE_TABLE} (version, name) VALUES ({version}, {})",
                quote_literal(name)
            ))
            .await?;
        Ok(())
    }

    /// Record that a version was reverted. Runs inside the unit's transaction.
    pub async fn record_reverted(&self, version: i64) -> MigrateResult<()> {
        self.access
            .execute(&format!(
                "DELETE FROM {STATE_TABLE} WHERE version = {version}"
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAccess;

    #[test]
    fn test_init_sql_is_idempotent_ddl() {
        assert!(STATE_TABLE_INIT_SQL.contains("IF NOT EXISTS"));
        assert!(STATE_TABLE_INIT_SQL.contains(STATE_TABLE));
    }

    #[tokio::test]
    async fn test_record_and_revert_round_trip() {
        let access = MemoryAccess::new();
        let tracker = StateTracker::new(&access);
        tracker.ensure_table().await.unwrap();
        // ensure_table twice must not fail
        tracker.ensure_table().await.unwrap();

        tracker.record_applied(5, "five").await.unwrap();
        tracker.record_applied(8, "eight's unit").await.unwrap();
        assert_eq!(
            tracker.applied_versions().await.unwrap(),
            BTreeSet::from([5, 8])
        );

        let records = tracker.applied_records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version, 5);
        assert_eq!(records[1].name, "eight's unit");

        tracker.record_reverted(5).await.unwrap();
        assert_eq!(
            tracker.applied_versions().await.unwrap(),
            BTreeSet::from([8])
        );
    }
}
