//! Table partitioning transitions that preserve indexes and foreign keys.
//!
//! Some schema changes (changing a primary key, altering a column type) are
//! not legal on a live partitioned table, so a change unit brackets them as
//! unpartition -> edits -> partition. The whole triple runs inside the unit's
//! transaction: a fault anywhere reverts everything, never leaving the table
//! in the wrong shape.
//!
//! Both transitions work by snapshot-copy-swap: capture every index and
//! foreign-key definition touching the table, rebuild the table in the target
//! shape, move the rows, and replay the captured DDL. A primary key comes
//! back as its backing unique index (uniqueness preserved; the constraint
//! marker is not re-attached).

use tracing::{debug, warn};

use crate::access::{SchemaAccess, SchemaObject};
use crate::error::{MigrateResult, MigrationError};
use crate::sql::key_value;

/// Manages a table's transition into and out of a LIST-partitioned layout.
pub struct PartitionManager<'a> {
    access: &'a dyn SchemaAccess,
}

impl<'a> PartitionManager<'a> {
    pub(crate) fn new(access: &'a dyn SchemaAccess) -> Self {
        Self { access }
    }

    /// Is the table currently partitioned? Always queried live, never cached:
    /// partitioning state must reflect the database, not the engine's history.
    pub async fn is_partitioned(&self, table: &str) -> MigrateResult<bool> {
        self.access.table_is_partitioned(table).await
    }

    /// Collapse all partitions of `table` back into one physical table,
    /// preserving every index and foreign key that referenced it.
    pub async fn unpartition(&self, table: &str) -> MigrateResult<()> {
        if !self.is_partitioned(table).await? {
            return Err(MigrationError::partition_state(
                table,
                "not partitioned (already collapsed, or altered concurrently)",
            ));
        }
        let scratch = format!("{table}_unpart");
        if self.access.table_exists(&scratch).await? {
            return Err(MigrationError::partition_state(
                table,
                format!("scratch relation '{scratch}' already exists"),
            ));
        }

        let preserved = self.snapshot(table).await?;
        debug!(
            table,
            objects = preserved.len(),
            "unpartitioning, preserving indexes and foreign keys"
        );

        self.access
            .execute(&format!(
                "CREATE TABLE {scratch} (LIKE {table} INCLUDING DEFAULTS INCLUDING CONSTRAINTS)"
            ))
            .await?;
        self.access
            .execute(&format!("INSERT INTO {scratch} SELECT * FROM {table}"))
            .await?;
        self.access
            .execute(&format!("DROP TABLE {table} CASCADE"))
            .await?;
        self.access
            .execute(&format!("ALTER TABLE {scratch} RENAME TO {table}"))
            .await?;

        self.replay(&preserved).await
    }

    /// Re-split `table` by LIST on `key_column`, one partition per distinct
    /// key in `by_table` (the foreign-key target that owns the key space)
    /// plus a default partition, recreating the same indexes and foreign
    /// keys.
    ///
    /// When the backend has no native partitioning the table is left flat
    /// and a warning is logged - the documented fallback, so the caller's
    /// unpartition/edit/partition triple degrades to edit-in-place.
    pub async fn partition(
        &self,
        table: &str,
        key_column: &str,
        by_table: &str,
    ) -> MigrateResult<()> {
        if !self.access.capabilities().native_partitioning {
            warn!(
                table,
                "native partitioning unavailable, leaving table unpartitioned"
            );
            return Ok(());
        }
        if self.is_partitioned(table).await? {
            return Err(MigrationError::partition_state(
                table,
                "already partitioned (altered concurrently?)",
            ));
        }
        let scratch = format!("{table}_parted");
        if self.access.table_exists(&scratch).await? {
            return Err(MigrationError::partition_state(
                table,
                format!("scratch relation '{scratch}' already exists"),
            ));
        }

        let keys = self
            .access
            .query_strings(&format!(
                "SELECT DISTINCT {key_column}::text FROM {by_table} ORDER BY 1"
            ))
            .await?;
        let preserved = self.snapshot(table).await?;
        debug!(
            table,
            key_column,
            partitions = keys.len(),
            "partitioning by list"
        );

        self.access
            .execute(&format!(
                "CREATE TABLE {scratch} (LIKE {table} INCLUDING DEFAULTS INCLUDING CONSTRAINTS) \
                 PARTITION BY LIST ({key_column})"
            ))
            .await?;
        for key in &keys {
            let child = format!("{table}_p{}", sanitize(key));
            self.access
                .execute(&format!(
                    "CREATE TABLE {child} PARTITION OF {scratch} FOR VALUES IN ({})",
                    key_value(key)
                ))
                .await?;
        }
        self.access
            .execute(&format!(
                "CREATE TABLE {table}_pdefault PARTITION OF {scratch} DEFAULT"
            ))
            .await?;
        self.access
            .execute(&format!("INSERT INTO {scratch} SELECT * FROM {table}"))
            .await?;
        self.access
            .execute(&format!("DROP TABLE {table} CASCADE"))
            .await?;
        self.access
            .execute(&format!("ALTER TABLE {scratch} RENAME TO {table}"))
            .await?;

        self.replay(&preserved).await
    }

    /// Indexes first, then foreign keys (a replayed FK may need an index).
    async fn snapshot(&self, table: &str) -> MigrateResult<Vec<SchemaObject>> {
        let mut objects = self.access.index_definitions(table).await?;
        objects.extend(self.access.foreign_key_definitions(table).await?);
        Ok(objects)
    }

    async fn replay(&self, objects: &[SchemaObject]) -> MigrateResult<()> {
        for object in objects {
            debug!(name = %object.name, "recreating preserved object");
            self.access.execute(&object.definition).await?;
        }
        Ok(())
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAccess;
    use std::collections::BTreeSet;

    fn seeded() -> MemoryAccess {
        let access = MemoryAccess::new();
        access.seed_table("machine", &[("machineid", "integer")]);
        access.seed_table(
            "machinestate",
            &[
                ("machinestateid", "integer"),
                ("machineid", "integer"),
                ("staterange", "tsrange"),
            ],
        );
        access.seed_index(
            "machinestate",
            "machinestate_machineid_idx",
            "CREATE INDEX machinestate_machineid_idx ON machinestate USING btree (machineid)",
        );
        access.seed_foreign_key(
            "machinestate",
            "machine",
            "machinestate_machineid_fkey",
            "ALTER TABLE machinestate ADD CONSTRAINT machinestate_machineid_fkey \
             FOREIGN KEY (machineid) REFERENCES machine (machineid)",
        );
        access.stub_rows(
            "SELECT DISTINCT machineid::text FROM machine",
            &["1", "2", "3"],
        );
        access
    }

    #[tokio::test]
    async fn test_partition_round_trip_preserves_indexes_and_foreign_keys() {
        let access = seeded();
        let manager = PartitionManager::new(&access);

        let before: BTreeSet<String> = access
            .index_definitions("machinestate")
            .await
            .unwrap()
            .into_iter()
            .chain(access.foreign_key_definitions("machinestate").await.unwrap())
            .map(|o| o.name)
            .collect();

        manager
            .partition("machinestate", "machineid", "machine")
            .await
            .unwrap();
        assert!(manager.is_partitioned("machinestate").await.unwrap());

        manager.unpartition("machinestate").await.unwrap();
        assert!(!manager.is_partitioned("machinestate").await.unwrap());

        let after: BTreeSet<String> = access
            .index_definitions("machinestate")
            .await
            .unwrap()
            .into_iter()
            .chain(access.foreign_key_definitions("machinestate").await.unwrap())
            .map(|o| o.name)
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unpartition_flat_table_fails_loudly() {
        let access = seeded();
        let manager = PartitionManager::new(&access);
        let err = manager.unpartition("machinestate").await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::PartitionStateInconsistent { .. }
        ));
    }

    #[tokio::test]
    async fn test_partition_twice_fails_loudly() {
        let access = seeded();
        let manager = PartitionManager::new(&access);
        manager
            .partition("machinestate", "machineid", "machine")
            .await
            .unwrap();
        let err = manager
            .partition("machinestate", "machineid", "machine")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::PartitionStateInconsistent { .. }
        ));
    }

    #[tokio::test]
    async fn test_leftover_scratch_relation_is_reported() {
        let access = seeded();
        access.seed_table("machinestate_parted", &[("machinestateid", "integer")]);
        let manager = PartitionManager::new(&access);
        let err = manager
            .partition("machinestate", "machineid", "machine")
            .await
            .unwrap_err();
        match err {
            MigrationError::PartitionStateInconsistent { detail, .. } => {
                assert!(detail.contains("machinestate_parted"));
            }
            other => panic!("expected PartitionStateInconsistent, got {other:?}"),
        }
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize("42"), "42");
        assert_eq!(sanitize("cell-a"), "cell_a");
    }
}
