//! Temporal exclusion: no two rows for the same grouping key may have
//! overlapping validity ranges.
//!
//! The guarantee is enforced by the database engine itself via a GiST
//! exclusion constraint - a concurrent insert that would overlap is rejected
//! at commit time with a RangeOverlap fault, never silently accepted. When
//! the constraint cannot be installed (a grouping column whose storage type
//! GiST cannot index, or a backend without exclusion support), the helper
//! falls back to a plain secondary index plus application-level discipline
//! and reports which path is active.

use tracing::warn;

use crate::access::SchemaAccess;
use crate::error::MigrateResult;
use crate::schema::object_name;

/// Which enforcement path `add_no_overlap` installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionPath {
    /// Database-enforced exclusion constraint.
    Native,
    /// Plain secondary index only; overlap discipline is left to the
    /// application. Active when a grouping column cannot be GiST-indexed or
    /// the backend lacks exclusion constraints.
    IndexOnly,
}

/// Column storage types GiST cannot index through btree_gist.
const GIST_UNFRIENDLY_TYPES: &[&str] = &["json", "jsonb"];

/// Installs and removes no-overlap guarantees on history tables.
pub struct ExclusionHelper<'a> {
    access: &'a dyn SchemaAccess,
}

impl<'a> ExclusionHelper<'a> {
    pub(crate) fn new(access: &'a dyn SchemaAccess) -> Self {
        Self { access }
    }

    /// Install a no-overlap guarantee on `table`: rows sharing values in all
    /// `grouping` columns must not have overlapping `range_column` values.
    /// Safely re-callable: any previous guarantee on the table is replaced.
    pub async fn add_no_overlap(
        &self,
        table: &str,
        range_column: &str,
        grouping: &[&str],
    ) -> MigrateResult<ExclusionPath> {
        self.add_no_overlap_where(table, None, range_column, grouping)
            .await
    }

    /// Like [`add_no_overlap`](Self::add_no_overlap) but scoped to rows
    /// matching `condition`.
    pub async fn add_no_overlap_where(
        &self,
        table: &str,
        condition: Option<&str>,
        range_column: &str,
        grouping: &[&str],
    ) -> MigrateResult<ExclusionPath> {
        self.remove_no_overlap(table).await?;

        let mut fallback = !self.access.capabilities().exclusion_constraints;
        for column in grouping {
            if let Some(ty) = self.access.column_type(table, column).await? {
                if GIST_UNFRIENDLY_TYPES.contains(&ty.as_str()) {
                    warn!(
                        table,
                        column,
                        r#type = %ty,
                        "grouping column cannot be GiST-indexed"
                    );
                    fallback = true;
                }
            }
        }

        if fallback {
            warn!(
                table,
                "falling back to index-only path; overlap discipline is application-level"
            );
            let name = object_name(table, "nooverlap_idx", &[]);
            let mut columns: Vec<&str> = grouping.to_vec();
            columns.push(range_column);
            self.access
                .execute(&format!(
                    "CREATE INDEX IF NOT EXISTS {name} ON {table} USING btree ({})",
                    columns.join(", ")
                ))
                .await?;
            return Ok(ExclusionPath::IndexOnly);
        }

        if !grouping.is_empty() {
            // Equality operators on scalar grouping columns inside a GiST
            // index come from btree_gist.
            self.access
                .execute("CREATE EXTENSION IF NOT EXISTS btree_gist")
                .await?;
        }

        let name = object_name(table, "nooverlap", &[]);
        let mut elements = String::new();
        for column in grouping {
            elements.push_str(&format!("{column} WITH =, "));
        }
        elements.push_str(&format!("{range_column} WITH &&"));

        let mut sql = format!(
            "ALTER TABLE {table} ADD CONSTRAINT {name} EXCLUDE USING gist ({elements})"
        );
        if let Some(condition) = condition {
            sql.push_str(&format!(" WHERE ({condition})"));
        }
        sql.push_str(" DEFERRABLE INITIALLY DEFERRED");
        self.access.execute(&sql).await?;
        Ok(ExclusionPath::Native)
    }

    /// Drop the no-overlap guarantee, whichever path installed it.
    pub async fn remove_no_overlap(&self, table: &str) -> MigrateResult<()> {
        self.access
            .execute(&format!(
                "ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {}",
                object_name(table, "nooverlap", &[])
            ))
            .await?;
        self.access
            .execute(&format!(
                "DROP INDEX IF EXISTS {}",
                object_name(table, "nooverlap_idx", &[])
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAccess;

    fn state_table() -> MemoryAccess {
        let access = MemoryAccess::new();
        access.seed_table(
            "observationstate",
            &[
                ("machineid", "integer"),
                ("staterange", "tsrange"),
                ("payload", "jsonb"),
            ],
        );
        access
    }

    #[tokio::test]
    async fn test_native_path_installs_exclusion_constraint() {
        let access = state_table();
        let helper = ExclusionHelper::new(&access);
        let path = helper
            .add_no_overlap("observationstate", "staterange", &["machineid"])
            .await
            .unwrap();
        assert_eq!(path, ExclusionPath::Native);
        assert!(
            access
                .constraint_exists("observationstate", "observationstate_nooverlap")
                .await
                .unwrap()
        );
        let sql = access
            .executed()
            .into_iter()
            .find(|s| s.contains("EXCLUDE USING gist"))
            .unwrap();
        assert!(sql.contains("machineid WITH =, staterange WITH &&"));
        assert!(sql.contains("DEFERRABLE INITIALLY DEFERRED"));
    }

    #[tokio::test]
    async fn test_jsonb_grouping_column_forces_index_only_path() {
        let access = state_table();
        let helper = ExclusionHelper::new(&access);
        let path = helper
            .add_no_overlap("observationstate", "staterange", &["payload"])
            .await
            .unwrap();
        assert_eq!(path, ExclusionPath::IndexOnly);
        assert!(
            access
                .index_exists("observationstate_nooverlap_idx")
                .await
                .unwrap()
        );
        assert!(
            !access
                .constraint_exists("observationstate", "observationstate_nooverlap")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_backend_without_exclusion_support_degrades() {
        let access = state_table();
        access.disable_exclusion_constraints();
        let helper = ExclusionHelper::new(&access);
        let path = helper
            .add_no_overlap("observationstate", "staterange", &["machineid"])
            .await
            .unwrap();
        assert_eq!(path, ExclusionPath::IndexOnly);
    }

    #[tokio::test]
    async fn test_add_then_remove_clears_both_paths() {
        let access = state_table();
        let helper = ExclusionHelper::new(&access);
        helper
            .add_no_overlap("observationstate", "staterange", &["machineid"])
            .await
            .unwrap();
        helper.remove_no_overlap("observationstate").await.unwrap();
        assert!(
            !access
                .constraint_exists("observationstate", "observationstate_nooverlap")
                .await
                .unwrap()
        );
        assert!(
            !access
                .index_exists("observationstate_nooverlap_idx")
                .await
                .unwrap()
        );

        // re-callable shape: adding twice replaces, never throws
        helper
            .add_no_overlap("observationstate", "staterange", &["machineid"])
            .await
            .unwrap();
        helper
            .add_no_overlap("observationstate", "staterange", &["machineid"])
            .await
            .unwrap();
    }
}
