//! PostgreSQL implementation of the engine's access surface.
//!
//! A migration run owns exactly one connection. Advisory locks and
//! `BEGIN`/`COMMIT`/`ROLLBACK` are session state, so pooling would break
//! both; everything the run does goes through this one session, and a crash
//! releases the lock with it.

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use strata_migrate::access::{Capabilities, SchemaAccess, SchemaObject};
use strata_migrate::error::{MigrateResult, MigrationError};

use crate::config::PgConfig;

/// Single-connection PostgreSQL backend.
pub struct PgAccess {
    client: Client,
    capabilities: Capabilities,
}

impl PgAccess {
    /// Connect and probe what the server supports.
    pub async fn connect(config: &PgConfig) -> MigrateResult<Self> {
        let (client, connection) = config
            .to_pg_config()
            .connect(NoTls)
            .await
            .map_err(|e| MigrationError::connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "database connection task failed");
            }
        });

        let capabilities = probe_capabilities(&client).await?;
        info!(
            host = %config.host,
            database = %config.database,
            ?capabilities,
            "connected"
        );
        Ok(Self {
            client,
            capabilities,
        })
    }

    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> MigrateResult<Vec<Row>> {
        debug!(sql = %sql, "executing query");
        self.client
            .query(sql, params)
            .await
            .map_err(|e| classify(sql, &e))
    }

    async fn query_bool(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> MigrateResult<bool> {
        let row = self
            .client
            .query_one(sql, params)
            .await
            .map_err(|e| classify(sql, &e))?;
        row.try_get(0)
            .map_err(|e| MigrationError::statement(sql, e.to_string()))
    }
}

#[async_trait]
impl SchemaAccess for PgAccess {
    async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        debug!(sql = %sql, "executing statement");
        self.client
            .execute(sql, &[])
            .await
            .map_err(|e| classify(sql, &e))
    }

    async fn batch_execute(&self, sql: &str) -> MigrateResult<()> {
        debug!(sql = %sql, "executing batch");
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| classify(sql, &e))
    }

    async fn query_i64_column(&self, sql: &str) -> MigrateResult<Vec<i64>> {
        let rows = self.query(sql, &[]).await?;
        rows.iter()
            .map(|row| {
                row.try_get(0)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))
            })
            .collect()
    }

    async fn query_strings(&self, sql: &str) -> MigrateResult<Vec<String>> {
        let rows = self.query(sql, &[]).await?;
        rows.iter()
            .map(|row| {
                row.try_get(0)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))
            })
            .collect()
    }

    async fn query_string_rows(&self, sql: &str) -> MigrateResult<Vec<Vec<String>>> {
        let rows = self.query(sql, &[]).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| {
                        row.try_get(i)
                            .map_err(|e| MigrationError::statement(sql, e.to_string()))
                    })
                    .collect()
            })
            .collect()
    }

    async fn table_exists(&self, table: &str) -> MigrateResult<bool> {
        self.query_bool(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
            &[&table],
        )
        .await
    }

    async fn column_exists(&self, table: &str, column: &str) -> MigrateResult<bool> {
        self.query_bool(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 AND column_name = $2)",
            &[&table, &column],
        )
        .await
    }

    async fn column_type(&self, table: &str, column: &str) -> MigrateResult<Option<String>> {
        let sql = "SELECT udt_name FROM information_schema.columns \
                   WHERE table_schema = 'public' AND table_name = $1 AND column_name = $2";
        let row = self
            .client
            .query_opt(sql, &[&table, &column])
            .await
            .map_err(|e| classify(sql, &e))?;
        match row {
            Some(row) => {
                let ty: String = row
                    .try_get(0)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
                Ok(Some(ty.to_lowercase()))
            }
            None => Ok(None),
        }
    }

    async fn constraint_exists(&self, table: &str, name: &str) -> MigrateResult<bool> {
        self.query_bool(
            "SELECT EXISTS (SELECT 1 FROM pg_constraint c \
             JOIN pg_class t ON c.conrelid = t.oid \
             WHERE t.relname = $1 AND c.conname = $2)",
            &[&table, &name],
        )
        .await
    }

    async fn index_exists(&self, name: &str) -> MigrateResult<bool> {
        self.query_bool(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes \
             WHERE schemaname = 'public' AND indexname = $1)",
            &[&name],
        )
        .await
    }

    async fn table_is_partitioned(&self, table: &str) -> MigrateResult<bool> {
        self.query_bool(
            "SELECT EXISTS (SELECT 1 FROM pg_partitioned_table p \
             JOIN pg_class c ON p.partrelid = c.oid \
             WHERE c.relname = $1)",
            &[&table],
        )
        .await
    }

    async fn index_definitions(&self, table: &str) -> MigrateResult<Vec<SchemaObject>> {
        let sql = "SELECT indexname, indexdef FROM pg_indexes \
                   WHERE schemaname = 'public' AND tablename = $1 ORDER BY indexname";
        let rows = self.query(sql, &[&table]).await?;
        rows.iter()
            .map(|row| {
                let name: String = row
                    .try_get(0)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
                let definition: String = row
                    .try_get(1)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
                Ok(SchemaObject {
                    table: table.to_string(),
                    name,
                    definition,
                })
            })
            .collect()
    }

    async fn foreign_key_definitions(&self, table: &str) -> MigrateResult<Vec<SchemaObject>> {
        // Both directions: the table's own foreign keys and those of other
        // tables pointing at it. The composed statement recreates the
        // constraint verbatim after the table is rebuilt.
        let sql = "SELECT child.relname, con.conname, \
                   'ALTER TABLE ' || child.relname || ' ADD CONSTRAINT ' || con.conname \
                   || ' ' || pg_get_constraintdef(con.oid) \
                   FROM pg_constraint con \
                   JOIN pg_class child ON con.conrelid = child.oid \
                   JOIN pg_class parent ON con.confrelid = parent.oid \
                   WHERE con.contype = 'f' AND (child.relname = $1 OR parent.relname = $1) \
                   ORDER BY con.conname";
        let rows = self.query(sql, &[&table]).await?;
        rows.iter()
            .map(|row| {
                let child: String = row
                    .try_get(0)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
                let name: String = row
                    .try_get(1)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
                let definition: String = row
                    .try_get(2)
                    .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
                Ok(SchemaObject {
                    table: child,
                    name,
                    definition,
                })
            })
            .collect()
    }

    async fn begin(&self) -> MigrateResult<()> {
        debug!("beginning transaction");
        self.batch_execute("BEGIN").await
    }

    async fn commit(&self) -> MigrateResult<()> {
        debug!("committing transaction");
        self.batch_execute("COMMIT").await
    }

    async fn rollback(&self) -> MigrateResult<()> {
        debug!("rolling back transaction");
        self.batch_execute("ROLLBACK").await
    }

    async fn try_advisory_lock(&self, key: i64) -> MigrateResult<bool> {
        self.query_bool("SELECT pg_try_advisory_lock($1)", &[&key])
            .await
    }

    async fn release_advisory_lock(&self, key: i64) -> MigrateResult<()> {
        self.query_bool("SELECT pg_advisory_unlock($1)", &[&key])
            .await?;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

async fn probe_capabilities(client: &Client) -> MigrateResult<Capabilities> {
    let sql = "SELECT current_setting('server_version_num')::bigint, \
               EXISTS (SELECT 1 FROM pg_available_extensions WHERE name = 'btree_gist')";
    let row = client
        .query_one(sql, &[])
        .await
        .map_err(|e| classify(sql, &e))?;
    let version: i64 = row
        .try_get(0)
        .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
    let btree_gist: bool = row
        .try_get(1)
        .map_err(|e| MigrationError::statement(sql, e.to_string()))?;
    Ok(Capabilities {
        exclusion_constraints: btree_gist,
        // declarative partitioning arrived in PostgreSQL 10
        native_partitioning: version >= 100_000,
    })
}

/// SQLSTATE for an exclusion constraint violation.
const EXCLUSION_VIOLATION: &str = "23P01";

fn classify(sql: &str, err: &tokio_postgres::Error) -> MigrationError {
    match err.as_db_error() {
        Some(db) => classify_db_error(
            sql,
            db.message(),
            Some(db.code().code()),
            db.table(),
        ),
        None => MigrationError::connection(err.to_string()),
    }
}

/// Map a database error to the engine's taxonomy. Pure so the mapping is
/// testable without a server.
fn classify_db_error(
    sql: &str,
    message: &str,
    code: Option<&str>,
    table: Option<&str>,
) -> MigrationError {
    if code == Some(EXCLUSION_VIOLATION) {
        return MigrationError::RangeOverlap {
            table: table.unwrap_or_default().to_string(),
            detail: message.to_string(),
        };
    }
    MigrationError::Statement {
        sql: sql.to_string(),
        message: message.to_string(),
        code: code.map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exclusion_violation_maps_to_range_overlap() {
        let err = classify_db_error(
            "INSERT INTO machinestate VALUES (...)",
            "conflicting key value violates exclusion constraint \"machinestate_nooverlap\"",
            Some("23P01"),
            Some("machinestate"),
        );
        match err {
            MigrationError::RangeOverlap { table, detail } => {
                assert_eq!(table, "machinestate");
                assert!(detail.contains("machinestate_nooverlap"));
            }
            other => panic!("expected RangeOverlap, got {other:?}"),
        }
    }

    #[test]
    fn test_other_sqlstates_stay_statement_errors() {
        let err = classify_db_error(
            "ALTER TABLE missing ADD COLUMN c integer",
            "relation \"missing\" does not exist",
            Some("42P01"),
            None,
        );
        match err {
            MigrationError::Statement { code, .. } => {
                assert_eq!(code.as_deref(), Some("42P01"));
            }
            other => panic!("expected Statement, got {other:?}"),
        }
    }

    #[test]
    fn test_codeless_error_keeps_sql_context() {
        let err = classify_db_error("SELECT 1", "boom", None, None);
        match err {
            MigrationError::Statement { sql, code, .. } => {
                assert_eq!(sql, "SELECT 1");
                assert_eq!(code, None);
            }
            other => panic!("expected Statement, got {other:?}"),
        }
    }
}
