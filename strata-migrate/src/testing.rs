//! In-memory [`SchemaAccess`] backend for tests.
//!
//! [`MemoryAccess`] interprets the DDL shapes the engine itself emits and
//! keeps the resulting catalog in process memory, so engine behavior
//! (idempotence, transaction bracketing, partition round trips) is testable
//! without a running database. It is a catalog simulator, not a SQL engine:
//! a statement outside the engine's own vocabulary is rejected.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::access::{Capabilities, SchemaAccess, SchemaObject};
use crate::error::{MigrateResult, MigrationError};
use crate::state::STATE_TABLE;

#[derive(Debug, Clone, Default)]
struct CatalogState {
    /// table -> ordered (column, type) pairs
    tables: HashMap<String, Vec<(String, String)>>,
    /// index name -> (table, full definition)
    indexes: HashMap<String, (String, String)>,
    /// (table, constraint name)
    constraints: HashSet<(String, String)>,
    /// constraint name -> (child table, referenced table, full definition)
    foreign_keys: HashMap<String, (String, String, String)>,
    partitioned: HashSet<String>,
    /// parent -> child partition tables
    children: HashMap<String, Vec<String>>,
    /// applied-version rows: (version, name, applied_at as text)
    records: Vec<(i64, String, String)>,
}

#[derive(Default)]
struct Inner {
    state: CatalogState,
    snapshot: Option<CatalogState>,
    executed: Vec<String>,
    failing_fragments: Vec<String>,
    stubbed_queries: Vec<(String, Vec<String>)>,
    own_locks: HashSet<i64>,
    foreign_locks: HashSet<i64>,
    capabilities: Capabilities,
}

/// In-memory schema catalog behind the [`SchemaAccess`] trait.
#[derive(Default)]
pub struct MemoryAccess {
    inner: Mutex<Inner>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seed a table with its columns and storage types.
    pub fn seed_table(&self, table: &str, columns: &[(&str, &str)]) {
        self.lock().state.tables.insert(
            table.to_string(),
            columns
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect(),
        );
    }

    /// Seed an index as the catalog would report it.
    pub fn seed_index(&self, table: &str, name: &str, definition: &str) {
        self.lock()
            .state
            .indexes
            .insert(name.to_string(), (table.to_string(), definition.to_string()));
    }

    /// Seed a foreign key from `child` to `referenced`.
    pub fn seed_foreign_key(&self, child: &str, referenced: &str, name: &str, definition: &str) {
        let mut inner = self.lock();
        inner.state.foreign_keys.insert(
            name.to_string(),
            (child.to_string(), referenced.to_string(), definition.to_string()),
        );
        inner
            .state
            .constraints
            .insert((child.to_string(), name.to_string()));
    }

    /// Answer any `query_strings` call whose SQL contains `fragment` with
    /// these rows.
    pub fn stub_rows(&self, fragment: &str, rows: &[&str]) {
        self.lock().stubbed_queries.push((
            fragment.to_string(),
            rows.iter().map(|r| r.to_string()).collect(),
        ));
    }

    /// Make any statement containing `fragment` fail.
    pub fn fail_on(&self, fragment: &str) {
        self.lock().failing_fragments.push(fragment.to_string());
    }

    /// Every statement the engine sent, in order, including rolled-back ones.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Simulate another session holding the advisory lock.
    pub fn hold_advisory_lock(&self, key: i64) {
        self.lock().foreign_locks.insert(key);
    }

    /// Report a backend without exclusion constraint support.
    pub fn disable_exclusion_constraints(&self) {
        self.lock().capabilities.exclusion_constraints = false;
    }

    /// Report a backend without native partitioning.
    pub fn disable_native_partitioning(&self) {
        self.lock().capabilities.native_partitioning = false;
    }

    fn check_failure(&self, inner: &Inner, sql: &str) -> MigrateResult<()> {
        for fragment in &inner.failing_fragments {
            if sql.contains(fragment.as_str()) {
                return Err(MigrationError::statement(sql, "injected failure"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaAccess for MemoryAccess {
    async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        let mut inner = self.lock();
        inner.executed.push(sql.to_string());
        self.check_failure(&inner, sql)?;
        apply_statement(&mut inner.state, sql)
    }

    async fn batch_execute(&self, sql: &str) -> MigrateResult<()> {
        let mut inner = self.lock();
        inner.executed.push(sql.to_string());
        self.check_failure(&inner, sql)?;
        // The only batch the engine sends is the idempotent state table
        // bootstrap; the record store exists unconditionally here.
        Ok(())
    }

    async fn query_i64_column(&self, sql: &str) -> MigrateResult<Vec<i64>> {
        let inner = self.lock();
        if sql.contains(STATE_TABLE) {
            let mut versions: Vec<i64> = inner.state.records.iter().map(|r| r.0).collect();
            versions.sort_unstable();
            return Ok(versions);
        }
        Err(MigrationError::statement(sql, "query not understood by the in-memory backend"))
    }

    async fn query_strings(&self, sql: &str) -> MigrateResult<Vec<String>> {
        let inner = self.lock();
        for (fragment, rows) in &inner.stubbed_queries {
            if sql.contains(fragment.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn query_string_rows(&self, sql: &str) -> MigrateResult<Vec<Vec<String>>> {
        let inner = self.lock();
        if sql.contains(STATE_TABLE) {
            let mut records = inner.state.records.clone();
            records.sort_by_key(|r| r.0);
            return Ok(records
                .into_iter()
                .map(|(version, name, applied_at)| vec![version.to_string(), name, applied_at])
                .collect());
        }
        Err(MigrationError::statement(sql, "query not understood by the in-memory backend"))
    }

    async fn table_exists(&self, table: &str) -> MigrateResult<bool> {
        Ok(self.lock().state.tables.contains_key(table))
    }

    async fn column_exists(&self, table: &str, column: &str) -> MigrateResult<bool> {
        let inner = self.lock();
        Ok(inner
            .state
            .tables
            .get(table)
            .is_some_and(|cols| cols.iter().any(|(c, _)| c == column)))
    }

    async fn column_type(&self, table: &str, column: &str) -> MigrateResult<Option<String>> {
        let inner = self.lock();
        Ok(inner.state.tables.get(table).and_then(|cols| {
            cols.iter()
                .find(|(c, _)| c == column)
                .map(|(_, ty)| ty.clone())
        }))
    }

    async fn constraint_exists(&self, table: &str, name: &str) -> MigrateResult<bool> {
        let inner = self.lock();
        Ok(inner
            .state
            .constraints
            .contains(&(table.to_string(), name.to_string())))
    }

    async fn index_exists(&self, name: &str) -> MigrateResult<bool> {
        Ok(self.lock().state.indexes.contains_key(name))
    }

    async fn table_is_partitioned(&self, table: &str) -> MigrateResult<bool> {
        Ok(self.lock().state.partitioned.contains(table))
    }

    async fn index_definitions(&self, table: &str) -> MigrateResult<Vec<SchemaObject>> {
        let inner = self.lock();
        let mut objects: Vec<SchemaObject> = inner
            .state
            .indexes
            .iter()
            .filter(|(_, (t, _))| t == table)
            .map(|(name, (t, definition))| SchemaObject {
                table: t.clone(),
                name: name.clone(),
                definition: definition.clone(),
            })
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn foreign_key_definitions(&self, table: &str) -> MigrateResult<Vec<SchemaObject>> {
        let inner = self.lock();
        let mut objects: Vec<SchemaObject> = inner
            .state
            .foreign_keys
            .iter()
            .filter(|(_, (child, referenced, _))| child == table || referenced == table)
            .map(|(name, (child, _, definition))| SchemaObject {
                table: child.clone(),
                name: name.clone(),
                definition: definition.clone(),
            })
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn begin(&self) -> MigrateResult<()> {
        let mut inner = self.lock();
        inner.executed.push("BEGIN".to_string());
        let snapshot = inner.state.clone();
        inner.snapshot = Some(snapshot);
        Ok(())
    }

    async fn commit(&self) -> MigrateResult<()> {
        let mut inner = self.lock();
        inner.executed.push("COMMIT".to_string());
        inner.snapshot = None;
        Ok(())
    }

    async fn rollback(&self) -> MigrateResult<()> {
        let mut inner = self.lock();
        inner.executed.push("ROLLBACK".to_string());
        if let Some(snapshot) = inner.snapshot.take() {
            inner.state = snapshot;
        }
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> MigrateResult<bool> {
        let mut inner = self.lock();
        if inner.foreign_locks.contains(&key) {
            return Ok(false);
        }
        inner.own_locks.insert(key);
        Ok(true)
    }

    async fn release_advisory_lock(&self, key: i64) -> MigrateResult<()> {
        self.lock().own_locks.remove(&key);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.lock().capabilities
    }
}

/// Interpret one engine-emitted statement against the catalog.
fn apply_statement(state: &mut CatalogState, sql: &str) -> MigrateResult<u64> {
    let trimmed = sql.trim();
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();

    if trimmed.starts_with("ALTER TABLE") {
        return alter_table(state, trimmed, &tokens);
    }
    if trimmed.starts_with("CREATE TABLE") {
        return create_table(state, trimmed, &tokens);
    }
    if trimmed.starts_with("CREATE INDEX") || trimmed.starts_with("CREATE UNIQUE INDEX") {
        return create_index(state, trimmed, &tokens);
    }
    if trimmed.starts_with("DROP INDEX IF EXISTS") {
        if let Some(name) = tokens.get(4) {
            state.indexes.remove(*name);
        }
        return Ok(0);
    }
    if trimmed.starts_with("DROP TABLE") {
        if let Some(table) = tokens.get(2) {
            drop_table(state, table);
        }
        return Ok(0);
    }
    if trimmed.starts_with(&format!("INSERT INTO {STATE_TABLE}")) {
        return insert_record(state, trimmed);
    }
    if trimmed.starts_with(&format!("DELETE FROM {STATE_TABLE}")) {
        return delete_record(state, trimmed);
    }
    if trimmed.starts_with("INSERT INTO")
        || trimmed.starts_with("CREATE EXTENSION")
        || trimmed.starts_with("SELECT SETVAL")
    {
        // row movement, extensions and sequence twiddling have no catalog
        // footprint here
        return Ok(0);
    }
    Err(MigrationError::statement(
        sql,
        "statement not understood by the in-memory backend",
    ))
}

fn alter_table(state: &mut CatalogState, sql: &str, tokens: &[&str]) -> MigrateResult<u64> {
    let table = match tokens.get(2) {
        Some(t) => t.to_string(),
        None => return Err(MigrationError::statement(sql, "malformed ALTER TABLE")),
    };
    match (tokens.get(3), tokens.get(4)) {
        (Some(&"ADD"), Some(&"COLUMN")) => {
            let column = tokens.get(5).unwrap_or(&"").to_string();
            let ty = tokens.get(6).unwrap_or(&"text").to_lowercase();
            if let Some(cols) = state.tables.get_mut(&table) {
                if cols.iter().any(|(c, _)| *c == column) {
                    return Err(MigrationError::statement(sql, "column already exists"));
                }
                cols.push((column, ty));
                return Ok(0);
            }
            Err(MigrationError::statement(sql, "no such table"))
        }
        (Some(&"DROP"), Some(&"COLUMN")) => {
            let column = tokens.get(5).unwrap_or(&"");
            if let Some(cols) = state.tables.get_mut(&table) {
                cols.retain(|(c, _)| c != column);
            }
            Ok(0)
        }
        (Some(&"ALTER"), Some(&"COLUMN")) => {
            // only SET DATA TYPE changes the catalog shape tracked here
            if let Some(pos) = tokens.iter().position(|t| *t == "TYPE") {
                let column = tokens.get(5).unwrap_or(&"").to_string();
                let ty = tokens.get(pos + 1).unwrap_or(&"text").to_lowercase();
                if let Some(cols) = state.tables.get_mut(&table) {
                    for (c, t) in cols.iter_mut() {
                        if *c == column {
                            *t = ty.clone();
                        }
                    }
                }
            }
            Ok(0)
        }
        (Some(&"ADD"), Some(&"CONSTRAINT")) => {
            let name = tokens.get(5).unwrap_or(&"").to_string();
            if state.constraints.contains(&(table.clone(), name.clone())) {
                return Err(MigrationError::statement(sql, "constraint already exists"));
            }
            if sql.contains("FOREIGN KEY") {
                if let Some(pos) = tokens.iter().position(|t| *t == "REFERENCES") {
                    let referenced = tokens
                        .get(pos + 1)
                        .unwrap_or(&"")
                        .trim_end_matches('(')
                        .to_string();
                    state
                        .foreign_keys
                        .insert(name.clone(), (table.clone(), referenced, sql.to_string()));
                }
            }
            state.constraints.insert((table, name));
            Ok(0)
        }
        (Some(&"DROP"), Some(&"CONSTRAINT")) => {
            let name = tokens.last().unwrap_or(&"").to_string();
            let was_present = state.constraints.remove(&(table, name.clone()));
            state.foreign_keys.remove(&name);
            if !was_present && !sql.contains("IF EXISTS") {
                return Err(MigrationError::statement(sql, "no such constraint"));
            }
            Ok(0)
        }
        (Some(&"RENAME"), Some(&"TO")) => {
            let new = tokens.get(5).unwrap_or(&"").to_string();
            if let Some(cols) = state.tables.remove(&table) {
                state.tables.insert(new.clone(), cols);
            }
            if state.partitioned.remove(&table) {
                state.partitioned.insert(new.clone());
            }
            if let Some(children) = state.children.remove(&table) {
                state.children.insert(new, children);
            }
            Ok(0)
        }
        _ => Err(MigrationError::statement(
            sql,
            "ALTER TABLE form not understood by the in-memory backend",
        )),
    }
}

fn create_table(state: &mut CatalogState, sql: &str, tokens: &[&str]) -> MigrateResult<u64> {
    let table = match tokens.get(2) {
        Some(t) => t.to_string(),
        None => return Err(MigrationError::statement(sql, "malformed CREATE TABLE")),
    };
    if state.tables.contains_key(&table) {
        return Err(MigrationError::statement(sql, "table already exists"));
    }

    if let Some(pos) = tokens.iter().position(|t| *t == "PARTITION") {
        if tokens.get(pos + 1) == Some(&"OF") {
            // CREATE TABLE child PARTITION OF parent ...
            let parent = tokens.get(pos + 2).unwrap_or(&"").to_string();
            let cols = state.tables.get(&parent).cloned().unwrap_or_default();
            state.tables.insert(table.clone(), cols);
            state.children.entry(parent).or_default().push(table);
            return Ok(0);
        }
    }

    if let Some(pos) = tokens.iter().position(|t| *t == "(LIKE") {
        let source = tokens.get(pos + 1).unwrap_or(&"").to_string();
        let cols = match state.tables.get(&source) {
            Some(cols) => cols.clone(),
            None => return Err(MigrationError::statement(sql, "LIKE source table missing")),
        };
        state.tables.insert(table.clone(), cols);
        if sql.contains("PARTITION BY") {
            state.partitioned.insert(table);
        }
        return Ok(0);
    }

    Err(MigrationError::statement(
        sql,
        "CREATE TABLE form not understood by the in-memory backend",
    ))
}

fn create_index(state: &mut CatalogState, sql: &str, tokens: &[&str]) -> MigrateResult<u64> {
    let mut rest = match tokens.iter().position(|t| *t == "INDEX") {
        Some(pos) => pos + 1,
        None => return Err(MigrationError::statement(sql, "malformed CREATE INDEX")),
    };
    let guarded = tokens.get(rest) == Some(&"IF");
    if guarded {
        // skip "IF NOT EXISTS"
        rest += 3;
    }
    let name = tokens.get(rest).unwrap_or(&"").to_string();
    if state.indexes.contains_key(&name) {
        if guarded {
            return Ok(0);
        }
        return Err(MigrationError::statement(sql, "index already exists"));
    }
    let table = match tokens.iter().position(|t| *t == "ON") {
        Some(pos) => tokens.get(pos + 1).unwrap_or(&"").to_string(),
        None => return Err(MigrationError::statement(sql, "malformed CREATE INDEX")),
    };
    state.indexes.insert(name, (table, sql.to_string()));
    Ok(0)
}

fn drop_table(state: &mut CatalogState, table: &str) {
    state.tables.remove(table);
    state.partitioned.remove(table);
    state.indexes.retain(|_, (t, _)| t != table);
    let doomed: Vec<String> = state
        .foreign_keys
        .iter()
        .filter(|(_, (child, referenced, _))| child == table || referenced == table)
        .map(|(name, _)| name.clone())
        .collect();
    for name in doomed {
        state.foreign_keys.remove(&name);
        state.constraints.retain(|(_, n)| *n != name);
    }
    state.constraints.retain(|(t, _)| t != table);
    if let Some(children) = state.children.remove(table) {
        for child in children {
            drop_table(state, &child);
        }
    }
}

fn insert_record(state: &mut CatalogState, sql: &str) -> MigrateResult<u64> {
    let values = match sql.split_once("VALUES") {
        Some((_, values)) => values,
        None => return Err(MigrationError::statement(sql, "malformed INSERT")),
    };
    let version: i64 = values
        .trim_start()
        .trim_start_matches('(')
        .split(',')
        .next()
        .unwrap_or("")
        .trim()
        .parse()
        .map_err(|e| MigrationError::statement(sql, format!("bad version literal: {e}")))?;
    let first = values.find('\'');
    let last = values.rfind('\'');
    let name = match (first, last) {
        (Some(a), Some(b)) if b > a => values[a + 1..b].replace("''", "'"),
        _ => return Err(MigrationError::statement(sql, "bad name literal")),
    };
    if state.records.iter().any(|(v, _, _)| *v == version) {
        return Err(MigrationError::statement(sql, "duplicate key"));
    }
    state.records.push((
        version,
        name,
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    ));
    Ok(1)
}

fn delete_record(state: &mut CatalogState, sql: &str) -> MigrateResult<u64> {
    let version: i64 = match sql.rsplit_once('=') {
        Some((_, v)) => v
            .trim()
            .parse()
            .map_err(|e| MigrationError::statement(sql, format!("bad version literal: {e}")))?,
        None => return Err(MigrationError::statement(sql, "malformed DELETE")),
    };
    let before = state.records.len();
    state.records.retain(|(v, _, _)| *v != version);
    Ok((before - state.records.len()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rollback_restores_catalog_and_records() {
        let access = MemoryAccess::new();
        access.seed_table("machine", &[("machineid", "integer")]);

        access.begin().await.unwrap();
        access
            .execute("ALTER TABLE machine ADD COLUMN cellid integer")
            .await
            .unwrap();
        access
            .execute("INSERT INTO _strata_migrations (version, name) VALUES (5, 'five')")
            .await
            .unwrap();
        assert!(access.column_exists("machine", "cellid").await.unwrap());
        access.rollback().await.unwrap();

        assert!(!access.column_exists("machine", "cellid").await.unwrap());
        assert!(
            access
                .query_i64_column("SELECT version FROM _strata_migrations ORDER BY version")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_unknown_statement_is_rejected() {
        let access = MemoryAccess::new();
        assert!(access.execute("VACUUM FULL").await.is_err());
    }

    #[tokio::test]
    async fn test_quoted_name_round_trips() {
        let access = MemoryAccess::new();
        access
            .execute("INSERT INTO _strata_migrations (version, name) VALUES (1, 'it''s fine')")
            .await
            .unwrap();
        let rows = access
            .query_string_rows("SELECT version::text, name, to_char(applied_at AT TIME ZONE 'UTC', 'x') FROM _strata_migrations ORDER BY version")
            .await
            .unwrap();
        assert_eq!(rows[0][1], "it's fine");
    }
}
