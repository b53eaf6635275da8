//! Error types for the migration engine.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two change units were registered with the same version number.
    #[error("duplicate version {version}: '{duplicate}' collides with '{existing}'")]
    DuplicateVersion {
        /// The colliding version number.
        version: i64,
        /// Name of the unit already registered under this version.
        existing: String,
        /// Name of the unit that attempted to register.
        duplicate: String,
    },

    /// A version was requested that no registered change unit carries.
    #[error("unknown version {0}")]
    UnknownVersion(i64),

    /// Another runner holds the migration advisory lock.
    #[error("another migration run is in progress (advisory lock held)")]
    MigrationInProgress,

    /// The database rejected a statement.
    #[error("statement failed: {message} (sql: {sql})")]
    Statement {
        /// The statement that was rejected.
        sql: String,
        /// The database error text.
        message: String,
        /// SQLSTATE code, when the backend reports one.
        code: Option<String>,
    },

    /// The live partitioning state of a table contradicts the requested
    /// transition, or a scratch relation from an earlier attempt is in the way.
    #[error("partition state inconsistent for '{table}': {detail}")]
    PartitionStateInconsistent {
        /// The table whose state is inconsistent.
        table: String,
        /// What was found.
        detail: String,
    },

    /// A row was rejected because its validity range overlaps an existing row
    /// with the same grouping key.
    #[error("overlapping range rejected on '{table}': {detail}")]
    RangeOverlap {
        /// The protected table.
        table: String,
        /// The database error text.
        detail: String,
    },

    /// A change unit exceeded the configured per-unit timeout and its
    /// transaction was rolled back.
    #[error("version {version} timed out after {elapsed_ms}ms and was rolled back")]
    MigrationTimedOut {
        /// The version that timed out.
        version: i64,
        /// Time spent before the rollback.
        elapsed_ms: u64,
    },

    /// Down was invoked on a unit documented as non-reversible.
    #[error("version {version} ('{name}') is irreversible and cannot be reverted")]
    IrreversibleMigration {
        /// The irreversible version.
        version: i64,
        /// Its name, for logs.
        name: String,
    },

    /// A change unit failed; the batch stopped at this version.
    #[error("version {version} ('{name}') failed; the batch stopped there and attempted nothing further")]
    UnitFailed {
        /// The failing version.
        version: i64,
        /// Its name, for logs.
        name: String,
        /// The underlying fault.
        #[source]
        source: Box<MigrationError>,
    },

    /// Connecting to or talking to the database failed outside any statement.
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MigrationError {
    /// Create a statement error without a SQLSTATE code.
    pub fn statement(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            sql: sql.into(),
            message: message.into(),
            code: None,
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a partition state error.
    pub fn partition_state(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PartitionStateInconsistent {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// The version this error pins the failure to, when there is one.
    pub fn failing_version(&self) -> Option<i64> {
        match self {
            Self::UnitFailed { version, .. }
            | Self::MigrationTimedOut { version, .. }
            | Self::IrreversibleMigration { version, .. } => Some(*version),
            Self::UnknownVersion(version) | Self::DuplicateVersion { version, .. } => {
                Some(*version)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_failed_names_version() {
        let err = MigrationError::UnitFailed {
            version: 7,
            name: "add_observation_state".to_string(),
            source: Box::new(MigrationError::statement("ALTER TABLE x", "boom")),
        };
        assert!(err.to_string().contains("version 7"));
        assert_eq!(err.failing_version(), Some(7));
        // the wording must hold for down batches too, where earlier work in
        // the batch sits above the failing version
        assert!(!err.to_string().contains("at or above"));
        assert!(err.to_string().contains("attempted nothing further"));
    }

    #[test]
    fn test_statement_display_carries_sql() {
        let err = MigrationError::statement("CREATE INDEX a ON b (c)", "relation missing");
        let msg = err.to_string();
        assert!(msg.contains("relation missing"));
        assert!(msg.contains("CREATE INDEX"));
    }

    #[test]
    fn test_failing_version_absent_for_ambient_errors() {
        assert_eq!(MigrationError::MigrationInProgress.failing_version(), None);
        assert_eq!(
            MigrationError::connection("refused").failing_version(),
            None
        );
    }
}
