//! Error types for the migration engine
//!
//! Driver failures are normalized into [`DatabaseError`] at the backend seam so
//! the engine can tell a duplicate key apart from a lost connection without
//! knowing which driver produced it. Everything the engine reports to callers is
//! a [`MigrationError`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::migrations::definitions::MigrationDirection;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrationError>;

/// SQLSTATE reported by PostgreSQL for unique constraint violations
pub const UNIQUE_VIOLATION_SQLSTATE: &str = "23505";

/// SQLSTATEs reported by PostgreSQL when a relation or other object already exists
pub const DUPLICATE_OBJECT_SQLSTATES: [&str; 2] = ["42P07", "42710"];

/// Errors raised by a database backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    /// The backend could not be reached or the session was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// A unique or primary key constraint rejected the write
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The object a DDL statement creates is already there
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Any other statement failure
    #[error("query failed: {0}")]
    Query(String),
}

impl DatabaseError {
    /// Whether the failure is what a competing session creating the same
    /// object at the same moment produces. PostgreSQL reports a racing
    /// `CREATE TABLE IF NOT EXISTS` as a unique violation on its catalog.
    pub fn is_concurrent_creation(&self) -> bool {
        matches!(
            self,
            DatabaseError::UniqueViolation(_) | DatabaseError::AlreadyExists(_)
        )
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err)
                if db_err.is_unique_violation()
                    || db_err.code().as_deref() == Some(UNIQUE_VIOLATION_SQLSTATE) =>
            {
                DatabaseError::UniqueViolation(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err)
                if db_err
                    .code()
                    .map_or(false, |code| DUPLICATE_OBJECT_SQLSTATES.contains(&&*code)) =>
            {
                DatabaseError::AlreadyExists(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) => DatabaseError::Query(db_err.message().to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DatabaseError::Connection(err.to_string()),
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Errors surfaced by the migration engine
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The lock backend is unreachable; no migration was attempted
    #[error("lock backend error: {0}")]
    LockBackend(String),

    /// Reading or writing the version bookkeeping failed
    #[error("schema access failed while {action}: {source}")]
    SchemaAccess {
        action: &'static str,
        #[source]
        source: DatabaseError,
    },

    /// The database carries a legacy version this engine cannot upgrade from
    #[error(
        "must upgrade from db version {expected}, current db version: {}",
        describe_version(.found)
    )]
    UnsupportedLegacyVersion { expected: i64, found: Option<i64> },

    /// A statement inside a migration unit failed
    #[error("statement {statement} of migration {version} failed: {source}")]
    StatementExecution {
        version: i64,
        statement: usize,
        #[source]
        source: DatabaseError,
    },

    /// The version is already recorded as applied
    #[error("migration version {0} is already recorded as applied")]
    DuplicateVersion(i64),

    /// The version has no applied-version row to remove
    #[error("migration version {0} is not recorded as applied")]
    VersionNotRecorded(i64),

    /// A migration unit failed; earlier units remain applied
    #[error("migration {version} failed while migrating {direction}: {source}")]
    MigrationFailed {
        version: i64,
        direction: MigrationDirection,
        #[source]
        source: Box<MigrationError>,
    },

    /// Down was requested through a unit without down statements
    #[error("migration {0} has no down statements and cannot be reverted")]
    IrreversibleMigration(i64),

    /// The version is not part of the migration catalogue
    #[error("migration version {0} is not present in the migration catalogue")]
    UnknownVersion(i64),

    /// The requested target version is not usable
    #[error("invalid target version {0}")]
    InvalidTarget(i64),

    /// The migration catalogue is malformed
    #[error("invalid migration catalogue: {0}")]
    Catalogue(String),

    /// Configuration could not be loaded or validated
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl MigrationError {
    /// Wrap a backend failure that happened while touching bookkeeping state
    pub fn schema_access(action: &'static str) -> impl FnOnce(DatabaseError) -> MigrationError {
        move |source| MigrationError::SchemaAccess { action, source }
    }

    /// The version of the unit that failed, if this error names one
    pub fn failed_version(&self) -> Option<i64> {
        match self {
            MigrationError::MigrationFailed { version, .. }
            | MigrationError::StatementExecution { version, .. } => Some(*version),
            MigrationError::IrreversibleMigration(version)
            | MigrationError::UnknownVersion(version) => Some(*version),
            _ => None,
        }
    }

    /// The innermost engine error behind any `MigrationFailed` wrappers
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::MigrationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn describe_version(version: &Option<i64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_error_names_both_versions() {
        let err = MigrationError::UnsupportedLegacyVersion {
            expected: 189,
            found: Some(150),
        };
        assert_eq!(
            err.to_string(),
            "must upgrade from db version 189, current db version: 150"
        );

        let empty = MigrationError::UnsupportedLegacyVersion {
            expected: 189,
            found: None,
        };
        assert!(empty.to_string().ends_with("current db version: none"));
    }

    #[test]
    fn test_failed_migration_exposes_root_cause() {
        let err = MigrationError::MigrationFailed {
            version: 2,
            direction: MigrationDirection::Up,
            source: Box::new(MigrationError::StatementExecution {
                version: 2,
                statement: 0,
                source: DatabaseError::Query("relation \"foo\" does not exist".to_string()),
            }),
        };

        assert_eq!(err.failed_version(), Some(2));
        assert!(matches!(
            err.root_cause(),
            MigrationError::StatementExecution { statement: 0, .. }
        ));
        assert!(err.to_string().contains("migration 2 failed while migrating up"));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_concurrent_creation_errors() {
        assert!(DatabaseError::UniqueViolation(
            "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"".to_string()
        )
        .is_concurrent_creation());
        assert!(DatabaseError::AlreadyExists("relation \"schema_migrations\" already exists".to_string())
            .is_concurrent_creation());
        assert!(!DatabaseError::Query("syntax error".to_string()).is_concurrent_creation());
        assert!(!DatabaseError::Connection("reset".to_string()).is_concurrent_creation());
    }

    #[test]
    fn test_schema_access_helper() {
        let wrap = MigrationError::schema_access("reading the current version");
        let err = wrap(DatabaseError::Connection("reset by peer".to_string()));
        assert_eq!(
            err.to_string(),
            "schema access failed while reading the current version: connection error: reset by peer"
        );
    }
}
