//! Version Store - Applied-version bookkeeping inside the target database
//!
//! One row per applied unit in a single-column table. Every operation takes
//! the executor to run against, so the same calls work on a bare session and
//! inside the transaction that applies a unit.

use tracing::debug;

use super::definitions::NO_MIGRATIONS_APPLIED;
use crate::backends::{DatabaseValue, SqlDialect, SqlExecutor};
use crate::error::{DatabaseError, MigrateResult, MigrationError};
use crate::security::validate_identifier;

/// Default name of the applied-version table
pub const DEFAULT_VERSION_TABLE: &str = "schema_migrations";

/// Applied-version table for one database
#[derive(Debug, Clone)]
pub struct VersionStore {
    table: String,
    dialect: SqlDialect,
}

impl VersionStore {
    pub fn new(table: impl Into<String>, dialect: SqlDialect) -> MigrateResult<Self> {
        let table = table.into();
        validate_identifier("version_table", &table)?;
        Ok(Self { table, dialect })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Create the table if it is absent.
    ///
    /// Succeeds when another session creates the table at the same time.
    /// Inside a transaction the losing statement may have aborted it, in which
    /// case the original error is returned for the caller to retry.
    pub async fn ensure_table<E>(&self, executor: &mut E) -> MigrateResult<()>
    where
        E: SqlExecutor + ?Sized,
    {
        if self.table_exists(executor).await? {
            return Ok(());
        }

        match executor.execute(&self.create_table_sql(), &[]).await {
            Ok(_) => Ok(()),
            Err(source) if source.is_concurrent_creation() => {
                if matches!(self.table_exists(executor).await, Ok(true)) {
                    debug!("Version table {} was created by another session", self.table);
                    Ok(())
                } else {
                    Err(MigrationError::SchemaAccess {
                        action: "creating the version table",
                        source,
                    })
                }
            }
            Err(source) => Err(MigrationError::SchemaAccess {
                action: "creating the version table",
                source,
            }),
        }
    }

    /// Whether the version table exists
    pub async fn table_exists<E>(&self, executor: &mut E) -> MigrateResult<bool>
    where
        E: SqlExecutor + ?Sized,
    {
        let value = executor
            .fetch_scalar(
                &self.dialect.table_exists_sql(),
                &[DatabaseValue::String(self.table.clone())],
            )
            .await
            .map_err(MigrationError::schema_access("looking for the version table"))?;

        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Highest applied version, or [`NO_MIGRATIONS_APPLIED`] when the table is empty
    pub async fn current_version<E>(&self, executor: &mut E) -> MigrateResult<i64>
    where
        E: SqlExecutor + ?Sized,
    {
        let value = executor
            .fetch_scalar(&self.current_version_sql(), &[])
            .await
            .map_err(MigrationError::schema_access("reading the current version"))?;

        match value {
            None | Some(DatabaseValue::Null) => Ok(NO_MIGRATIONS_APPLIED),
            Some(value) => value.as_i64().ok_or_else(|| MigrationError::SchemaAccess {
                action: "reading the current version",
                source: DatabaseError::Query(format!(
                    "unexpected value {:?} in {}.version",
                    value, self.table
                )),
            }),
        }
    }

    /// Recorded versions in `(lower, upper]`, newest first
    pub async fn applied_between<E>(&self, executor: &mut E, lower: i64, upper: i64) -> MigrateResult<Vec<i64>>
    where
        E: SqlExecutor + ?Sized,
    {
        let sql = self.max_in_range_sql();
        let mut versions = Vec::new();
        let mut ceiling = upper;

        while ceiling > lower {
            let value = executor
                .fetch_scalar(
                    &sql,
                    &[DatabaseValue::Int64(lower), DatabaseValue::Int64(ceiling)],
                )
                .await
                .map_err(MigrationError::schema_access("listing applied versions"))?;

            match value.as_ref().and_then(DatabaseValue::as_i64) {
                Some(version) if version > lower && version <= ceiling => {
                    versions.push(version);
                    ceiling = version - 1;
                }
                _ => break,
            }
        }

        Ok(versions)
    }

    /// Insert the row for `version`
    pub async fn record_applied<E>(&self, executor: &mut E, version: i64) -> MigrateResult<()>
    where
        E: SqlExecutor + ?Sized,
    {
        let result = executor
            .execute(&self.insert_sql(), &[DatabaseValue::Int64(version)])
            .await;

        match result {
            Ok(_) => {
                debug!("Recorded migration {} in {}", version, self.table);
                Ok(())
            }
            Err(DatabaseError::UniqueViolation(_)) => Err(MigrationError::DuplicateVersion(version)),
            Err(source) => Err(MigrationError::SchemaAccess {
                action: "recording an applied version",
                source,
            }),
        }
    }

    /// Delete the row for `version`
    pub async fn remove_applied<E>(&self, executor: &mut E, version: i64) -> MigrateResult<()>
    where
        E: SqlExecutor + ?Sized,
    {
        let removed = executor
            .execute(&self.delete_sql(), &[DatabaseValue::Int64(version)])
            .await
            .map_err(MigrationError::schema_access("removing an applied version"))?;

        if removed == 0 {
            return Err(MigrationError::VersionNotRecorded(version));
        }

        debug!("Removed migration {} from {}", version, self.table);
        Ok(())
    }

    /// Whether `version` has its own row
    pub async fn is_applied<E>(&self, executor: &mut E, version: i64) -> MigrateResult<bool>
    where
        E: SqlExecutor + ?Sized,
    {
        let value = executor
            .fetch_scalar(&self.exists_sql(), &[DatabaseValue::Int64(version)])
            .await
            .map_err(MigrationError::schema_access("checking an applied version"))?;

        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// SQL to create the version table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (version {} NOT NULL PRIMARY KEY)",
            self.table,
            self.dialect.version_column_type()
        )
    }

    /// SQL to read the highest applied version
    pub fn current_version_sql(&self) -> String {
        format!("SELECT MAX(version) FROM {}", self.table)
    }

    /// SQL to read the highest version in `(lower, upper]`
    pub fn max_in_range_sql(&self) -> String {
        format!(
            "SELECT MAX(version) FROM {} WHERE version > {} AND version <= {}",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1)
        )
    }

    /// SQL to record a version as applied
    pub fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version) VALUES ({})",
            self.table,
            self.dialect.parameter_placeholder(0)
        )
    }

    /// SQL to remove a version record
    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE version = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        )
    }

    /// SQL to check whether a version is recorded
    pub fn exists_sql(&self) -> String {
        format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE version = {})",
            self.table,
            self.dialect.parameter_placeholder(0)
        )
    }
}
