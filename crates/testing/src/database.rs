//! SQLite-backed database for engine tests
//!
//! Each [`TestDatabase`] is a fresh SQLite file in its own temporary
//! directory, opened through [`SqliteConnectionPool`] and wrapped in an
//! [`InstrumentedPool`]. The engine sees a real database; tests get the
//! statement log and fault injection of [`Instrumentation`] plus helpers for
//! inspecting the schema directly through sqlx.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use strata_migrate::config::PoolSettings;
use strata_migrate::{
    DatabaseConnection, DatabaseError, DatabasePool, SqlDialect, SqliteConnectionPool,
};
use tempfile::TempDir;

use crate::instrument::{Instrumentation, InstrumentedPool, StatementGate};
use crate::TestResult;

/// File name of the database inside its temporary directory
const DATABASE_FILE: &str = "strata-test.db";

/// A throwaway SQLite database. Clones share the same file and log.
#[derive(Clone)]
pub struct TestDatabase {
    pool: SqliteConnectionPool,
    instrumented: InstrumentedPool,
    instrumentation: Instrumentation,
    _dir: Arc<TempDir>,
}

impl TestDatabase {
    /// Create an empty database file
    pub async fn new() -> TestResult<Self> {
        let dir = tempfile::tempdir()?;
        let settings = PoolSettings {
            max_connections: 8,
            min_connections: 0,
            acquire_timeout_seconds: 10,
        };
        let pool = SqliteConnectionPool::open(&dir.path().join(DATABASE_FILE), &settings).await?;

        let instrumentation = Instrumentation::new();
        let instrumented = instrumentation.wrap(Arc::new(pool.clone()));

        Ok(Self {
            pool,
            instrumented,
            instrumentation,
            _dir: Arc::new(dir),
        })
    }

    /// Get the underlying sqlx pool, bypassing instrumentation
    pub fn pool(&self) -> &SqlitePool {
        self.pool.inner()
    }

    /// Execute a raw SQL statement (for test setup)
    pub async fn execute(&self, sql: &str) -> TestResult<()> {
        sqlx::query(sql).execute(self.pool()).await?;
        Ok(())
    }

    /// Create the single-row version table of the old versioning scheme
    pub async fn seed_legacy_version(&self, table: &str, version: Option<i64>) -> TestResult<()> {
        self.execute(&format!("CREATE TABLE {} (version INTEGER)", table))
            .await?;
        if let Some(version) = version {
            sqlx::query(&format!("INSERT INTO {} (version) VALUES (?)", table))
                .bind(version)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn table_exists(&self, table: &str) -> TestResult<bool> {
        self.schema_object_exists("table", table).await
    }

    pub async fn index_exists(&self, index: &str) -> TestResult<bool> {
        self.schema_object_exists("index", index).await
    }

    /// User tables, sorted by name
    pub async fn table_names(&self) -> TestResult<Vec<String>> {
        let names = sqlx::query_scalar(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(names)
    }

    pub async fn has_column(&self, table: &str, column: &str) -> TestResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pragma_table_info(?) WHERE name = ?)",
        )
        .bind(table)
        .bind(column)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    pub async fn row_count(&self, table: &str) -> TestResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Integer values of `column`, sorted ascending
    pub async fn integer_column(&self, table: &str, column: &str) -> TestResult<Vec<i64>> {
        let values = sqlx::query_scalar(&format!(
            "SELECT {column} FROM {table} WHERE {column} IS NOT NULL ORDER BY {column}"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(values)
    }

    /// Every statement and query the engine issued, in order
    pub fn statement_log(&self) -> Vec<String> {
        self.instrumentation.statement_log()
    }

    /// Number of engine statements containing `fragment`
    pub fn executed_count(&self, fragment: &str) -> usize {
        self.instrumentation.executed_count(fragment)
    }

    pub fn clear_statement_log(&self) {
        self.instrumentation.clear_statement_log();
    }

    /// Make every engine statement containing `fragment` fail
    pub fn fail_statements_containing(&self, fragment: impl Into<String>) {
        self.instrumentation.fail_statements_containing(fragment);
    }

    /// Make the next engine statement containing `fragment` fail with `error`
    pub fn fail_next_statement_containing(&self, fragment: impl Into<String>, error: DatabaseError) {
        self.instrumentation
            .fail_next_statement_containing(fragment, error);
    }

    pub fn clear_failures(&self) {
        self.instrumentation.clear_failures();
    }

    /// Hold the engine session right after its next statement containing
    /// `fragment`
    pub fn pause_after(&self, fragment: impl Into<String>) -> StatementGate {
        self.instrumentation.pause_after(fragment)
    }

    /// Refuse new engine sessions, as if the server went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.instrumentation.set_unavailable(unavailable);
    }

    async fn schema_object_exists(&self, kind: &str, name: &str) -> TestResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = ? AND name = ?)",
        )
        .bind(kind)
        .bind(name)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl DatabasePool for TestDatabase {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError> {
        self.instrumented.acquire().await
    }

    fn dialect(&self) -> SqlDialect {
        self.instrumented.dialect()
    }
}
