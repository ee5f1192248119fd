//! SQLite Backend Implementation
//!
//! Implements the backend traits on sqlx's SQLite driver. SQLite has no
//! advisory locks, so a runner on this pool needs a [`crate::LockBackend`]
//! of its own; every process migrating the same file must share it.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Connection, Row, Sqlite, TypeInfo, ValueRef};
use tracing::debug;

use super::core::*;
use crate::config::PoolSettings;
use crate::error::DatabaseError;

/// SQLite connection pool implementation
#[derive(Clone)]
pub struct SqliteConnectionPool {
    pool: SqlitePool,
}

impl SqliteConnectionPool {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path` in WAL mode, so
    /// version reads are not blocked by a migration in progress
    pub async fn open(path: &Path, settings: &PoolSettings) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(settings.acquire_timeout_seconds));

        Self::connect_with(options, settings).await
    }

    /// Open a pool with explicit connect options
    pub async fn connect_with(
        options: SqliteConnectOptions,
        settings: &PoolSettings,
    ) -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_seconds))
            .connect_with(options)
            .await?;

        debug!(
            "Opened SQLite pool (max {} connections)",
            settings.max_connections
        );
        Ok(Self::new(pool))
    }

    /// Get the underlying sqlx pool
    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for SqliteConnectionPool {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::Connection(format!("failed to acquire connection: {}", e)))?;

        Ok(Box::new(SqliteConnection::new(conn)))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }
}

/// SQLite connection implementation
pub struct SqliteConnection {
    conn: PoolConnection<Sqlite>,
}

impl SqliteConnection {
    pub fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SqlExecutor for SqliteConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError> {
        execute_on(&mut self.conn, sql, params).await
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Option<DatabaseValue>, DatabaseError> {
        fetch_scalar_on(&mut self.conn, sql, params).await
    }
}

#[async_trait]
impl DatabaseConnection for SqliteConnection {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn DatabaseTransaction + 'a>, DatabaseError> {
        let tx = Connection::begin(&mut *self.conn).await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

/// SQLite transaction borrowed from a [`SqliteConnection`]
pub struct SqliteTransaction<'a> {
    tx: sqlx::Transaction<'a, Sqlite>,
}

#[async_trait]
impl<'a> SqlExecutor for SqliteTransaction<'a> {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError> {
        execute_on(&mut self.tx, sql, params).await
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Option<DatabaseValue>, DatabaseError> {
        fetch_scalar_on(&mut self.tx, sql, params).await
    }
}

#[async_trait]
impl<'a> DatabaseTransaction for SqliteTransaction<'a> {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let SqliteTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let SqliteTransaction { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

async fn execute_on(
    conn: &mut sqlx::SqliteConnection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<u64, DatabaseError> {
    let result = if params.is_empty() {
        sqlx::Executor::execute(&mut *conn, sql).await?
    } else {
        build_query(sql, params).execute(&mut *conn).await?
    };
    Ok(result.rows_affected())
}

async fn fetch_scalar_on(
    conn: &mut sqlx::SqliteConnection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<Option<DatabaseValue>, DatabaseError> {
    let row = build_query(sql, params).fetch_optional(&mut *conn).await?;
    row.as_ref().map(scalar_from_row).transpose()
}

fn build_query<'q>(sql: &'q str, params: &[DatabaseValue]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(sqlx::query(sql), bind_database_value)
}

fn bind_database_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &DatabaseValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        DatabaseValue::Null => query.bind(Option::<i64>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
    }
}

/// Convert the first column of a row to a DatabaseValue.
///
/// Expressions such as `MAX(version)` or `EXISTS (...)` have no declared
/// type in SQLite, so the storage class of the value itself decides.
fn scalar_from_row(row: &SqliteRow) -> Result<DatabaseValue, DatabaseError> {
    if row.columns().is_empty() {
        return Ok(DatabaseValue::Null);
    }

    let raw = row.try_get_raw(0)?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let value = match raw.type_info().name() {
        "INTEGER" | "BIGINT" | "INT8" | "BOOLEAN" => DatabaseValue::Int64(row.try_get(0)?),
        "REAL" | "NUMERIC" => DatabaseValue::String(row.try_get::<f64, _>(0)?.to_string()),
        _ => DatabaseValue::String(row.try_get(0)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqliteConnectionPool::open(&dir.path().join("backend.db"), &PoolSettings::default())
            .await
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_scalars_from_expressions() {
        let (_dir, pool) = open_temp().await;
        let mut conn = pool.acquire().await.unwrap();

        conn.execute("CREATE TABLE versions (version INTEGER NOT NULL PRIMARY KEY)", &[])
            .await
            .unwrap();
        assert_eq!(
            conn.fetch_scalar("SELECT MAX(version) FROM versions", &[]).await.unwrap(),
            Some(DatabaseValue::Null)
        );

        conn.execute(
            "INSERT INTO versions (version) VALUES (?)",
            &[DatabaseValue::Int64(1_510_262_030)],
        )
        .await
        .unwrap();

        assert_eq!(
            conn.fetch_scalar("SELECT MAX(version) FROM versions", &[])
                .await
                .unwrap()
                .and_then(|v| v.as_i64()),
            Some(1_510_262_030)
        );

        let exists = conn
            .fetch_scalar(
                &SqlDialect::SQLite.table_exists_sql(),
                &[DatabaseValue::from("versions")],
            )
            .await
            .unwrap();
        assert_eq!(exists.and_then(|v| v.as_bool()), Some(true));

        assert_eq!(
            conn.fetch_scalar("SELECT 'text'", &[]).await.unwrap(),
            Some(DatabaseValue::String("text".to_string()))
        );
    }

    #[tokio::test]
    async fn test_duplicate_primary_key_is_unique_violation() {
        let (_dir, pool) = open_temp().await;
        let mut conn = pool.acquire().await.unwrap();

        conn.execute("CREATE TABLE versions (version INTEGER NOT NULL PRIMARY KEY)", &[])
            .await
            .unwrap();
        conn.execute("INSERT INTO versions (version) VALUES (?)", &[DatabaseValue::Int64(1)])
            .await
            .unwrap();

        let err = conn
            .execute("INSERT INTO versions (version) VALUES (?)", &[DatabaseValue::Int64(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_rollback_discards_ddl() {
        let (_dir, pool) = open_temp().await;
        let mut conn = pool.acquire().await.unwrap();

        {
            let mut tx = conn.begin().await.unwrap();
            tx.execute("CREATE TABLE scratch (id INTEGER)", &[]).await.unwrap();
            tx.rollback().await.unwrap();
        }

        let exists = conn
            .fetch_scalar(
                &SqlDialect::SQLite.table_exists_sql(),
                &[DatabaseValue::from("scratch")],
            )
            .await
            .unwrap();
        assert_eq!(exists.and_then(|v| v.as_bool()), Some(false));
        assert_eq!(pool.dialect(), SqlDialect::SQLite);
    }
}
