//! PostgreSQL Backend Implementation
//!
//! Implements the backend traits on top of sqlx, plus a session-scoped
//! advisory lock for fleet-wide migration exclusion.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Postgres, Row, TypeInfo, ValueRef};
use tracing::{debug, warn};

use super::core::*;
use crate::config::PoolSettings;
use crate::error::{DatabaseError, MigrateResult, MigrationError};
use crate::lock::{LockBackend, LockHandle, LockId};

/// PostgreSQL connection pool implementation
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for the given database URL
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_seconds))
            .connect(database_url)
            .await?;

        debug!(
            "Connected PostgreSQL pool (max {} connections)",
            settings.max_connections
        );
        Ok(Self::new(pool))
    }

    /// Get the underlying sqlx pool
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::Connection(format!("failed to acquire connection: {}", e)))?;

        Ok(Box::new(PostgresConnection::new(conn)))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    conn: PoolConnection<Postgres>,
}

impl PostgresConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SqlExecutor for PostgresConnection {
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
impl DatabaseConnection for PostgresConnection {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn DatabaseTransaction + 'a>, DatabaseError> {
        let tx = Connection::begin(&mut *self.conn).await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

/// PostgreSQL transaction borrowed from a [`PostgresConnection`]
pub struct PostgresTransaction<'a> {
    tx: sqlx::Transaction<'a, Postgres>,
}

#[async_trait]
impl<'a> SqlExecutor for PostgresTransaction<'a> {
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
impl<'a> DatabaseTransaction for PostgresTransaction<'a> {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let PostgresTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let PostgresTransaction { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

/// Session-scoped `pg_try_advisory_lock` backend.
///
/// Each held lock pins one pooled session; if that session dies the server
/// releases the lock on its own.
#[derive(Clone)]
pub struct PostgresAdvisoryLock {
    pool: PgPool,
}

impl PostgresAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for PostgresAdvisoryLock {
    async fn try_acquire(&self, id: LockId) -> MigrateResult<Option<Box<dyn LockHandle>>> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            MigrationError::LockBackend(format!("failed to open lock session: {}", e))
        })?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(id.value())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| MigrationError::LockBackend(format!("failed to request lock {}: {}", id, e)))?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(PostgresLockHandle { id, conn })))
    }
}

struct PostgresLockHandle {
    id: LockId,
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl LockHandle for PostgresLockHandle {
    fn id(&self) -> LockId {
        self.id
    }

    async fn release(self: Box<Self>) -> MigrateResult<()> {
        let PostgresLockHandle { id, mut conn } = *self;

        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(id.value())
            .fetch_one(&mut *conn)
            .await;

        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("Lock {} was not held by its session at release time", id);
                Ok(())
            }
            Err(e) => {
                // Closing the session is the only other way to drop the lock.
                drop(conn.detach());
                Err(MigrationError::LockBackend(format!(
                    "failed to release lock {}: {}",
                    id, e
                )))
            }
        }
    }

    fn abandon(self: Box<Self>) {
        let PostgresLockHandle { id, conn } = *self;
        debug!("Closing session holding lock {}", id);
        drop(conn.detach());
    }
}

async fn execute_on(
    conn: &mut PgConnection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<u64, DatabaseError> {
    // Parameterless statements go through the simple query protocol, the same
    // path psql uses for migration scripts.
    let result = if params.is_empty() {
        sqlx::Executor::execute(&mut *conn, sql).await?
    } else {
        build_query(sql, params).execute(&mut *conn).await?
    };
    Ok(result.rows_affected())
}

async fn fetch_scalar_on(
    conn: &mut PgConnection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<Option<DatabaseValue>, DatabaseError> {
    let row = build_query(sql, params).fetch_optional(&mut *conn).await?;
    row.as_ref().map(scalar_from_row).transpose()
}

fn build_query<'q>(sql: &'q str, params: &[DatabaseValue]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), bind_database_value)
}

fn bind_database_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<i64>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
    }
}

/// Convert the first column of a row to a DatabaseValue
fn scalar_from_row(row: &PgRow) -> Result<DatabaseValue, DatabaseError> {
    if row.columns().is_empty() {
        return Ok(DatabaseValue::Null);
    }

    if row.try_get_raw(0)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let value = match row.column(0).type_info().name() {
        "BOOL" => DatabaseValue::Bool(row.try_get(0)?),
        "INT2" => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(0)?)),
        "INT4" => DatabaseValue::Int32(row.try_get(0)?),
        "INT8" => DatabaseValue::Int64(row.try_get(0)?),
        _ => DatabaseValue::String(row.try_get(0)?),
    };
    Ok(value)
}
