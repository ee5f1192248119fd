//! Helpers for tests against a real PostgreSQL server
//!
//! Tests using these are expected to be `#[ignore]`d and run explicitly with
//! `TEST_DATABASE_URL` set. Each test should use its own table names (see
//! [`crate::utils::random_identifier`]) so runs do not interfere.

use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};
use strata_migrate::{
    DatabasePool, LockCoordinator, MigrationRunner, MigrationUnit, MigratorConfig,
    PostgresAdvisoryLock, PostgresPool, StaticSource,
};

use crate::fixtures::TEST_LOCK_RETRY;
use crate::{TestError, TestResult};

/// Environment variable naming the test server
pub const TEST_DATABASE_URL: &str = "TEST_DATABASE_URL";

/// Connection to the server named by `TEST_DATABASE_URL`
#[derive(Clone)]
pub struct PostgresTestDatabase {
    pool: PgPool,
}

impl PostgresTestDatabase {
    /// Connect if `TEST_DATABASE_URL` is set, `Ok(None)` otherwise
    pub async fn from_env() -> TestResult<Option<Self>> {
        let Ok(database_url) = std::env::var(TEST_DATABASE_URL) else {
            return Ok(None);
        };

        // The engine needs a session of its own next to the one pinned by
        // the advisory lock.
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Ok(Some(Self { pool }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a raw SQL statement (for test setup)
    pub async fn execute(&self, sql: &str) -> TestResult<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn table_exists(&self, table: &str) -> TestResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn drop_tables(&self, tables: &[&str]) -> TestResult<()> {
        for table in tables {
            self.execute(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
                .await?;
        }
        Ok(())
    }

    /// Runner over `units` using the advisory lock and the tables in `config`
    pub fn runner(&self, units: Vec<MigrationUnit>, config: &MigratorConfig) -> TestResult<MigrationRunner> {
        self.runner_on(Arc::new(PostgresPool::new(self.pool.clone())), units, config)
    }

    /// Like [`Self::runner`], but issuing statements through `pool`, e.g. an
    /// [`crate::InstrumentedPool`] wrapped around [`Self::pool`]
    pub fn runner_on(
        &self,
        pool: Arc<dyn DatabasePool>,
        units: Vec<MigrationUnit>,
        config: &MigratorConfig,
    ) -> TestResult<MigrationRunner> {
        let source = StaticSource::from_units(units)?;
        let locks = LockCoordinator::new(
            Arc::new(PostgresAdvisoryLock::new(self.pool.clone())),
            TEST_LOCK_RETRY,
        );

        MigrationRunner::with_config(
            pool,
            Arc::new(source),
            locks,
            config,
        )
        .map_err(TestError::from)
    }
}
