//! Ready-made catalogues and runner wiring

use std::sync::Arc;
use std::time::Duration;

use strata_migrate::{
    LockCoordinator, MigrateResult, MigrationRunner, MigrationUnit, MigratorConfig, StaticSource,
    NEW_ERA_START_VERSION,
};

use crate::database::TestDatabase;
use crate::lock::MemoryLockBackend;
use crate::TestResult;

/// Lock retry interval used by test runners
pub const TEST_LOCK_RETRY: Duration = Duration::from_millis(5);

/// Three units: create `foo`, index it outside a transaction, add column `bar`
pub fn scenario_units() -> Vec<MigrationUnit> {
    vec![
        MigrationUnit::new(
            1,
            "create_foo",
            "CREATE TABLE foo (id integer PRIMARY KEY, name text NOT NULL)",
        )
        .with_down("DROP TABLE foo"),
        MigrationUnit::new(
            2,
            "index_foo_name",
            "NO_TRANSACTION;\nCREATE INDEX foo_name_idx ON foo (name)",
        )
        .with_down("NO_TRANSACTION;\nDROP INDEX IF EXISTS foo_name_idx"),
        MigrationUnit::new(3, "add_foo_bar", "ALTER TABLE foo ADD COLUMN bar int")
            .with_down("ALTER TABLE foo DROP COLUMN bar"),
    ]
}

/// Units straddling the new-era floor: one at the floor itself, which a
/// bridged database already counts as applied, and two after it
pub fn new_era_units() -> Vec<MigrationUnit> {
    vec![
        MigrationUnit::new(
            NEW_ERA_START_VERSION,
            "baseline",
            "CREATE TABLE accounts (id integer PRIMARY KEY)",
        ),
        MigrationUnit::new(
            NEW_ERA_START_VERSION + 100,
            "create_sessions",
            "CREATE TABLE sessions (id integer PRIMARY KEY, account_id integer)",
        )
        .with_down("DROP TABLE sessions"),
        MigrationUnit::new(
            NEW_ERA_START_VERSION + 200,
            "index_sessions",
            "CREATE INDEX sessions_account_idx ON sessions (account_id)",
        )
        .with_down("DROP INDEX sessions_account_idx"),
    ]
}

/// A database and a lock backend shared by every runner built from it
#[derive(Clone)]
pub struct TestHarness {
    pub db: TestDatabase,
    pub locks: MemoryLockBackend,
}

impl TestHarness {
    /// Fresh database file and an unheld lock
    pub async fn new() -> TestResult<Self> {
        Ok(Self {
            db: TestDatabase::new().await?,
            locks: MemoryLockBackend::new(),
        })
    }

    /// Runner over `units` with default table names and a short lock retry
    pub fn runner(&self, units: Vec<MigrationUnit>) -> MigrateResult<MigrationRunner> {
        self.runner_with_config(units, &MigratorConfig::default())
    }

    pub fn runner_with_config(
        &self,
        units: Vec<MigrationUnit>,
        config: &MigratorConfig,
    ) -> MigrateResult<MigrationRunner> {
        let source = StaticSource::from_units(units)?;
        MigrationRunner::with_config(
            Arc::new(self.db.clone()),
            Arc::new(source),
            LockCoordinator::new(Arc::new(self.locks.clone()), TEST_LOCK_RETRY),
            config,
        )
    }

    pub fn scenario_runner(&self) -> MigrateResult<MigrationRunner> {
        self.runner(scenario_units())
    }
}
