//! Migration Runner - Executes migrations against the database
//!
//! The runner owns the pieces of the Up protocol: it loads the catalogue,
//! takes the fleet-wide lock, bootstraps the Version Store (including the
//! one-time legacy hand-over) and applies pending units in ascending order,
//! stopping at the first failure. The lock is given back on every exit path.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::definitions::{
    MigrationDirection, MigrationRunResult, MigrationState, MigrationStatus, MigrationUnit,
    RollbackResult, NO_MIGRATIONS_APPLIED,
};
use super::legacy::LegacyBridge;
use super::source::{load_catalogue, Catalogue, DirectorySource, MigrationSource};
use super::splitter::{split_statements, ExecutionMode};
use super::store::VersionStore;
use crate::backends::{DatabaseConnection, DatabasePool, PostgresAdvisoryLock, PostgresPool, SqlExecutor};
use crate::config::MigratorConfig;
use crate::error::{MigrateResult, MigrationError};
use crate::lock::{LockCoordinator, LockId};

/// Public surface consumed by deployment and bootstrap tooling
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Highest applied version. Takes no lock, so the answer may be stale
    /// while another process is migrating.
    async fn current_version(&self) -> MigrateResult<i64>;

    /// Highest version this build ships
    async fn supported_version(&self) -> MigrateResult<i64>;

    /// Apply every pending unit
    async fn up(&self) -> MigrateResult<MigrationRunResult>;

    /// Revert applied units newest first until `target` is the current version
    async fn down(&self, target: i64) -> MigrateResult<RollbackResult>;
}

/// Migration runner that executes migrations against a database
pub struct MigrationRunner {
    pool: Arc<dyn DatabasePool>,
    source: Arc<dyn MigrationSource>,
    locks: LockCoordinator,
    store: VersionStore,
    bridge: LegacyBridge,
    lock_id: LockId,
}

impl MigrationRunner {
    /// Create a runner with the default table names and lock id
    pub fn new(
        pool: Arc<dyn DatabasePool>,
        source: Arc<dyn MigrationSource>,
        locks: LockCoordinator,
    ) -> MigrateResult<Self> {
        Self::with_config(pool, source, locks, &MigratorConfig::default())
    }

    /// Create a runner using the table names, legacy constants and lock id
    /// from `config`
    pub fn with_config(
        pool: Arc<dyn DatabasePool>,
        source: Arc<dyn MigrationSource>,
        locks: LockCoordinator,
        config: &MigratorConfig,
    ) -> MigrateResult<Self> {
        config.validate()?;

        let dialect = pool.dialect();
        let store = VersionStore::new(config.version_table.clone(), dialect)?;
        let bridge = LegacyBridge::new(config.legacy_table.clone(), dialect)?
            .with_versions(config.legacy_cutover_version, config.new_era_start_version);

        Ok(Self {
            pool,
            source,
            locks,
            store,
            bridge,
            lock_id: config.lock_id(),
        })
    }

    /// Connect to PostgreSQL and read migrations from the configured
    /// directory, locking with a session-scoped advisory lock
    pub async fn connect(config: &MigratorConfig) -> MigrateResult<Self> {
        config.validate()?;
        let database_url = config.require_database_url()?;

        let pool = PostgresPool::connect(database_url, &config.pool)
            .await
            .map_err(MigrationError::schema_access("connecting to the database"))?;

        let locks = LockCoordinator::new(
            Arc::new(PostgresAdvisoryLock::new(pool.inner().clone())),
            config.lock_retry_interval(),
        );
        let source = Arc::new(DirectorySource::new(config.migrations_dir.clone()));

        Self::with_config(Arc::new(pool), source, locks, config)
    }

    /// Use a different lock id
    pub fn with_lock_id(mut self, lock_id: LockId) -> Self {
        self.lock_id = lock_id;
        self
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn bridge(&self) -> &LegacyBridge {
        &self.bridge
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    /// Every catalogue unit with its state in the database
    pub async fn status(&self) -> MigrateResult<Vec<MigrationStatus>> {
        let catalogue = load_catalogue(self.source.as_ref())?;
        let mut conn = self.open_session().await?;

        self.store.ensure_table(&mut *conn).await?;
        let current = self.store.current_version(&mut *conn).await?;

        let mut statuses = Vec::with_capacity(catalogue.len());
        for unit in catalogue.iter() {
            let state = if self.store.is_applied(&mut *conn, unit.version).await? {
                MigrationState::Applied
            } else if unit.version <= current {
                MigrationState::Satisfied
            } else {
                MigrationState::Pending
            };

            statuses.push(MigrationStatus {
                version: unit.version,
                name: unit.name.clone(),
                state,
                reversible: unit.is_reversible(),
            });
        }

        Ok(statuses)
    }

    /// Move the database to `target`, applying or reverting as needed.
    /// `target` must be [`NO_MIGRATIONS_APPLIED`] or a catalogue key.
    /// Returns the resulting current version.
    pub async fn migrate_to(&self, target: i64) -> MigrateResult<i64> {
        if target < NO_MIGRATIONS_APPLIED {
            return Err(MigrationError::InvalidTarget(target));
        }

        let catalogue = load_catalogue(self.source.as_ref())?;
        if target != NO_MIGRATIONS_APPLIED && !catalogue.contains(target) {
            return Err(MigrationError::UnknownVersion(target));
        }

        let current = self.read_current_version().await?;
        if target > current {
            self.run_up(Some(target)).await?;
        } else if target < current {
            self.run_down(target).await?;
        } else {
            debug!("Database already at version {}", target);
        }

        self.read_current_version().await
    }

    pub(crate) async fn read_current_version(&self) -> MigrateResult<i64> {
        let mut conn = self.open_session().await?;
        self.store.ensure_table(&mut *conn).await?;
        self.store.current_version(&mut *conn).await
    }

    pub(crate) fn load_catalogue(&self) -> MigrateResult<Catalogue> {
        load_catalogue(self.source.as_ref())
    }

    pub(crate) fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Up protocol, optionally stopping after `target`
    pub(crate) async fn run_up(&self, target: Option<i64>) -> MigrateResult<MigrationRunResult> {
        let start_time = Instant::now();
        let catalogue = self.load_catalogue()?;

        let guard = self.locks.acquire(self.lock_id).await?;
        let outcome = self.apply_pending(&catalogue, target).await;
        let released = guard.release().await;

        let mut result = finish(outcome, released)?;
        result.execution_time_ms = start_time.elapsed().as_millis();
        Ok(result)
    }

    async fn apply_pending(
        &self,
        catalogue: &Catalogue,
        target: Option<i64>,
    ) -> MigrateResult<MigrationRunResult> {
        let mut conn = self.open_session().await?;

        let floor = self.prepare_version_store(&mut *conn).await?;
        let current = self.store.current_version(&mut *conn).await?;
        let baseline = current.max(floor);

        let pending: Vec<&MigrationUnit> = catalogue
            .after(baseline)
            .filter(|unit| target.map_or(true, |target| unit.version <= target))
            .collect();
        let skipped_count = catalogue.len() - catalogue.after(baseline).count();

        if pending.is_empty() {
            info!("Database is up to date at version {}", baseline);
        } else {
            info!(
                "Applying {} migration(s) on top of version {}",
                pending.len(),
                baseline
            );
        }

        let mut applied_migrations = Vec::with_capacity(pending.len());
        for unit in pending {
            info!("Applying migration: {} - {}", unit.version, unit.name);

            self.execute_unit(&mut *conn, unit.version, &unit.up_sql, MigrationDirection::Up)
                .await
                .map_err(|source| MigrationError::MigrationFailed {
                    version: unit.version,
                    direction: MigrationDirection::Up,
                    source: Box::new(source),
                })?;

            applied_migrations.push(unit.version);
        }

        Ok(MigrationRunResult {
            applied_count: applied_migrations.len(),
            applied_migrations,
            skipped_count,
            execution_time_ms: 0,
        })
    }

    pub(crate) async fn open_session(&self) -> MigrateResult<Box<dyn DatabaseConnection>> {
        self.pool
            .acquire()
            .await
            .map_err(MigrationError::schema_access("opening a database session"))
    }

    /// Ensure the version table and run the legacy bridge in one transaction.
    /// Returns the floor below which units count as applied.
    ///
    /// A session that is not holding the migration lock may create the
    /// version table while the bootstrap transaction does the same; the
    /// transaction is then retried once against the existing table.
    pub(crate) async fn prepare_version_store(
        &self,
        conn: &mut dyn DatabaseConnection,
    ) -> MigrateResult<i64> {
        match self.bootstrap(conn).await {
            Err(MigrationError::SchemaAccess { action, source }) if source.is_concurrent_creation() => {
                debug!(
                    "Retrying bootstrap after concurrent creation of {} ({}: {})",
                    self.store.table(),
                    action,
                    source
                );
                self.bootstrap(conn).await
            }
            outcome => outcome,
        }
    }

    async fn bootstrap(&self, conn: &mut dyn DatabaseConnection) -> MigrateResult<i64> {
        let mut tx = conn
            .begin()
            .await
            .map_err(MigrationError::schema_access("starting the bootstrap transaction"))?;

        let outcome = async {
            self.store.ensure_table(&mut *tx).await?;
            self.bridge.reconcile(&mut *tx, &self.store).await
        }
        .await;

        match outcome {
            Ok(floor) => {
                tx.commit()
                    .await
                    .map_err(MigrationError::schema_access("committing the bootstrap transaction"))?;
                Ok(floor)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Failed to roll back bootstrap transaction: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Run one unit body in the given direction and update the Version Store
    pub(crate) async fn execute_unit(
        &self,
        conn: &mut dyn DatabaseConnection,
        version: i64,
        body: &str,
        direction: MigrationDirection,
    ) -> MigrateResult<()> {
        let batch = split_statements(body);

        match batch.mode {
            ExecutionMode::Transactional => {
                let mut tx = conn
                    .begin()
                    .await
                    .map_err(MigrationError::schema_access("starting a migration transaction"))?;

                let outcome = async {
                    run_statements(&mut *tx, version, &batch.statements).await?;
                    self.record(&mut *tx, version, direction).await
                }
                .await;

                match outcome {
                    Ok(()) => tx
                        .commit()
                        .await
                        .map_err(MigrationError::schema_access("committing a migration"))?,
                    Err(err) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(
                                "Failed to roll back migration {}: {}",
                                version, rollback_err
                            );
                        }
                        return Err(err);
                    }
                }
            }
            ExecutionMode::Autonomous => {
                warn!(
                    "Migration {} runs outside a transaction; a failed statement leaves it partially applied",
                    version
                );
                run_statements(&mut *conn, version, &batch.statements).await?;
                self.record(&mut *conn, version, direction).await?;
            }
        }

        Ok(())
    }

    async fn record<E>(&self, executor: &mut E, version: i64, direction: MigrationDirection) -> MigrateResult<()>
    where
        E: SqlExecutor + ?Sized,
    {
        match direction {
            MigrationDirection::Up => self.store.record_applied(executor, version).await,
            MigrationDirection::Down => self.store.remove_applied(executor, version).await,
        }
    }
}

#[async_trait]
impl Migrator for MigrationRunner {
    async fn current_version(&self) -> MigrateResult<i64> {
        self.read_current_version().await
    }

    async fn supported_version(&self) -> MigrateResult<i64> {
        Ok(self.load_catalogue()?.latest_version())
    }

    async fn up(&self) -> MigrateResult<MigrationRunResult> {
        self.run_up(None).await
    }

    async fn down(&self, target: i64) -> MigrateResult<RollbackResult> {
        self.run_down(target).await
    }
}

/// Execute statements in order, stopping at the first failure
async fn run_statements<E>(executor: &mut E, version: i64, statements: &[String]) -> MigrateResult<()>
where
    E: SqlExecutor + ?Sized,
{
    for (index, statement) in statements.iter().enumerate() {
        debug!("Migration {} statement {}: {}", version, index, statement);
        executor
            .execute(statement, &[])
            .await
            .map_err(|source| MigrationError::StatementExecution {
                version,
                statement: index,
                source,
            })?;
    }
    Ok(())
}

/// Combine a run's outcome with the result of releasing its lock. A release
/// failure is only reported when it is the sole failure.
pub(crate) fn finish<T>(outcome: MigrateResult<T>, released: MigrateResult<()>) -> MigrateResult<T> {
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!("Failed to release migration lock after error: {}", release_err);
            Err(err)
        }
    }
}
