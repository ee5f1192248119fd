//! Legacy Bridge - One-time hand-over from the single-row version table
//!
//! Databases created before granular tracking carry a one-row table holding a
//! small sequential version. Exactly one such version can be upgraded from:
//! the last one the old scheme shipped. The bridge checks for it, drops the old
//! table and seeds the Version Store with the first version of the
//! timestamp-keyed era.

use tracing::{info, warn};

use super::definitions::NO_MIGRATIONS_APPLIED;
use super::store::VersionStore;
use crate::backends::{DatabaseValue, SqlDialect, SqlExecutor};
use crate::error::{MigrateResult, MigrationError};
use crate::security::validate_identifier;

/// Name of the single-row version table used by the old scheme
pub const LEGACY_VERSION_TABLE: &str = "migration_version";

/// The only legacy version that can be upgraded from
pub const LEGACY_CUTOVER_VERSION: i64 = 189;

/// First version of the timestamp-keyed era
pub const NEW_ERA_START_VERSION: i64 = 1_510_262_030;

/// Which versioning scheme a database is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseGeneration {
    /// Fresh, or already tracked by the Version Store
    Tracked,
    /// Still carries the old single-row table; `version` is `None` when the
    /// table is empty
    Legacy { version: Option<i64> },
}

/// Detects and retires the legacy version table
#[derive(Debug, Clone)]
pub struct LegacyBridge {
    table: String,
    dialect: SqlDialect,
    cutover_version: i64,
    new_era_start_version: i64,
}

impl LegacyBridge {
    pub fn new(table: impl Into<String>, dialect: SqlDialect) -> MigrateResult<Self> {
        let table = table.into();
        validate_identifier("legacy_table", &table)?;
        Ok(Self {
            table,
            dialect,
            cutover_version: LEGACY_CUTOVER_VERSION,
            new_era_start_version: NEW_ERA_START_VERSION,
        })
    }

    /// Override the cutover and new-era constants
    pub fn with_versions(mut self, cutover_version: i64, new_era_start_version: i64) -> Self {
        self.cutover_version = cutover_version;
        self.new_era_start_version = new_era_start_version;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn cutover_version(&self) -> i64 {
        self.cutover_version
    }

    pub fn new_era_start_version(&self) -> i64 {
        self.new_era_start_version
    }

    /// Work out which scheme the database is on
    pub async fn detect<E>(&self, executor: &mut E) -> MigrateResult<DatabaseGeneration>
    where
        E: SqlExecutor + ?Sized,
    {
        let exists = executor
            .fetch_scalar(
                &self.dialect.table_exists_sql(),
                &[DatabaseValue::String(self.table.clone())],
            )
            .await
            .map_err(MigrationError::schema_access("looking for the legacy version table"))?
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        if !exists {
            return Ok(DatabaseGeneration::Tracked);
        }

        let version = executor
            .fetch_scalar(&format!("SELECT version FROM {}", self.table), &[])
            .await
            .map_err(MigrationError::schema_access("reading the legacy version"))?
            .and_then(|value| value.as_i64());

        Ok(DatabaseGeneration::Legacy { version })
    }

    /// Resolve the database into a floor version.
    ///
    /// A tracked database has floor [`NO_MIGRATIONS_APPLIED`]. A legacy
    /// database at the cutover version loses its old table, gains a Version
    /// Store row for the new-era start version, and gets that version as its
    /// floor. Any other legacy state is refused without touching anything.
    pub async fn reconcile<E>(&self, executor: &mut E, store: &VersionStore) -> MigrateResult<i64>
    where
        E: SqlExecutor + ?Sized,
    {
        match self.detect(executor).await? {
            DatabaseGeneration::Tracked => Ok(NO_MIGRATIONS_APPLIED),
            DatabaseGeneration::Legacy { version: Some(version) }
                if version == self.cutover_version =>
            {
                info!(
                    "Upgrading legacy database at version {} to the timestamped scheme starting at {}",
                    version, self.new_era_start_version
                );

                executor
                    .execute(&format!("DROP TABLE IF EXISTS {}", self.table), &[])
                    .await
                    .map_err(MigrationError::schema_access("dropping the legacy version table"))?;

                if !store.is_applied(executor, self.new_era_start_version).await? {
                    store
                        .record_applied(executor, self.new_era_start_version)
                        .await?;
                }

                Ok(self.new_era_start_version)
            }
            DatabaseGeneration::Legacy { version } => {
                warn!(
                    "Refusing to migrate: legacy version table {} holds {:?}, expected {}",
                    self.table, version, self.cutover_version
                );
                Err(MigrationError::UnsupportedLegacyVersion {
                    expected: self.cutover_version,
                    found: version,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use async_trait::async_trait;

    /// Minimal executor modelling just the legacy table
    struct LegacyOnly {
        legacy: Option<Option<i64>>,
        recorded: Vec<i64>,
        statements: Vec<String>,
    }

    impl LegacyOnly {
        fn new(legacy: Option<Option<i64>>) -> Self {
            Self {
                legacy,
                recorded: Vec::new(),
                statements: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl SqlExecutor for LegacyOnly {
        async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError> {
            self.statements.push(sql.to_string());
            if sql.starts_with("DROP TABLE") {
                self.legacy = None;
            } else if sql.starts_with("INSERT") {
                self.recorded.extend(params.iter().filter_map(|p| p.as_i64()));
            }
            Ok(1)
        }

        async fn fetch_scalar(
            &mut self,
            sql: &str,
            params: &[DatabaseValue],
        ) -> Result<Option<DatabaseValue>, DatabaseError> {
            if sql.contains("information_schema") {
                return Ok(Some(DatabaseValue::Bool(self.legacy.is_some())));
            }
            if sql.starts_with("SELECT version FROM") {
                return Ok(self.legacy.flatten().map(DatabaseValue::Int64));
            }
            if sql.starts_with("SELECT EXISTS (SELECT 1 FROM schema_migrations") {
                let wanted = params.first().and_then(|p| p.as_i64());
                return Ok(Some(DatabaseValue::Bool(
                    wanted.map_or(false, |w| self.recorded.contains(&w)),
                )));
            }
            Ok(None)
        }
    }

    fn bridge() -> (LegacyBridge, VersionStore) {
        (
            LegacyBridge::new(LEGACY_VERSION_TABLE, SqlDialect::PostgreSQL).unwrap(),
            VersionStore::new("schema_migrations", SqlDialect::PostgreSQL).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_tracked_database_needs_no_bridge() {
        let (bridge, store) = bridge();
        let mut executor = LegacyOnly::new(None);

        assert_eq!(bridge.detect(&mut executor).await.unwrap(), DatabaseGeneration::Tracked);
        assert_eq!(
            bridge.reconcile(&mut executor, &store).await.unwrap(),
            NO_MIGRATIONS_APPLIED
        );
        assert!(executor.statements.is_empty());
    }

    #[tokio::test]
    async fn test_cutover_version_is_bridged() {
        let (bridge, store) = bridge();
        let mut executor = LegacyOnly::new(Some(Some(189)));

        assert_eq!(
            bridge.detect(&mut executor).await.unwrap(),
            DatabaseGeneration::Legacy { version: Some(189) }
        );

        let floor = bridge.reconcile(&mut executor, &store).await.unwrap();
        assert_eq!(floor, NEW_ERA_START_VERSION);
        assert_eq!(executor.legacy, None);
        assert_eq!(executor.recorded, vec![NEW_ERA_START_VERSION]);
        assert_eq!(executor.statements[0], "DROP TABLE IF EXISTS migration_version");
    }

    #[tokio::test]
    async fn test_other_legacy_versions_are_refused() {
        let (bridge, store) = bridge();

        for legacy in [Some(150), Some(190), None] {
            let mut executor = LegacyOnly::new(Some(legacy));
            let err = bridge.reconcile(&mut executor, &store).await.unwrap_err();

            assert!(matches!(
                err,
                MigrationError::UnsupportedLegacyVersion { expected: 189, found } if found == legacy
            ));
            assert!(executor.statements.is_empty());
            assert!(executor.legacy.is_some());
        }
    }
}
