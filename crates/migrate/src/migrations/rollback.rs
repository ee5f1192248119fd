//! Migration Rollback - Reverts applied units newest first
//!
//! Down follows the same rules as Up: it holds the migration lock, bootstraps
//! the Version Store, and runs each unit's down statements transactionally
//! unless they start with the no-transaction marker. The first failure stops
//! the walk; units reverted before it stay reverted.

use std::time::Instant;

use tracing::info;

use super::definitions::{MigrationDirection, RollbackResult, NO_MIGRATIONS_APPLIED};
use super::runner::{finish, MigrationRunner};
use super::source::Catalogue;
use crate::error::{MigrateResult, MigrationError};

impl MigrationRunner {
    /// Revert applied units until the current version is at most `target`
    pub(crate) async fn run_down(&self, target: i64) -> MigrateResult<RollbackResult> {
        let start_time = Instant::now();

        if target < NO_MIGRATIONS_APPLIED {
            return Err(MigrationError::InvalidTarget(target));
        }

        let catalogue = self.load_catalogue()?;

        let guard = self.locks().acquire(self.lock_id()).await?;
        let outcome = self.revert_to(&catalogue, target).await;
        let released = guard.release().await;

        let mut result = finish(outcome, released)?;
        result.execution_time_ms = start_time.elapsed().as_millis();
        Ok(result)
    }

    async fn revert_to(&self, catalogue: &Catalogue, target: i64) -> MigrateResult<RollbackResult> {
        let mut conn = self.open_session().await?;

        self.prepare_version_store(&mut *conn).await?;
        let current = self.store().current_version(&mut *conn).await?;

        if current <= target {
            info!("Database at version {} is already at or below {}", current, target);
            return Ok(RollbackResult::default());
        }

        // Every recorded version above the target must be revertible before
        // the first one is touched.
        let applied = self
            .store()
            .applied_between(&mut *conn, target, current)
            .await?;

        let mut plan = Vec::with_capacity(applied.len());
        for version in applied {
            let unit = catalogue
                .get(version)
                .ok_or(MigrationError::UnknownVersion(version))?;
            let body = unit
                .body(MigrationDirection::Down)
                .ok_or(MigrationError::IrreversibleMigration(version))?;
            plan.push((unit, body));
        }

        let mut rolled_back_migrations = Vec::with_capacity(plan.len());
        for (unit, body) in plan {
            info!("Rolling back migration: {} - {}", unit.version, unit.name);

            self.execute_unit(&mut *conn, unit.version, body, MigrationDirection::Down)
                .await
                .map_err(|source| MigrationError::MigrationFailed {
                    version: unit.version,
                    direction: MigrationDirection::Down,
                    source: Box::new(source),
                })?;

            rolled_back_migrations.push(unit.version);
        }

        Ok(RollbackResult {
            rolled_back_count: rolled_back_migrations.len(),
            rolled_back_migrations,
            execution_time_ms: 0,
        })
    }
}
