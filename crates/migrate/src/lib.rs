//! # strata-migrate: schema migrations for fleets of services
//!
//! Advances a database schema to the newest version shipped with the running
//! binary. Any number of service instances may call [`Migrator::up`] at the same
//! time during a rolling deploy: a database-visible lock serializes them, and
//! whoever acquires it second simply finds nothing left to apply.
//!
//! The crate is organised around a small set of seams:
//!
//! - [`MigrationSource`] supplies the ordered catalogue of migration units.
//! - [`LockBackend`] provides the cluster-wide mutual exclusion.
//! - [`DatabasePool`] abstracts the SQL connection the engine drives.
//! - [`MigrationRunner`] ties them together and implements [`Migrator`].
//!
//! ```rust,no_run
//! use strata_migrate::{MigrationRunner, Migrator, MigratorConfig};
//!
//! # async fn example() -> strata_migrate::MigrateResult<()> {
//! let config = MigratorConfig::from_env()?;
//! let runner = MigrationRunner::connect(&config).await?;
//! let result = runner.up().await?;
//! println!("applied {} migrations", result.applied_count);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod lock;
pub mod migrations;
pub mod security;

pub use backends::{
    DatabaseConnection, DatabasePool, DatabaseTransaction, DatabaseValue, PostgresAdvisoryLock,
    PostgresPool, SqlDialect, SqlExecutor, SqliteConnectionPool,
};
pub use config::{ConfigError, MigratorConfig};
pub use error::{DatabaseError, MigrateResult, MigrationError};
pub use lock::{LockBackend, LockCoordinator, LockGuard, LockHandle, LockId};
pub use migrations::*;
