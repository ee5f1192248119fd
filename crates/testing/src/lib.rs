//! # strata-testing - Test support for strata migrations
//!
//! Databases, locks and fixtures for exercising the migration engine:
//!
//! - **TestDatabase**: a throwaway SQLite file driven through sqlx, with the
//!   engine's statements logged and open to fault injection
//! - **Instrumentation**: the statement log, failure plan and pause gates,
//!   usable around any `DatabasePool`
//! - **MemoryLockBackend**: an in-process lock with the semantics of a
//!   database advisory lock
//! - **TestHarness**: runners wired to a shared database and lock
//! - **postgres**: helpers for tests that run against a real server
//!
//! ## Quick Start
//!
//! ```rust
//! use strata_testing::prelude::*;
//!
//! # async fn example() -> strata_testing::TestResult<()> {
//! let harness = TestHarness::new().await?;
//! let runner = harness.scenario_runner()?;
//! runner.up().await?;
//! assert!(harness.db.has_column("foo", "bar").await?);
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod fixtures;
pub mod instrument;
pub mod lock;
pub mod postgres;

pub use database::TestDatabase;
pub use fixtures::{new_era_units, scenario_units, TestHarness, TEST_LOCK_RETRY};
pub use instrument::{Instrumentation, InstrumentedPool, StatementGate};
pub use lock::MemoryLockBackend;
pub use postgres::PostgresTestDatabase;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        database::TestDatabase,
        fixtures::{new_era_units, scenario_units, TestHarness},
        lock::MemoryLockBackend,
        utils,
    };

    pub use strata_migrate::{
        DatabaseError, DatabaseValue, LockId, MigrationError, MigrationRunner, MigrationUnit,
        Migrator, NO_MIGRATIONS_APPLIED,
    };
}

#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] strata_migrate::DatabaseError),

    #[error("Migration error: {0}")]
    Migration(#[from] strata_migrate::MigrationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TestResult<T> = Result<T, TestError>;

/// Test utilities and helper functions
pub mod utils {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static TRACING: Once = Once::new();

    /// Route engine logs to the test writer, filtered by `RUST_LOG`
    pub fn init_test_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    /// Generate a random lowercase identifier with optional prefix
    pub fn random_identifier(prefix: Option<&str>) -> String {
        use rand::Rng;
        let suffix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();

        match prefix {
            Some(p) => format!("{}_{}", p, suffix),
            None => format!("t_{}", suffix),
        }
    }

    /// Random positive lock id, so parallel test runs do not contend
    pub fn random_lock_id() -> strata_migrate::LockId {
        use rand::Rng;
        strata_migrate::LockId::new(rand::thread_rng().gen_range(1_000_000..i64::from(i32::MAX)))
    }
}
