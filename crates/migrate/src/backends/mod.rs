//! Database Backend Abstractions
//!
//! The engine only needs a narrow slice of SQL access: run a statement, read a
//! single scalar, and open/commit/roll back a transaction. These traits capture
//! that slice so the engine can drive PostgreSQL, with its advisory lock for
//! fleets, or an SQLite file for single-host deployments and tests.

pub mod core;
pub mod postgres;
pub mod sqlite;

pub use self::core::*;
pub use self::postgres::{PostgresAdvisoryLock, PostgresPool};
pub use self::sqlite::SqliteConnectionPool;
