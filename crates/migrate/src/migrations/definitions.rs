//! Migration Definitions - Core types shared by the engine
//!
//! Defines the migration unit, the direction it is executed in, and the
//! summaries returned by the public operations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current version reported by an empty Version Store
pub const NO_MIGRATIONS_APPLIED: i64 = 0;

/// One versioned, ordered package of schema-change statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationUnit {
    /// Catalogue key; units are applied in ascending order
    pub version: i64,
    /// Human-readable name for logs and status output
    pub name: String,
    /// Statements applying the unit
    pub up_sql: String,
    /// Statements reverting the unit, when it can be reverted
    pub down_sql: Option<String>,
}

impl MigrationUnit {
    pub fn new(version: i64, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: None,
        }
    }

    /// Attach down statements
    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        self.down_sql = Some(down_sql.into());
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }

    /// The body executed for the given direction
    pub fn body(&self, direction: MigrationDirection) -> Option<&str> {
        match direction {
            MigrationDirection::Up => Some(&self.up_sql),
            MigrationDirection::Down => self.down_sql.as_deref(),
        }
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDirection {
    /// Apply the migration (run UP statements)
    Up,
    /// Revert the migration (run DOWN statements)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Result of running migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationRunResult {
    /// Number of migrations that were applied
    pub applied_count: usize,
    /// Versions that were applied, in order
    pub applied_migrations: Vec<i64>,
    /// Number of catalogue units already applied or satisfied
    pub skipped_count: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

/// Result of rolling back migrations
#[derive(Debug, Clone, Default)]
pub struct RollbackResult {
    /// Number of migrations that were rolled back
    pub rolled_back_count: usize,
    /// Versions that were rolled back, newest first
    pub rolled_back_migrations: Vec<i64>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

/// Where a catalogue unit stands relative to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    /// Recorded in the Version Store
    Applied,
    /// At or below the current version without its own row, i.e. it predates
    /// granular tracking
    Satisfied,
    /// Not yet applied
    Pending,
}

/// Status line for a single catalogue unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub state: MigrationState,
    pub reversible: bool,
}
