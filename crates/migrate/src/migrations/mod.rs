//! Migration System
//!
//! Catalogue sources, statement splitting, version bookkeeping, the legacy
//! bridge and the runner that drives Up and Down.

pub mod definitions;
pub mod legacy;
mod rollback;
pub mod runner;
pub mod source;
pub mod splitter;
pub mod store;

pub use definitions::{
    MigrationDirection, MigrationRunResult, MigrationState, MigrationStatus, MigrationUnit,
    RollbackResult, NO_MIGRATIONS_APPLIED,
};
pub use legacy::{
    DatabaseGeneration, LegacyBridge, LEGACY_CUTOVER_VERSION, LEGACY_VERSION_TABLE,
    NEW_ERA_START_VERSION,
};
pub use runner::{MigrationRunner, Migrator};
pub use source::{load_catalogue, Catalogue, DirectorySource, MigrationSource, StaticSource};
pub use splitter::{
    split_statements, ExecutionMode, StatementBatch, NO_TRANSACTION_SENTINEL, STATEMENT_DELIMITER,
};
pub use store::{VersionStore, DEFAULT_VERSION_TABLE};
