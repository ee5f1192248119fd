//! Migrator configuration
//!
//! Configuration can be built in code, read from the environment, or loaded
//! from a YAML file. Every constructor that reads external input validates the
//! result before returning it.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockId;
use crate::migrations::legacy::{LEGACY_CUTOVER_VERSION, LEGACY_VERSION_TABLE, NEW_ERA_START_VERSION};
use crate::migrations::store::DEFAULT_VERSION_TABLE;
use crate::security::validate_identifier;

pub const ENV_DATABASE_URL: &str = "STRATA_DATABASE_URL";
pub const ENV_FALLBACK_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_MIGRATIONS_DIR: &str = "STRATA_MIGRATIONS_DIR";
pub const ENV_VERSION_TABLE: &str = "STRATA_VERSION_TABLE";
pub const ENV_LOCK_RETRY_MS: &str = "STRATA_LOCK_RETRY_MS";
pub const ENV_MAX_CONNECTIONS: &str = "STRATA_MAX_CONNECTIONS";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {field}")]
    Missing { field: String },

    #[error("invalid value '{value}' for {field}: expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Connection pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            // One session for the engine, one pinned by the advisory lock.
            max_connections: 4,
            min_connections: 1,
            acquire_timeout_seconds: 30,
        }
    }
}

/// Configuration for the migration engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// PostgreSQL connection URL, required by [`crate::MigrationRunner::connect`]
    pub database_url: Option<String>,
    /// Directory holding `<version>_<name>.up.sql` / `.down.sql` files
    pub migrations_dir: PathBuf,
    /// Table recording applied versions
    pub version_table: String,
    /// Single-row version table left behind by the previous versioning scheme
    pub legacy_table: String,
    /// The only legacy version the bridge accepts
    pub legacy_cutover_version: i64,
    /// First version of the timestamp-keyed era
    pub new_era_start_version: i64,
    /// Advisory lock serializing migrations
    pub lock_id: i64,
    /// Pause between lock acquisition attempts
    pub lock_retry_interval_ms: u64,
    pub pool: PoolSettings,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("migrations"),
            version_table: DEFAULT_VERSION_TABLE.to_string(),
            legacy_table: LEGACY_VERSION_TABLE.to_string(),
            legacy_cutover_version: LEGACY_CUTOVER_VERSION,
            new_era_start_version: NEW_ERA_START_VERSION,
            lock_id: LockId::DATABASE_MIGRATION.value(),
            lock_retry_interval_ms: 1000,
            pool: PoolSettings::default(),
        }
    }
}

impl MigratorConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = env::var(ENV_DATABASE_URL)
            .or_else(|_| env::var(ENV_FALLBACK_DATABASE_URL))
            .ok();

        if let Ok(dir) = env::var(ENV_MIGRATIONS_DIR) {
            config.migrations_dir = PathBuf::from(dir);
        }

        if let Ok(table) = env::var(ENV_VERSION_TABLE) {
            config.version_table = table;
        }

        if let Some(retry) = parse_env::<u64>(ENV_LOCK_RETRY_MS, "a number of milliseconds")? {
            config.lock_retry_interval_ms = retry;
        }

        if let Some(max) = parse_env::<u32>(ENV_MAX_CONNECTIONS, "a connection count")? {
            config.pool.max_connections = max;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("version_table", &self.version_table)?;
        validate_identifier("legacy_table", &self.legacy_table)?;

        if self.version_table.eq_ignore_ascii_case(&self.legacy_table) {
            return Err(ConfigError::InvalidValue {
                field: "legacy_table".to_string(),
                value: self.legacy_table.clone(),
                expected: "a table name different from version_table".to_string(),
            });
        }

        if self.legacy_cutover_version <= 0
            || self.legacy_cutover_version >= self.new_era_start_version
        {
            return Err(ConfigError::InvalidValue {
                field: "legacy_cutover_version".to_string(),
                value: self.legacy_cutover_version.to_string(),
                expected: format!(
                    "a positive version below new_era_start_version ({})",
                    self.new_era_start_version
                ),
            });
        }

        if self.lock_retry_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_retry_interval_ms".to_string(),
                value: "0".to_string(),
                expected: "a positive number of milliseconds".to_string(),
            });
        }

        if self.pool.max_connections < 2 {
            return Err(ConfigError::InvalidValue {
                field: "pool.max_connections".to_string(),
                value: self.pool.max_connections.to_string(),
                expected: "at least 2 (the lock pins its own session)".to_string(),
            });
        }

        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::InvalidValue {
                field: "pool.min_connections".to_string(),
                value: self.pool.min_connections.to_string(),
                expected: format!("at most max_connections ({})", self.pool.max_connections),
            });
        }

        if let Some(database_url) = &self.database_url {
            let parsed = url::Url::parse(database_url).map_err(|e| ConfigError::InvalidValue {
                field: "database_url".to_string(),
                value: redact(database_url),
                expected: format!("a valid URL ({})", e),
            })?;

            if !matches!(parsed.scheme(), "postgres" | "postgresql") {
                return Err(ConfigError::InvalidValue {
                    field: "database_url".to_string(),
                    value: redact(database_url),
                    expected: "a postgres:// or postgresql:// URL".to_string(),
                });
            }
        }

        Ok(())
    }

    /// The database URL, or an error if none was configured
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing {
                field: format!("database_url ({} or {})", ENV_DATABASE_URL, ENV_FALLBACK_DATABASE_URL),
            })
    }

    pub fn lock_id(&self) -> LockId {
        LockId::new(self.lock_id)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, expected: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw,
                expected: expected.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Strip credentials before a URL ends up in an error message
fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable url>".to_string(),
    }
}
