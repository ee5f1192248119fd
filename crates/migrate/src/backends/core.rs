//! Core Database Backend Traits
//!
//! Connections and transactions share [`SqlExecutor`], so bookkeeping code can
//! be written once and run either directly on a session or inside a
//! transaction.

use async_trait::async_trait;

use crate::error::DatabaseError;

/// Something statements can be executed against
#[async_trait]
pub trait SqlExecutor: Send {
    /// Execute a statement and return the affected row count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError>;

    /// Execute a query and return the first column of the first row, if any
    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Option<DatabaseValue>, DatabaseError>;
}

/// A live session checked out of a pool
#[async_trait]
pub trait DatabaseConnection: SqlExecutor {
    /// Begin a transaction on this session
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn DatabaseTransaction + 'a>, DatabaseError>;
}

/// An open transaction borrowed from a connection
#[async_trait]
pub trait DatabaseTransaction: SqlExecutor {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Source of database sessions
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Acquire a session from the pool
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError>;

    /// The SQL dialect spoken by this pool
    fn dialect(&self) -> SqlDialect;
}

/// Parameter and scalar result values
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Interpret the value as an integer, widening and parsing where sensible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            DatabaseValue::Null | DatabaseValue::Bool(_) => None,
        }
    }

    /// Interpret the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(b) => Some(*b),
            DatabaseValue::Int32(i) => Some(*i != 0),
            DatabaseValue::Int64(i) => Some(*i != 0),
            DatabaseValue::String(s) => match s.as_str() {
                "t" | "true" | "1" => Some(true),
                "f" | "false" | "0" => Some(false),
                _ => None,
            },
            DatabaseValue::Null => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder style for this dialect
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Column type used for migration versions
    pub fn version_column_type(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "BIGINT",
            SqlDialect::SQLite => "INTEGER",
        }
    }

    /// Query returning a single boolean: does a table with the bound name exist
    pub fn table_exists_sql(&self) -> String {
        match self {
            SqlDialect::PostgreSQL => format!(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = {})",
                self.parameter_placeholder(0)
            ),
            SqlDialect::SQLite => format!(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = {})",
                self.parameter_placeholder(0)
            ),
        }
    }
}
