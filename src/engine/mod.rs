//! Database Engine Capabilities and Core Types
//!
//! This module defines the two external capabilities the pipeline consumes from a
//! database, plus the driver-neutral payloads that cross this boundary:
//!
//! - [`MetadataSource`]: read-only enumeration of tables, columns, keys and statistics
//! - [`SqlRunner`]: `run(sql, limits, cancel)` returning rows, an affected count, or a
//!   [`DriverError`]
//!
//! Each engine (`PostgreSQL`, `MySQL`, `SQLite`) implements both.
//!
//! # Engine Isolation
//! Each engine implementation is completely independent.
//! No shared SQL helpers or cross-engine abstractions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::catalog::Introspection;
use crate::error::{AgentError, Result};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// Dialect name used in prompts
    #[must_use]
    pub const fn dialect_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "sqlite" => Ok(Self::SQLite),
            other => Err(AgentError::invalid_input(format!("Unknown engine: {other}"))),
        }
    }
}

/// Connection configuration for database engines
///
/// Fields are engine-specific (e.g., `file` only applies to `SQLite`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database engine type
    pub engine: DatabaseType,

    /// Hostname (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (for postgres/mysql)
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database name (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file path (for sqlite)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl ConnectionConfig {
    /// Create a new `PostgreSQL` connection config
    #[must_use]
    pub const fn postgres(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: DatabaseType::Postgres,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            file: None,
        }
    }

    /// Create a new `MySQL` connection config
    #[must_use]
    pub const fn mysql(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: DatabaseType::MySQL,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            file: None,
        }
    }

    /// Create a new `SQLite` connection config
    #[must_use]
    pub const fn sqlite(file: PathBuf) -> Self {
        Self {
            engine: DatabaseType::SQLite,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file: Some(file),
        }
    }

    /// Check that the fields the engine needs are present
    pub fn validate(&self) -> Result<()> {
        match self.engine {
            DatabaseType::SQLite => {
                if self.file.is_none() {
                    return Err(AgentError::invalid_input("SQLite requires 'file' parameter"));
                }
            }
            DatabaseType::Postgres | DatabaseType::MySQL => {
                if self.database.is_none() {
                    return Err(AgentError::invalid_input(format!(
                        "{} requires 'database' parameter",
                        self.engine.dialect_name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-statement execution limits
///
/// Defaults to the most restrictive mode (read-only) with no timeout and no cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Statement timeout; `None` means wait indefinitely
    pub timeout: Option<Duration>,

    /// Hard cap on materialized rows; `None` means no cap
    pub max_rows: Option<usize>,

    /// Open the session read-only where the driver supports it
    pub read_only: bool,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self { timeout: None, max_rows: None, read_only: true }
    }
}

/// Driver-neutral output of a successful statement
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    /// Row-returning statement, fully materialized
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        /// Whether `max_rows` cut the result
        truncated: bool,
    },
    /// Statement without a result set
    Affected(u64),
}

/// Driver-neutral error reported by a [`SqlRunner`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The statement timeout elapsed
    #[error("statement timed out")]
    Timeout,

    /// The caller cancelled the statement
    #[error("statement cancelled")]
    Cancelled,

    /// Connection could not be established or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Error reported by the database server
    #[error("{message}")]
    Database {
        /// SQLSTATE (postgres/mysql) or extended result code (sqlite)
        code: Option<String>,
        /// Native numeric error code
        native_code: Option<i64>,
        message: String,
    },
}

impl DriverError {
    /// Create a database-reported error
    pub fn database(
        code: Option<String>,
        native_code: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        Self::Database { code, native_code, message: message.into() }
    }
}

/// Read-only metadata enumeration consumed by the schema catalog
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Read all base tables with their columns, keys, indexes and statistics
    async fn introspect(&self) -> Result<Introspection>;
}

/// Statement execution consumed by the query executor
#[async_trait]
pub trait SqlRunner: Send + Sync {
    /// Engine the statements are run against
    fn engine(&self) -> DatabaseType;

    /// Run one statement
    ///
    /// Implementations must honour `limits.timeout` and `cancel` by issuing a
    /// statement cancel where the driver allows it, and must never return raw
    /// driver errors.
    async fn run(
        &self,
        sql: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunOutput, DriverError>;
}

/// A database engine provides both capabilities
pub trait DatabaseEngine: MetadataSource + SqlRunner {
    /// Share this engine as the catalog's metadata source
    fn metadata_source(self: Arc<Self>) -> Arc<dyn MetadataSource>;

    /// Share this engine as the executor's runner
    fn sql_runner(self: Arc<Self>) -> Arc<dyn SqlRunner>;
}

impl<T: MetadataSource + SqlRunner + 'static> DatabaseEngine for T {
    fn metadata_source(self: Arc<Self>) -> Arc<dyn MetadataSource> {
        self
    }

    fn sql_runner(self: Arc<Self>) -> Arc<dyn SqlRunner> {
        self
    }
}

/// Build the engine for a connection config
///
/// No connection is opened here; connection failures surface on first use.
pub fn connect(config: &ConnectionConfig) -> Result<Arc<dyn DatabaseEngine>> {
    config.validate()?;

    match config.engine {
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => Ok(Arc::new(sqlite::SqliteEngine::new(config.clone()))),

        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => Ok(Arc::new(postgres::PostgresEngine::new(config.clone()))),

        #[cfg(feature = "mysql")]
        DatabaseType::MySQL => Ok(Arc::new(mysql::MySqlEngine::new(config)?)),

        #[allow(unreachable_patterns)]
        other => Err(AgentError::invalid_input(format!(
            "Engine '{other}' is not enabled in this build"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_serialization() {
        assert_eq!(serde_json::to_string(&DatabaseType::Postgres).unwrap(), r#""postgres""#);
        assert_eq!(serde_json::to_string(&DatabaseType::MySQL).unwrap(), r#""mysql""#);
        assert_eq!(serde_json::to_string(&DatabaseType::SQLite).unwrap(), r#""sqlite""#);
    }

    #[test]
    fn test_database_type_from_str() {
        assert_eq!("PostgreSQL".parse::<DatabaseType>().unwrap(), DatabaseType::Postgres);
        assert_eq!("mariadb".parse::<DatabaseType>().unwrap(), DatabaseType::MySQL);
        assert_eq!("sqlite".parse::<DatabaseType>().unwrap(), DatabaseType::SQLite);
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn test_connection_config_constructors() {
        let pg_config = ConnectionConfig::postgres(
            "localhost".to_string(),
            5432,
            "user".to_string(),
            "pass".to_string(),
            "db".to_string(),
        );
        assert_eq!(pg_config.engine, DatabaseType::Postgres);
        assert_eq!(pg_config.port, Some(5432));
        assert!(pg_config.validate().is_ok());

        let sqlite_config = ConnectionConfig::sqlite(PathBuf::from("/tmp/test.db"));
        assert_eq!(sqlite_config.engine, DatabaseType::SQLite);
        assert!(sqlite_config.validate().is_ok());
    }

    #[test]
    fn test_connection_config_validation() {
        let mut config = ConnectionConfig::sqlite(PathBuf::from("/tmp/test.db"));
        config.file = None;
        assert!(matches!(config.validate(), Err(AgentError::InvalidInput(_))));

        let mut config = ConnectionConfig::mysql(
            "localhost".to_string(),
            3306,
            "root".to_string(),
            String::new(),
            "shop".to_string(),
        );
        config.database = None;
        assert!(config.validate().unwrap_err().message().contains("database"));
    }

    #[test]
    fn test_execution_limits_default_to_read_only() {
        let limits = ExecutionLimits::default();
        assert!(limits.read_only);
        assert!(limits.timeout.is_none());
        assert!(limits.max_rows.is_none());
    }
}
