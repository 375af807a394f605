//! `MySQL` Database Engine Implementation
//!
//! Works against `MySQL` and `MariaDB`.
//!
//! # Features
//! - Client-server connections via TCP, pooled per engine
//! - Schema introspection of `DATABASE()` via `information_schema`
//! - Statement cancel with `KILL QUERY` on timeout or cancellation
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - Session characteristics are set on every run since pooled sessions are reused
//! - `max_execution_time` only bounds SELECT server-side; the client deadline covers the rest
//! - ENUM, SET and DECIMAL values are returned as strings
//! - BLOB data is Base64-encoded for JSON safety

use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, OptsBuilder, Pool, Row, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ColumnSchema, ForeignKey, IndexSchema, Introspection, TableSchema};
use crate::engine::{
    ConnectionConfig, DatabaseType, DriverError, ExecutionLimits, MetadataSource, RunOutput,
    SqlRunner,
};
use crate::error::{AgentError, Result};

const DEFAULT_PORT: u16 = 3306;

/// `MySQL` database engine
#[derive(Debug, Clone)]
pub struct MySqlEngine {
    pool: Pool,
    database: String,
}

impl MySqlEngine {
    /// Build the engine and its pool; no connection is opened yet
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let opts = build_mysql_opts(config)?;
        let database = config.database.clone().unwrap_or_default();
        Ok(Self { pool: Pool::new(opts), database })
    }

    async fn conn(&self) -> std::result::Result<Conn, mysql_async::Error> {
        self.pool.get_conn().await
    }
}

/// Build `MySQL` connection options from `ConnectionConfig`
fn build_mysql_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AgentError::invalid_input("MySQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AgentError::invalid_input("MySQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| AgentError::invalid_input("MySQL requires 'database' parameter"))?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host.clone())
        .tcp_port(config.port.unwrap_or(DEFAULT_PORT))
        .user(Some(user.clone()))
        .pass(config.password.clone())
        .db_name(Some(database.clone()));

    Ok(opts)
}

#[async_trait::async_trait]
impl MetadataSource for MySqlEngine {
    async fn introspect(&self) -> Result<Introspection> {
        let mut conn = self
            .conn()
            .await
            .map_err(|e| AgentError::connection(format!("Failed to connect to MySQL: {e}")))?;

        let database: Option<String> = conn
            .query_first("SELECT DATABASE()")
            .await
            .map_err(|e| engine_error("Failed to read database name", &e))?
            .flatten();

        let mut tables = introspect_tables(&mut conn).await?;
        introspect_columns(&mut conn, &mut tables).await?;
        introspect_indexes(&mut conn, &mut tables).await?;
        introspect_foreign_keys(&mut conn, &mut tables).await?;

        Ok(Introspection {
            database: database.unwrap_or_else(|| self.database.clone()),
            tables: tables.into_values().collect(),
        })
    }
}

async fn introspect_tables(conn: &mut Conn) -> Result<BTreeMap<String, TableSchema>> {
    let rows: Vec<(String, Option<u64>)> = conn
        .query(
            "SELECT table_name, table_rows
             FROM information_schema.tables
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'
             ORDER BY table_name",
        )
        .await
        .map_err(|e| engine_error("Failed to query tables", &e))?;

    Ok(rows
        .into_iter()
        .map(|(name, row_count)| {
            let mut table = TableSchema::new(name.clone(), Vec::new());
            table.row_count = row_count;
            (name, table)
        })
        .collect())
}

async fn introspect_columns(
    conn: &mut Conn,
    tables: &mut BTreeMap<String, TableSchema>,
) -> Result<()> {
    let rows: Vec<(String, String, String, i64, i64)> = conn
        .query(
            "SELECT table_name, column_name, column_type,
                    is_nullable = 'YES',
                    column_default IS NOT NULL OR extra LIKE '%auto_increment%'
             FROM information_schema.columns
             WHERE table_schema = DATABASE()
             ORDER BY table_name, ordinal_position",
        )
        .await
        .map_err(|e| engine_error("Failed to query columns", &e))?;

    for (table, name, column_type, nullable, has_default) in rows {
        if let Some(entry) = tables.get_mut(&table) {
            let column = ColumnSchema::new(name, column_type, nullable != 0)
                .with_default(has_default != 0);
            entry.columns.push(column);
        }
    }
    Ok(())
}

async fn introspect_indexes(
    conn: &mut Conn,
    tables: &mut BTreeMap<String, TableSchema>,
) -> Result<()> {
    let rows: Vec<(String, String, i64, Option<String>)> = conn
        .query(
            "SELECT table_name, index_name, non_unique, column_name
             FROM information_schema.statistics
             WHERE table_schema = DATABASE()
             ORDER BY table_name, index_name, seq_in_index",
        )
        .await
        .map_err(|e| engine_error("Failed to query indexes", &e))?;

    for (table, index, non_unique, column) in rows {
        let Some(entry) = tables.get_mut(&table) else {
            continue;
        };
        // Functional index parts have no column name
        let Some(column) = column else {
            continue;
        };
        if index == "PRIMARY" {
            entry.primary_key.insert(column);
            continue;
        }
        match entry.indexes.iter_mut().find(|i| i.name == index) {
            Some(existing) => existing.columns.push(column),
            None => entry.indexes.push(IndexSchema {
                name: index,
                columns: vec![column],
                unique: non_unique == 0,
            }),
        }
    }
    Ok(())
}

async fn introspect_foreign_keys(
    conn: &mut Conn,
    tables: &mut BTreeMap<String, TableSchema>,
) -> Result<()> {
    let rows: Vec<(String, String, String, String)> = conn
        .query(
            "SELECT table_name, column_name, referenced_table_name, referenced_column_name
             FROM information_schema.key_column_usage
             WHERE table_schema = DATABASE() AND referenced_table_name IS NOT NULL
             ORDER BY table_name, constraint_name, ordinal_position",
        )
        .await
        .map_err(|e| engine_error("Failed to query foreign keys", &e))?;

    for (table, column, referenced_table, referenced_column) in rows {
        if let Some(entry) = tables.get_mut(&table) {
            entry.foreign_keys.push(ForeignKey { column, referenced_table, referenced_column });
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl SqlRunner for MySqlEngine {
    fn engine(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn run(
        &self,
        sql: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunOutput, DriverError> {
        let mut conn = self.conn().await.map_err(driver_error)?;

        let access = if limits.read_only { "READ ONLY" } else { "READ WRITE" };
        let timeout_ms = limits.timeout.map_or(0, |t| t.as_millis());
        conn.query_drop(format!("SET SESSION TRANSACTION {access}")).await.map_err(driver_error)?;
        conn.query_drop(format!("SET SESSION max_execution_time = {timeout_ms}"))
            .await
            .map_err(driver_error)?;

        let connection_id = conn.id();
        let deadline = async {
            match limits.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = execute_statement(&mut conn, sql, limits.max_rows) => result,
            () = cancel.cancelled() => {
                self.kill_query(connection_id).await;
                Err(DriverError::Cancelled)
            }
            () = deadline => {
                self.kill_query(connection_id).await;
                Err(DriverError::Timeout)
            }
        }
    }
}

impl MySqlEngine {
    /// Stop the statement running on another session
    async fn kill_query(&self, connection_id: u32) {
        let result = match self.conn().await {
            Ok(mut conn) => conn.query_drop(format!("KILL QUERY {connection_id}")).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(connection_id, "mysql statement killed"),
            Err(e) => tracing::warn!(connection_id, error = %e, "failed to kill mysql statement"),
        }
    }
}

async fn execute_statement(
    conn: &mut Conn,
    sql: &str,
    max_rows: Option<usize>,
) -> std::result::Result<RunOutput, DriverError> {
    let mut result = conn.query_iter(sql).await.map_err(driver_error)?;

    let columns = result.columns_ref().to_vec();
    if columns.is_empty() {
        let affected = result.affected_rows();
        result.drop_result().await.map_err(driver_error)?;
        return Ok(RunOutput::Affected(affected));
    }

    let mut rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = result.next().await.map_err(driver_error)? {
        if max_rows.is_some_and(|max| rows.len() >= max) {
            truncated = true;
            break;
        }
        rows.push(row_to_json(&row, &columns));
    }
    result.drop_result().await.map_err(driver_error)?;

    Ok(RunOutput::Rows {
        columns: columns.iter().map(|c| c.name_str().to_string()).collect(),
        rows,
        truncated,
    })
}

fn row_to_json(row: &Row, columns: &[Column]) -> Vec<serde_json::Value> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            row.as_ref(idx).map_or(serde_json::Value::Null, |v| mysql_value_to_json(v, column))
        })
        .collect()
}

/// Convert `MySQL` value to JSON value
fn mysql_value_to_json(value: &Value, column: &Column) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => text_to_json(bytes, column.column_type()),

        Value::Int(i) => serde_json::Value::from(*i),

        Value::UInt(u) => serde_json::Value::from(*u),

        // NaN/Infinity become null
        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),

        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),

        Value::Date(year, month, day, hour, minute, second, micro) => {
            serde_json::Value::String(format!(
                "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
            ))
        }

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!(
                "{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}"
            ))
        }
    }
}

/// Text-protocol values arrive as bytes; restore numbers and JSON by column type
fn text_to_json(bytes: &[u8], column_type: ColumnType) -> serde_json::Value {
    use base64::Engine;

    let Ok(text) = std::str::from_utf8(bytes) else {
        return serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
    };
    let fallback = || serde_json::Value::String(text.to_string());

    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(serde_json::Value::from)
            .or_else(|_| text.parse::<u64>().map(serde_json::Value::from))
            .unwrap_or_else(|_| fallback()),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or_else(fallback, serde_json::Value::Number),
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(text).unwrap_or_else(|_| fallback()),
        _ => fallback(),
    }
}

fn engine_error(context: &str, err: &mysql_async::Error) -> AgentError {
    AgentError::engine("mysql", format!("{context}: {err}"))
}

/// Convert a driver error, keeping the SQLSTATE and native code
fn driver_error(err: mysql_async::Error) -> DriverError {
    match err {
        mysql_async::Error::Server(server) => {
            DriverError::database(Some(server.state), Some(i64::from(server.code)), server.message)
        }
        mysql_async::Error::Io(e) => DriverError::Connection(e.to_string()),
        mysql_async::Error::Driver(e) => DriverError::Connection(e.to_string()),
        other => DriverError::database(None, None, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_opts_requires_host() {
        let mut config = ConnectionConfig::mysql(
            "localhost".to_string(),
            3306,
            "app".to_string(),
            "secret".to_string(),
            "shop".to_string(),
        );
        assert!(build_mysql_opts(&config).is_ok());

        config.host = None;
        let err = build_mysql_opts(&config).unwrap_err();
        assert!(err.message().contains("'host'"));
    }

    #[test]
    fn test_text_values_restore_types() {
        assert_eq!(text_to_json(b"42", ColumnType::MYSQL_TYPE_LONG), json!(42));
        assert_eq!(
            text_to_json(b"18446744073709551615", ColumnType::MYSQL_TYPE_LONGLONG),
            json!(u64::MAX)
        );
        assert_eq!(text_to_json(b"1.5", ColumnType::MYSQL_TYPE_DOUBLE), json!(1.5));
        assert_eq!(text_to_json(b"12.50", ColumnType::MYSQL_TYPE_NEWDECIMAL), json!("12.50"));
        assert_eq!(text_to_json(br#"{"a":1}"#, ColumnType::MYSQL_TYPE_JSON), json!({"a": 1}));
        assert_eq!(text_to_json(b"France", ColumnType::MYSQL_TYPE_VAR_STRING), json!("France"));
        assert_eq!(text_to_json(&[0xff, 0x00], ColumnType::MYSQL_TYPE_BLOB), json!("/wA="));
    }

    #[test]
    fn test_server_error_keeps_codes() {
        let err = driver_error(mysql_async::Error::Server(mysql_async::ServerError {
            code: 1146,
            message: "Table 'shop.nope' doesn't exist".to_string(),
            state: "42S02".to_string(),
        }));
        assert_eq!(
            err,
            DriverError::database(
                Some("42S02".to_string()),
                Some(1146),
                "Table 'shop.nope' doesn't exist"
            )
        );
    }

    fn live_engine() -> MySqlEngine {
        MySqlEngine::new(&ConnectionConfig::mysql(
            std::env::var("MYSQL_HOST").unwrap_or_else(|_| "localhost".to_string()),
            3306,
            std::env::var("MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
            std::env::var("MYSQL_PASSWORD").unwrap_or_default(),
            std::env::var("MYSQL_DATABASE").unwrap_or_else(|_| "test".to_string()),
        ))
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running MySQL server"]
    async fn test_introspect_live() {
        let introspection = live_engine().introspect().await.unwrap();
        assert!(!introspection.database.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running MySQL server"]
    async fn test_timeout_kills_statement() {
        let limits = ExecutionLimits {
            timeout: Some(std::time::Duration::from_millis(100)),
            ..ExecutionLimits::default()
        };
        let result = live_engine().run("SELECT SLEEP(5)", &limits, &CancellationToken::new()).await;
        // SLEEP interrupted by max_execution_time returns 1 instead of an error
        match result {
            Err(err) => {
                let kind = crate::executor::classify(DatabaseType::MySQL, &err);
                assert_eq!(kind, crate::executor::ErrorKind::Timeout);
            }
            Ok(RunOutput::Rows { rows, .. }) => assert_eq!(rows, vec![vec![json!(1)]]),
            Ok(other) => panic!("unexpected output {other:?}"),
        }
    }
}
