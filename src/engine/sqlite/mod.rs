//! `SQLite` Database Engine Implementation
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`)
//! - Schema introspection via `sqlite_master` and PRAGMAs
//! - Row counts from `sqlite_stat1` when the database was analyzed, otherwise a count
//!   capped at `ROW_COUNT_CAP`
//! - Statement timeout and cancellation through the connection's interrupt handle
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); blocking work runs on `spawn_blocking`
//! - BLOB data is Base64-encoded for JSON safety
//! - Read-only runs open the file read-only and set `PRAGMA query_only`
//! - A connection is opened per call; `:memory:` databases are therefore always empty

use rusqlite::{Connection, OpenFlags, Row};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ColumnSchema, ForeignKey, IndexSchema, Introspection, TableSchema};
use crate::engine::{
    ConnectionConfig, DatabaseType, DriverError, ExecutionLimits, MetadataSource, RunOutput,
    SqlRunner,
};
use crate::error::{AgentError, Result};

/// Busy timeout when no statement timeout is configured
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite` database engine
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    config: ConnectionConfig,
}

impl SqliteEngine {
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    fn path(&self) -> Result<String> {
        let file = self
            .config
            .file
            .as_ref()
            .ok_or_else(|| AgentError::invalid_input("SQLite requires 'file' parameter"))?;
        file.to_str().map(str::to_string).ok_or_else(|| {
            AgentError::invalid_input("SQLite file path contains invalid UTF-8 characters")
        })
    }
}

#[async_trait::async_trait]
impl MetadataSource for SqliteEngine {
    async fn introspect(&self) -> Result<Introspection> {
        let path = self.path()?;
        tokio::task::spawn_blocking(move || introspect_file(&path))
            .await
            .map_err(|e| AgentError::engine("sqlite", format!("Introspection task failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl SqlRunner for SqliteEngine {
    fn engine(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn run(
        &self,
        sql: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunOutput, DriverError> {
        let path = self.path().map_err(|e| DriverError::Connection(e.message()))?;
        let conn = open_connection(&path, limits.read_only)
            .map_err(|e| DriverError::Connection(e.message()))?;

        conn.busy_timeout(limits.timeout.unwrap_or(DEFAULT_BUSY_TIMEOUT)).map_err(driver_error)?;
        if limits.read_only {
            conn.pragma_update(None, "query_only", true).map_err(driver_error)?;
        }

        let interrupt = conn.get_interrupt_handle();
        let sql = sql.to_string();
        let max_rows = limits.max_rows;
        let mut task =
            tokio::task::spawn_blocking(move || execute_statement(&conn, &sql, max_rows));

        let deadline = async {
            match limits.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            joined = &mut task => joined.map_err(|e| {
                DriverError::database(None, None, format!("execution task failed: {e}"))
            })?,
            () = cancel.cancelled() => {
                interrupt.interrupt();
                tracing::debug!("sqlite statement interrupted (cancelled)");
                Err(DriverError::Cancelled)
            }
            () = deadline => {
                interrupt.interrupt();
                tracing::debug!(
                    timeout = ?limits.timeout,
                    "sqlite statement interrupted (timeout)"
                );
                Err(DriverError::Timeout)
            }
        }
    }
}

/// Open `SQLite` connection with appropriate flags
fn open_connection(path: &str, read_only: bool) -> Result<Connection> {
    let mode = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
    };
    let flags = mode | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    Connection::open_with_flags(path, flags)
        .map_err(|e| AgentError::connection(format!("Failed to open SQLite database: {e}")))
}

fn introspect_file(path: &str) -> Result<Introspection> {
    let conn = open_connection(path, true)?;

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(|e| engine_error("Failed to query tables", &e))?;

    let table_names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| engine_error("Failed to fetch table names", &e))?
        .collect::<std::result::Result<Vec<String>, _>>()
        .map_err(|e| engine_error("Failed to collect table names", &e))?;

    let stats = analyzed_row_counts(&conn)?;
    let tables = table_names
        .iter()
        .map(|name| introspect_table(&conn, name, &stats))
        .collect::<Result<Vec<_>>>()?;

    let database = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string();

    Ok(Introspection { database, tables })
}

/// Rows counted before a table is reported as "at least this large"
const ROW_COUNT_CAP: u64 = 100_000;

/// Row counts recorded by `ANALYZE`, keyed by lower-cased table name
fn analyzed_row_counts(conn: &Connection) -> Result<HashMap<String, u64>> {
    let analyzed: bool = conn
        .query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_stat1'
             )",
            [],
            |row| row.get(0),
        )
        .map_err(|e| engine_error("Failed to look for sqlite_stat1", &e))?;
    if !analyzed {
        return Ok(HashMap::new());
    }

    // stat is "rows [rows-per-key ...]"
    let mut stmt = conn
        .prepare("SELECT tbl, stat FROM sqlite_stat1")
        .map_err(|e| engine_error("Failed to query sqlite_stat1", &e))?;
    let entries: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| engine_error("Failed to read sqlite_stat1", &e))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| engine_error("Failed to collect sqlite_stat1", &e))?;

    let mut counts = HashMap::new();
    for (table, stat) in entries {
        let Some(rows) = stat.split_whitespace().next().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        let entry = counts.entry(table.to_lowercase()).or_insert(0);
        *entry = rows.max(*entry);
    }
    Ok(counts)
}

/// Statistic row count, or an exact count that stops at `cap`
fn row_count(
    conn: &Connection,
    table_name: &str,
    stats: &HashMap<String, u64>,
    cap: u64,
) -> Result<u64> {
    if let Some(rows) = stats.get(&table_name.to_lowercase()) {
        return Ok(*rows);
    }
    let sql =
        format!("SELECT COUNT(*) FROM (SELECT 1 FROM {} LIMIT {cap})", quote_ident(table_name));
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(|e| engine_error(&format!("Failed to count rows of {table_name}"), &e))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Introspect a single table
fn introspect_table(
    conn: &Connection,
    table_name: &str,
    stats: &HashMap<String, u64>,
) -> Result<TableSchema> {
    let quoted = quote_ident(table_name);

    // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({quoted})"))
        .map_err(|e| engine_error(&format!("Failed to prepare table_info for {table_name}"), &e))?;

    let rows: Vec<(String, String, bool, bool, i32)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i32>(3)? == 0,
                row.get::<_, Option<String>>(4)?.is_some(),
                row.get::<_, i32>(5)?,
            ))
        })
        .map_err(|e| engine_error(&format!("Failed to query columns for {table_name}"), &e))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| engine_error(&format!("Failed to collect columns for {table_name}"), &e))?;

    let mut table = TableSchema::new(
        table_name,
        rows.iter()
            .map(|(name, declared, nullable, has_default, _)| {
                ColumnSchema::new(name, declared, *nullable).with_default(*has_default)
            })
            .collect(),
    );
    table.primary_key = rows.iter().filter(|r| r.4 > 0).map(|r| r.0.clone()).collect();

    // PRAGMA foreign_key_list: id, seq, table, from, to, ...
    let mut fk_stmt = conn
        .prepare(&format!("PRAGMA foreign_key_list({quoted})"))
        .map_err(|e| {
            engine_error(&format!("Failed to prepare foreign_key_list for {table_name}"), &e)
        })?;

    table.foreign_keys = fk_stmt
        .query_map([], |row| {
            Ok(ForeignKey {
                referenced_table: row.get(2)?,
                column: row.get(3)?,
                // NULL "to" means the referenced table's primary key
                referenced_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })
        .map_err(|e| engine_error(&format!("Failed to query foreign keys for {table_name}"), &e))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| {
            engine_error(&format!("Failed to collect foreign keys for {table_name}"), &e)
        })?;

    // PRAGMA index_list: seq, name, unique, ...
    let mut idx_stmt = conn
        .prepare(&format!("PRAGMA index_list({quoted})"))
        .map_err(|e| engine_error(&format!("Failed to prepare index_list for {table_name}"), &e))?;

    let index_list: Vec<(String, bool)> = idx_stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i32>(2)? != 0)))
        .map_err(|e| engine_error(&format!("Failed to query indexes for {table_name}"), &e))?
        .filter_map(std::result::Result::ok)
        .collect();

    for (index_name, unique) in index_list {
        let mut info = conn
            .prepare(&format!("PRAGMA index_info({})", quote_ident(&index_name)))
            .map_err(|e| {
                engine_error(&format!("Failed to prepare index_info for {index_name}"), &e)
            })?;

        let columns: Vec<String> = info
            .query_map([], |row| row.get::<_, Option<String>>(2))
            .map_err(|e| {
                engine_error(&format!("Failed to query index columns for {index_name}"), &e)
            })?
            .filter_map(std::result::Result::ok)
            // expression index entries have no column name
            .flatten()
            .collect();

        table.indexes.push(IndexSchema { name: index_name, columns, unique });
    }

    table.row_count = Some(row_count(conn, table_name, stats, ROW_COUNT_CAP)?);

    Ok(table)
}

/// Run one statement and materialize its result
fn execute_statement(
    conn: &Connection,
    sql: &str,
    max_rows: Option<usize>,
) -> std::result::Result<RunOutput, DriverError> {
    let mut stmt = conn.prepare(sql).map_err(driver_error)?;

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    if columns.is_empty() {
        let changed = stmt.execute([]).map_err(driver_error)?;
        return Ok(RunOutput::Affected(changed as u64));
    }

    let mut rows = stmt.query([]).map_err(driver_error)?;
    let mut data = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next().map_err(driver_error)? {
        if max_rows.is_some_and(|max| data.len() >= max) {
            truncated = true;
            break;
        }
        data.push(row_to_json(columns.len(), row).map_err(driver_error)?);
    }

    Ok(RunOutput::Rows { columns, rows: data, truncated })
}

/// Convert a `SQLite` row to JSON values
fn row_to_json(
    width: usize,
    row: &Row,
) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn engine_error(context: &str, err: &rusqlite::Error) -> AgentError {
    AgentError::engine("sqlite", format!("{context}: {err}"))
}

/// Convert a rusqlite error, keeping the extended result code
fn driver_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => DriverError::database(
            None,
            Some(i64::from(failure.extended_code)),
            message.clone().unwrap_or_else(|| err.to_string()),
        ),
        _ => DriverError::database(None, None, err.to_string()),
    }
}
