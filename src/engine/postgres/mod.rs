//! `PostgreSQL` Database Engine Implementation
//!
//! # Features
//! - Client-server connections via TCP
//! - Schema introspection of the session's `current_schema()` via `pg_catalog`,
//!   with `pg_class.reltuples` as the row-count estimate
//! - Statement cancel through the protocol cancel token on timeout or cancellation
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - One connection per call; the connection task is spawned and dropped with the client
//! - Read-only runs mark the session `READ ONLY`; timeouts also set `statement_timeout`
//! - JSON/JSONB preserved as nested JSON, BYTEA Base64-encoded
//! - NUMERIC is decoded from the binary wire format into an exact decimal string

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{CancelToken, Client, Config, NoTls, Row};
use tokio_util::sync::CancellationToken;

use crate::catalog::{ColumnSchema, ForeignKey, IndexSchema, Introspection, TableSchema};
use crate::engine::{
    ConnectionConfig, DatabaseType, DriverError, ExecutionLimits, MetadataSource, RunOutput,
    SqlRunner,
};
use crate::error::{AgentError, Result};

const DEFAULT_PORT: u16 = 5432;

/// `PostgreSQL` database engine
#[derive(Debug, Clone)]
pub struct PostgresEngine {
    config: ConnectionConfig,
}

impl PostgresEngine {
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<Client> {
        let pg_config = build_pg_config(&self.config)?;
        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| AgentError::connection(format!("Failed to connect to PostgreSQL: {e}")))?;

        // Connection errors are not logged to prevent credential leakage
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(client)
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AgentError::invalid_input("PostgreSQL requires 'host' parameter"))?;
    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AgentError::invalid_input("PostgreSQL requires 'user' parameter"))?;
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| AgentError::invalid_input("PostgreSQL requires 'database' parameter"))?;

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(config.port.unwrap_or(DEFAULT_PORT))
        .user(user)
        .dbname(database)
        .application_name("sqlagent");
    if let Some(password) = &config.password {
        pg_config.password(password);
    }
    Ok(pg_config)
}

#[async_trait::async_trait]
impl MetadataSource for PostgresEngine {
    async fn introspect(&self) -> Result<Introspection> {
        let client = self.connect().await?;

        let database: String = client
            .query_one("SELECT current_database()::text", &[])
            .await
            .map_err(|e| engine_error("Failed to read database name", &e))?
            .get(0);

        let mut tables = introspect_tables(&client).await?;
        introspect_columns(&client, &mut tables).await?;
        introspect_indexes(&client, &mut tables).await?;
        introspect_foreign_keys(&client, &mut tables).await?;

        Ok(Introspection { database, tables: tables.into_values().collect() })
    }
}

async fn introspect_tables(client: &Client) -> Result<BTreeMap<String, TableSchema>> {
    let rows = client
        .query(
            "SELECT c.relname::text, c.reltuples::bigint
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = current_schema() AND c.relkind IN ('r', 'p')
             ORDER BY c.relname",
            &[],
        )
        .await
        .map_err(|e| engine_error("Failed to query tables", &e))?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let mut table = TableSchema::new(name.clone(), Vec::new());
            // -1 means the table was never analyzed
            table.row_count = u64::try_from(row.get::<_, i64>(1)).ok();
            (name, table)
        })
        .collect())
}

async fn introspect_columns(
    client: &Client,
    tables: &mut BTreeMap<String, TableSchema>,
) -> Result<()> {
    let rows = client
        .query(
            "SELECT c.relname::text, a.attname::text, format_type(a.atttypid, a.atttypmod),
                    NOT a.attnotnull, a.atthasdef
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = current_schema() AND c.relkind IN ('r', 'p')
               AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY c.relname, a.attnum",
            &[],
        )
        .await
        .map_err(|e| engine_error("Failed to query columns", &e))?;

    for row in rows {
        let table: String = row.get(0);
        if let Some(entry) = tables.get_mut(&table) {
            let column =
                ColumnSchema::new(row.get::<_, String>(1), row.get::<_, String>(2), row.get(3))
                    .with_default(row.get(4));
            entry.columns.push(column);
        }
    }
    Ok(())
}

async fn introspect_indexes(
    client: &Client,
    tables: &mut BTreeMap<String, TableSchema>,
) -> Result<()> {
    let rows = client
        .query(
            "SELECT t.relname::text, i.relname::text, ix.indisprimary, ix.indisunique,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    )
             FROM pg_index ix
             JOIN pg_class t ON t.oid = ix.indrelid
             JOIN pg_class i ON i.oid = ix.indexrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             WHERE n.nspname = current_schema()
             ORDER BY t.relname, i.relname",
            &[],
        )
        .await
        .map_err(|e| engine_error("Failed to query indexes", &e))?;

    for row in rows {
        let table: String = row.get(0);
        let Some(entry) = tables.get_mut(&table) else {
            continue;
        };
        let columns: Vec<String> = row.get(4);
        if row.get::<_, bool>(2) {
            entry.primary_key = columns.into_iter().collect();
        } else {
            entry.indexes.push(IndexSchema { name: row.get(1), columns, unique: row.get(3) });
        }
    }
    Ok(())
}

async fn introspect_foreign_keys(
    client: &Client,
    tables: &mut BTreeMap<String, TableSchema>,
) -> Result<()> {
    let rows = client
        .query(
            "SELECT cl.relname::text, a.attname::text, rc.relname::text, ra.attname::text
             FROM pg_constraint con
             JOIN pg_class cl ON cl.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = cl.relnamespace
             JOIN pg_class rc ON rc.oid = con.confrelid
             CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(col, refcol)
             JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.col
             JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.refcol
             WHERE con.contype = 'f' AND n.nspname = current_schema()
             ORDER BY cl.relname, con.conname",
            &[],
        )
        .await
        .map_err(|e| engine_error("Failed to query foreign keys", &e))?;

    for row in rows {
        let table: String = row.get(0);
        if let Some(entry) = tables.get_mut(&table) {
            entry.foreign_keys.push(ForeignKey {
                column: row.get(1),
                referenced_table: row.get(2),
                referenced_column: row.get(3),
            });
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl SqlRunner for PostgresEngine {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn run(
        &self,
        sql: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunOutput, DriverError> {
        let client = self.connect().await.map_err(|e| DriverError::Connection(e.message()))?;

        let mut setup = String::new();
        if limits.read_only {
            setup.push_str("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY;");
        }
        if let Some(timeout) = limits.timeout {
            let _ = write!(setup, "SET statement_timeout = {};", timeout.as_millis());
        }
        if !setup.is_empty() {
            client.batch_execute(&setup).await.map_err(driver_error)?;
        }

        let cancel_token = client.cancel_token();
        let deadline = async {
            match limits.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = execute_statement(&client, sql, limits.max_rows) => result,
            () = cancel.cancelled() => {
                cancel_statement(&cancel_token).await;
                Err(DriverError::Cancelled)
            }
            () = deadline => {
                cancel_statement(&cancel_token).await;
                Err(DriverError::Timeout)
            }
        }
    }
}

async fn cancel_statement(token: &CancelToken) {
    match token.cancel_query(NoTls).await {
        Ok(()) => tracing::debug!("postgres statement cancel sent"),
        Err(e) => tracing::warn!(error = %e, "failed to cancel postgres statement"),
    }
}

async fn execute_statement(
    client: &Client,
    sql: &str,
    max_rows: Option<usize>,
) -> std::result::Result<RunOutput, DriverError> {
    let stmt = client.prepare(sql).await.map_err(driver_error)?;

    if stmt.columns().is_empty() {
        let affected = client.execute(&stmt, &[]).await.map_err(driver_error)?;
        return Ok(RunOutput::Affected(affected));
    }

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let mut rows = client.query(&stmt, &[]).await.map_err(driver_error)?;

    let truncated = max_rows.is_some_and(|max| rows.len() > max);
    if let Some(max) = max_rows {
        rows.truncate(max);
    }

    let data = rows
        .iter()
        .map(|row| (0..columns.len()).map(|idx| postgres_value_to_json(row, idx)).collect())
        .collect::<std::result::Result<Vec<Vec<Value>>, _>>()
        .map_err(driver_error)?;

    Ok(RunOutput::Rows { columns, rows: data, truncated })
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<Value, tokio_postgres::Error> {
    use base64::Engine;

    let number = |v: f64| serde_json::Number::from_f64(v).map(Value::Number);

    let value = match row.columns()[idx].type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        "oid" => row.try_get::<_, Option<u32>>(idx)?.map(Value::from),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.and_then(|v| number(f64::from(v))),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.and_then(number),
        "numeric" => row.try_get::<_, Option<PgNumeric>>(idx)?.map(|n| Value::String(n.0)),
        "varchar" | "text" | "bpchar" | "name" | "unknown" => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        "json" | "jsonb" => row.try_get::<_, Option<Value>>(idx)?,
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|v| Value::String(base64::engine::general_purpose::STANDARD.encode(v))),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        "time" => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),
        "uuid" => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(|v| Value::String(v.to_string())),
        _ => row.try_get::<_, Option<Lossy>>(idx)?.map(|v| v.0),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Exact decimal text of a binary NUMERIC value
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw).map(Self).ok_or_else(|| "malformed NUMERIC value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the NUMERIC wire format: ndigits, weight, sign, dscale, then base-10000 digits
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| raw.get(i * 2..i * 2 + 2).map(|b| i16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::try_from(word(0)?).ok()?;
    let weight = i32::from(word(1)?);
    let sign = u16::from_be_bytes(word(2)?.to_be_bytes());
    let dscale = usize::try_from(word(3)?).ok()?;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digits: Vec<i16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;
    // Digit group with the given base-10000 exponent
    let group = |exp: i32| {
        usize::try_from(weight - exp).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        let _ = write!(out, "{}", group(weight));
        for exp in (0..weight).rev() {
            let _ = write!(out, "{:04}", group(exp));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut exp = -1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", group(exp));
            exp -= 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

/// Fallback for types without a dedicated mapping: text if UTF-8, Base64 otherwise
struct Lossy(Value);

impl<'a> FromSql<'a> for Lossy {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        use base64::Engine;
        Ok(Self(match std::str::from_utf8(raw) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(raw)),
        }))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn engine_error(context: &str, err: &tokio_postgres::Error) -> AgentError {
    AgentError::engine("postgres", format!("{context}: {err}"))
}

/// Convert a driver error, keeping the SQLSTATE
fn driver_error(err: tokio_postgres::Error) -> DriverError {
    if let Some(db) = err.as_db_error() {
        return DriverError::database(Some(db.code().code().to_string()), None, db.message());
    }
    if err.is_closed() {
        return DriverError::Connection(err.to_string());
    }
    DriverError::database(None, None, err.to_string())
}
