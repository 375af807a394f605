//! Schema Catalog
//!
//! Fetches and caches the structural metadata of the connected database.
//! Every validation, translation and advisory step works against a
//! [`SchemaSnapshot`] obtained from here.
//!
//! # Snapshot Lifecycle
//! - Created on first use or explicit refresh
//! - Immutable once built (shared as `Arc<SchemaSnapshot>`)
//! - Superseded wholesale by the next refresh, never mutated in place
//!
//! Readers pin the `Arc` they started with, so a refresh that lands mid-request
//! is invisible to that request. The swap itself happens under a short write
//! lock, which makes it atomic for every reader.
//!
//! # Caching Policy
//! The catalog never re-queries on its own per request. A snapshot is reused
//! until it is invalidated explicitly or, when a TTL is configured, until it
//! ages out.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::MetadataSource;
use crate::error::{AgentError, Result};

/// Supported scalar type kinds
///
/// Declared column types are folded into this fixed set when a snapshot is
/// built. Anything unrecognised becomes `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Integer,
    Decimal,
    Float,
    Text,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Json,
    Uuid,
    Other,
}

impl ScalarKind {
    /// Fold an engine-declared type name into a scalar kind
    ///
    /// Follows SQLite's affinity rules where they apply (substring matching),
    /// with the more specific names checked first.
    #[must_use]
    pub fn from_declared(declared: &str) -> Self {
        let t = declared.trim().to_ascii_lowercase();

        if t.is_empty() {
            return Self::Other;
        }
        // "interval" and "point" contain "int"
        if t.starts_with("interval") || t.contains("point") {
            return Self::Other;
        }
        if t == "tinyint(1)" || t.starts_with("bool") || t == "bit" || t == "bit(1)" {
            return Self::Boolean;
        }
        if t.contains("int") || t == "serial" || t == "bigserial" || t == "smallserial" {
            return Self::Integer;
        }
        if t.contains("dec") || t.contains("numeric") || t.contains("money") {
            return Self::Decimal;
        }
        if t.contains("real") || t.contains("floa") || t.contains("doub") {
            return Self::Float;
        }
        if t.contains("timestamp") || t.contains("datetime") {
            return Self::Timestamp;
        }
        if t.starts_with("date") {
            return Self::Date;
        }
        if t.starts_with("time") {
            return Self::Time;
        }
        if t.contains("json") {
            return Self::Json;
        }
        if t == "uuid" {
            return Self::Uuid;
        }
        if t.contains("blob") || t.contains("binary") || t == "bytea" {
            return Self::Binary;
        }
        if t.contains("char")
            || t.contains("text")
            || t.contains("clob")
            || t.starts_with("enum")
            || t.starts_with("set(")
            || t == "name"
            || t == "citext"
        {
            return Self::Text;
        }
        Self::Other
    }

    /// Whether values of this kind compare numerically
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Decimal | Self::Float)
    }
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Float => "float",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Time => "time",
            Self::Timestamp => "timestamp",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Uuid => "uuid",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name as reported by the database
    pub name: String,

    /// Folded scalar kind
    pub kind: ScalarKind,

    /// Engine-declared type (e.g. `VARCHAR(255)`)
    pub declared_type: String,

    /// Whether column allows NULL values
    pub nullable: bool,

    /// Whether the column has a default value
    pub has_default: bool,
}

impl ColumnSchema {
    /// Create a column, folding the declared type
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>, nullable: bool) -> Self {
        let declared_type = declared_type.into();
        Self {
            name: name.into(),
            kind: ScalarKind::from_declared(&declared_type),
            declared_type,
            nullable,
            has_default: false,
        }
    }

    /// Mark the column as having a default value
    #[must_use]
    pub const fn with_default(mut self, has_default: bool) -> Self {
        self.has_default = has_default;
        self
    }
}

/// Foreign-key edge (column → referenced table.column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Index metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,

    /// Columns in ordinal order
    pub columns: Vec<ColumnSchema>,

    /// Primary key column names
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub primary_key: BTreeSet<String>,

    /// Foreign-key edges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,

    /// Secondary indexes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSchema>,

    /// Row-count statistic (exact or estimated, engine dependent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl TableSchema {
    /// Create a table with no keys, indexes or statistics
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: BTreeSet::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            row_count: None,
        }
    }

    /// Look up a column (case-insensitive)
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Whether the table has a column with this name (case-insensitive)
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Whether the column is part of the primary key
    #[must_use]
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Whether the column is the table's whole (single-column) primary key
    #[must_use]
    pub fn is_sole_primary_key(&self, column: &str) -> bool {
        self.primary_key.len() == 1 && self.is_primary_key(column)
    }

    /// Whether lookups on the column can use a key or an index
    ///
    /// Primary-key columns, foreign-key columns and the leading column of any
    /// index count.
    #[must_use]
    pub fn is_keyed(&self, column: &str) -> bool {
        self.is_primary_key(column)
            || self.foreign_keys.iter().any(|fk| fk.column.eq_ignore_ascii_case(column))
            || self
                .indexes
                .iter()
                .any(|idx| idx.columns.first().is_some_and(|c| c.eq_ignore_ascii_case(column)))
    }
}

/// Raw result of a metadata read, before it becomes a snapshot
#[derive(Debug, Clone)]
pub struct Introspection {
    /// Database identifier (database name or file name)
    pub database: String,

    /// Base tables
    pub tables: Vec<TableSchema>,
}

/// Immutable view of the database schema at capture time
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    /// Database identifier
    pub database: String,

    /// Capture timestamp
    pub captured_at: DateTime<Utc>,

    /// Tables keyed by lower-cased name
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    /// Build a snapshot from introspected tables
    ///
    /// Table names are compared case-insensitively. When two tables collide
    /// after normalization the first one wins and the collision is logged.
    #[must_use]
    pub fn new(database: impl Into<String>, tables: Vec<TableSchema>) -> Self {
        let mut map = BTreeMap::new();
        for table in tables {
            let key = table.name.to_lowercase();
            if map.contains_key(&key) {
                tracing::warn!(
                    table = %table.name,
                    "duplicate table name after case folding; keeping first"
                );
                continue;
            }
            map.insert(key, table);
        }
        Self { database: database.into(), captured_at: Utc::now(), tables: map }
    }

    /// Look up a table (case-insensitive)
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }

    /// Iterate tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// Table names in name order
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables.values().map(|t| t.name.clone()).collect()
    }

    /// Number of tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the snapshot has no tables
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// When a cached snapshot should be re-read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Only on first use or explicit refresh/invalidate
    Manual,
    /// Additionally when the snapshot is older than the TTL
    Ttl(Duration),
}

impl RefreshPolicy {
    /// Policy from an optional TTL in seconds
    #[must_use]
    pub const fn from_ttl_secs(ttl: Option<u64>) -> Self {
        match ttl {
            Some(secs) => Self::Ttl(Duration::from_secs(secs)),
            None => Self::Manual,
        }
    }
}

struct Cached {
    snapshot: Arc<SchemaSnapshot>,
    loaded_at: Instant,
    /// Invalidation generation observed before the load started
    generation: u64,
}

/// Owner of the current schema snapshot
pub struct SchemaCatalog {
    source: Arc<dyn MetadataSource>,
    policy: RefreshPolicy,
    current: RwLock<Option<Cached>>,
    generation: AtomicU64,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SchemaCatalog {
    /// Create an empty catalog over a metadata source
    pub fn new(source: Arc<dyn MetadataSource>, policy: RefreshPolicy) -> Self {
        Self {
            source,
            policy,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Re-read all metadata and swap in a new snapshot
    ///
    /// Concurrent refreshes are serialized; the swap is a single pointer
    /// replacement under the write lock. On failure the previous snapshot stays
    /// current.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>> {
        let _gate = self.refresh_gate.lock().await;
        self.load().await
    }

    async fn load(&self) -> Result<Arc<SchemaSnapshot>> {
        let started = Instant::now();
        // An invalidate that lands while introspecting leaves this snapshot stale
        let generation = self.generation.load(Ordering::Acquire);
        let introspection = self.source.introspect().await.map_err(|e| match e {
            AgentError::Connection(_) => e,
            other => AgentError::connection(format!("Failed to read schema metadata: {other}")),
        })?;

        let snapshot = Arc::new(SchemaSnapshot::new(introspection.database, introspection.tables));
        *self.current.write() = Some(Cached {
            snapshot: Arc::clone(&snapshot),
            loaded_at: Instant::now(),
            generation,
        });

        tracing::debug!(
            database = %snapshot.database,
            tables = snapshot.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "schema snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Last successful snapshot
    pub fn current(&self) -> Result<Arc<SchemaSnapshot>> {
        self.current
            .read()
            .as_ref()
            .map(|cached| Arc::clone(&cached.snapshot))
            .ok_or(AgentError::NotInitialized)
    }

    /// Describe a table from the current snapshot
    #[must_use]
    pub fn describe(&self, table: &str) -> Option<TableSchema> {
        self.current.read().as_ref().and_then(|cached| cached.snapshot.table(table).cloned())
    }

    /// Mark the current snapshot stale so the next [`Self::pin`] re-reads it
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Snapshot to use for one request
    ///
    /// Returns the cached snapshot unless there is none yet, it was
    /// invalidated, or the TTL policy says it expired.
    pub async fn pin(&self) -> Result<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another request may have refreshed while we waited
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }
        self.load().await
    }

    fn fresh(&self) -> Option<Arc<SchemaSnapshot>> {
        let guard = self.current.read();
        let cached = guard.as_ref()?;
        if cached.generation != self.generation.load(Ordering::Acquire) {
            return None;
        }
        if let RefreshPolicy::Ttl(ttl) = self.policy {
            if cached.loaded_at.elapsed() >= ttl {
                return None;
            }
        }
        Some(Arc::clone(&cached.snapshot))
    }
}

impl std::fmt::Debug for SchemaCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCatalog")
            .field("policy", &self.policy)
            .field("initialized", &self.current.read().is_some())
            .finish_non_exhaustive()
    }
}
