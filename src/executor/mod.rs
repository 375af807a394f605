//! Statement Execution
//!
//! Runs a validated candidate through a [`SqlRunner`] and turns whatever comes back
//! into an [`ExecutionResult`]. Driver errors are classified into [`ErrorKind`] here
//! and never travel further.
//!
//! # Classification
//! - PostgreSQL: SQLSTATE class
//! - MySQL: native error number first, SQLSTATE class as fallback
//! - SQLite: primary result code (the low byte of the extended code)

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{DatabaseType, DriverError, ExecutionLimits, RunOutput, SqlRunner};
use crate::statement::CandidateQuery;

/// Classified execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Syntax,
    ConstraintViolation,
    PermissionDenied,
    ConnectionLost,
    Timeout,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Syntax => "syntax",
            Self::ConstraintViolation => "constraint-violation",
            Self::PermissionDenied => "permission-denied",
            Self::ConnectionLost => "connection-lost",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Outcome of running one statement
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        row_count: usize,
        elapsed_ms: u64,
        /// Whether the configured row cap cut the result
        truncated: bool,
    },
    Affected {
        rows_affected: u64,
        elapsed_ms: u64,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl ExecutionResult {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure { kind, message: message.into() }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// Query executor
pub struct QueryExecutor {
    runner: Arc<dyn SqlRunner>,
    limits: ExecutionLimits,
}

impl QueryExecutor {
    pub fn new(runner: Arc<dyn SqlRunner>, limits: ExecutionLimits) -> Self {
        Self { runner, limits }
    }

    #[must_use]
    pub const fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Run a candidate
    ///
    /// Never fails: every driver outcome becomes an [`ExecutionResult`].
    pub async fn execute(
        &self,
        candidate: &CandidateQuery,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let engine = self.runner.engine();
        let started = Instant::now();

        let outcome = self.runner.run(&candidate.sql, &self.limits, cancel).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(RunOutput::Rows { columns, rows, truncated }) => {
                if truncated {
                    tracing::debug!(
                        max_rows = ?self.limits.max_rows,
                        "result truncated at row cap"
                    );
                }
                ExecutionResult::Rows {
                    columns,
                    row_count: rows.len(),
                    rows,
                    elapsed_ms,
                    truncated,
                }
            }
            Ok(RunOutput::Affected(rows_affected)) => {
                ExecutionResult::Affected { rows_affected, elapsed_ms }
            }
            Err(err) => {
                let kind = classify(engine, &err);
                tracing::warn!(%engine, %kind, error = %err, elapsed_ms, "statement failed");
                ExecutionResult::failure(kind, err.to_string())
            }
        }
    }
}

/// Map a driver error to an [`ErrorKind`]
#[must_use]
pub fn classify(engine: DatabaseType, error: &DriverError) -> ErrorKind {
    match error {
        DriverError::Timeout => ErrorKind::Timeout,
        DriverError::Cancelled => ErrorKind::Cancelled,
        DriverError::Connection(_) => ErrorKind::ConnectionLost,
        DriverError::Database { code, native_code, message } => match engine {
            DatabaseType::Postgres => code.as_deref().map_or(ErrorKind::Unknown, classify_sqlstate),
            DatabaseType::MySQL => native_code
                .and_then(classify_mysql)
                .or_else(|| code.as_deref().map(classify_sqlstate))
                .unwrap_or(ErrorKind::Unknown),
            DatabaseType::SQLite => {
                native_code.map_or(ErrorKind::Unknown, |c| classify_sqlite(c, message))
            }
        },
    }
}

fn classify_sqlstate(state: &str) -> ErrorKind {
    match state {
        "42501" => ErrorKind::PermissionDenied,
        "57014" => ErrorKind::Timeout,
        "25006" => ErrorKind::PermissionDenied, // read-only transaction
        s if s.starts_with("42") => ErrorKind::Syntax,
        s if s.starts_with("23") => ErrorKind::ConstraintViolation,
        s if s.starts_with("08") || s.starts_with("57P") => ErrorKind::ConnectionLost,
        s if s.starts_with("28") => ErrorKind::PermissionDenied,
        _ => ErrorKind::Unknown,
    }
}

const fn classify_mysql(code: i64) -> Option<ErrorKind> {
    match code {
        1044 | 1045 | 1142 | 1143 | 1227 | 1792 => Some(ErrorKind::PermissionDenied),
        1064 | 1054 | 1146 | 1149 => Some(ErrorKind::Syntax),
        1062 | 1451 | 1452 | 1048 | 1216 | 1217 => Some(ErrorKind::ConstraintViolation),
        2002 | 2003 | 2006 | 2013 => Some(ErrorKind::ConnectionLost),
        3024 => Some(ErrorKind::Timeout),
        1317 => Some(ErrorKind::Cancelled),
        _ => None,
    }
}

fn classify_sqlite(extended: i64, message: &str) -> ErrorKind {
    match extended & 0xff {
        19 | 20 => ErrorKind::ConstraintViolation,
        3 | 8 | 23 => ErrorKind::PermissionDenied,
        10 | 14 | 26 => ErrorKind::ConnectionLost,
        9 => ErrorKind::Cancelled,
        1 if message.contains("syntax error") || message.contains("no such") => ErrorKind::Syntax,
        _ => ErrorKind::Unknown,
    }
}
