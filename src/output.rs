//! JSON Output Envelope Types
//!
//! Every pipeline run returns exactly one [`AgentResponse`]. Auxiliary CLI commands
//! (`tables`, `describe`, `check`, `connect`) use the smaller [`SuccessEnvelope`] /
//! [`ErrorEnvelope`] pair.
//!
//! # Output Contract
//! - Success: `{"status": "success", "sql": "...", "rows": {...} | "affected": n, ...}`
//! - Validation error: `{"status": "validation-error", "sql": "..."|null, "issues": [...], ...}`
//! - Execution error: `{"status": "execution-error", "sql": "..."|null, "error": {...}, ...}`
//!
//! Every envelope also carries `suggestions`, `attempts`, `elapsedMs` and `timestamp`.
//!
//! Exactly one of `rows`, `affected`, `issues`, `error` is present, and `status` is
//! derived from which one.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::error::{AgentError, Result};
use crate::executor::{ErrorKind, ExecutionResult};
use crate::validator::ValidationIssue;

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Success,
    ValidationError,
    ExecutionError,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ValidationError => "validation-error",
            Self::ExecutionError => "execution-error",
        }
    }

    /// Process exit code for the CLI
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ExecutionError => 1,
            Self::ValidationError => 2,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialized result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// Whether the configured row cap cut the result
    pub truncated: bool,
}

/// Classified execution failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

/// The one populated payload of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Rows(RowSet),
    Affected(u64),
    Error(ErrorDetail),
    Issues(Vec<ValidationIssue>),
}

impl Payload {
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::Rows(_) | Self::Affected(_) => Status::Success,
            Self::Error(_) => Status::ExecutionError,
            Self::Issues(_) => Status::ValidationError,
        }
    }
}

impl From<ExecutionResult> for Payload {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Rows { columns, rows, row_count, truncated, .. } => {
                Self::Rows(RowSet { columns, rows, row_count, truncated })
            }
            ExecutionResult::Affected { rows_affected, .. } => Self::Affected(rows_affected),
            ExecutionResult::Failure { kind, message } => {
                Self::Error(ErrorDetail { kind, message })
            }
        }
    }
}

/// Envelope returned for every request
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    status: Status,

    /// SQL that was run (or the last candidate, for validation errors)
    pub sql: Option<String>,

    #[serde(flatten)]
    payload: Payload,

    /// Optimization suggestions, possibly empty
    pub suggestions: Vec<String>,

    /// Translation attempts made
    pub attempts: u32,

    /// Wall-clock time for the whole request
    pub elapsed_ms: u64,

    /// Completion time (RFC 3339)
    pub timestamp: String,
}

impl AgentResponse {
    /// Create a response; `status` follows from the payload
    pub fn new(sql: Option<String>, payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Self {
            status: payload.status(),
            sql,
            payload,
            suggestions: Vec::new(),
            attempts: 0,
            elapsed_ms: 0,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn validation_error(sql: Option<String>, issues: Vec<ValidationIssue>) -> Self {
        Self::new(sql, Payload::Issues(issues))
    }

    pub fn execution_error(
        sql: Option<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::new(sql, Payload::Error(ErrorDetail { kind, message: message.into() }))
    }

    #[must_use]
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub const fn rows(&self) -> Option<&RowSet> {
        match &self.payload {
            Payload::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    #[must_use]
    pub fn issues(&self) -> &[ValidationIssue] {
        match &self.payload {
            Payload::Issues(issues) => issues,
            _ => &[],
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&ErrorDetail> {
        match &self.payload {
            Payload::Error(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    /// Rows as CSV; other payloads fall back to JSON
    Csv,
}

/// Renders envelopes for stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseFormatter {
    pub format: OutputFormat,
    pub compact: bool,
}

impl ResponseFormatter {
    #[must_use]
    pub const fn new(format: OutputFormat, compact: bool) -> Self {
        Self { format, compact }
    }

    /// Render a response
    pub fn render(&self, response: &AgentResponse) -> Result<String> {
        match (self.format, response.rows()) {
            (OutputFormat::Csv, Some(rows)) => Ok(to_csv(rows)),
            _ => self.json(response),
        }
    }

    /// Render any serializable value as JSON
    pub fn json<T: Serialize>(&self, value: &T) -> Result<String> {
        let rendered = if self.compact {
            serde_json::to_string(value)
        } else {
            serde_json::to_string_pretty(value)
        };
        rendered.map_err(|e| AgentError::invalid_input(format!("Failed to serialize output: {e}")))
    }

    /// JSON Schema of [`AgentResponse`]
    pub fn schema(&self) -> Result<String> {
        self.json(&schemars::schema_for!(AgentResponse))
    }
}

/// RFC 4180 CSV with a header row
#[must_use]
pub fn to_csv(rows: &RowSet) -> String {
    let mut out = String::new();
    let header: Vec<String> = rows.columns.iter().map(|c| csv_field(c)).collect();
    let _ = writeln!(out, "{}", header.join(","));
    for row in &rows.rows {
        let fields: Vec<String> = row
            .iter()
            .map(|value| match value {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(s) => csv_field(s),
                other => csv_field(&other.to_string()),
            })
            .collect();
        let _ = writeln!(out, "{}", fields.join(","));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Success envelope for auxiliary commands
#[derive(Debug, Clone, Serialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Database engine (empty when the command is not engine-specific)
    pub engine: String,

    /// Command that was executed
    pub command: String,

    /// Command-specific data
    pub data: T,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data }
    }
}

/// Error envelope for auxiliary commands
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub engine: String,
    pub command: String,
    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    /// Create error envelope from an [`AgentError`]
    pub fn from_error(
        engine: impl Into<String>,
        command: impl Into<String>,
        err: &AgentError,
    ) -> Self {
        Self {
            ok: false,
            engine: engine.into(),
            command: command.into(),
            error: ErrorInfo { code: err.error_code().to_string(), message: err.message() },
        }
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `CONNECTION_FAILED`)
    pub code: String,

    /// Human-readable message without credentials
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::IssueKind;
    use serde_json::{json, Value};

    fn rows() -> RowSet {
        RowSet {
            columns: vec!["name".to_string(), "note".to_string()],
            rows: vec![
                vec![json!("Ada"), json!("says \"hi\", twice")],
                vec![json!("Linus"), Value::Null],
                vec![json!(42), json!(true)],
            ],
            row_count: 3,
            truncated: false,
        }
    }

    fn to_value(response: &AgentResponse) -> Value {
        serde_json::to_value(response).unwrap()
    }

    #[test]
    fn test_exactly_one_payload_key() {
        let responses = [
            AgentResponse::new(Some("SELECT 1".to_string()), Payload::Rows(rows())),
            AgentResponse::new(Some("DELETE FROM t".to_string()), Payload::Affected(3)),
            AgentResponse::execution_error(None, ErrorKind::Timeout, "timed out"),
            AgentResponse::validation_error(
                None,
                vec![ValidationIssue::new(
                    IssueKind::UnknownTable,
                    "t",
                    "table 't' does not exist",
                )],
            ),
        ];
        for response in &responses {
            let value = to_value(response);
            let present: Vec<&str> = ["rows", "affected", "error", "issues"]
                .into_iter()
                .filter(|k| value.get(k).is_some())
                .collect();
            assert_eq!(present.len(), 1, "{value}");
        }
    }

    #[test]
    fn test_status_follows_payload() {
        assert_eq!(AgentResponse::new(None, Payload::Affected(1)).status(), Status::Success);
        assert_eq!(
            AgentResponse::execution_error(None, ErrorKind::Syntax, "x").status(),
            Status::ExecutionError
        );
        assert_eq!(AgentResponse::validation_error(None, vec![]).status(), Status::ValidationError);
        assert_eq!(Status::ValidationError.exit_code(), 2);
    }

    #[test]
    fn test_envelope_shape() {
        let response = AgentResponse::execution_error(
            Some("SELECT * FROM t".to_string()),
            ErrorKind::ConstraintViolation,
            "UNIQUE constraint failed",
        )
        .with_attempts(1)
        .with_elapsed_ms(12);

        let mut value = to_value(&response);
        value["timestamp"] = json!("<timestamp>");
        insta::assert_json_snapshot!(value, @r###"
        {
          "attempts": 1,
          "elapsedMs": 12,
          "error": {
            "kind": "constraint-violation",
            "message": "UNIQUE constraint failed"
          },
          "sql": "SELECT * FROM t",
          "status": "execution-error",
          "suggestions": [],
          "timestamp": "<timestamp>"
        }
        "###);
    }

    #[test]
    fn test_payload_from_execution_result() {
        let payload = Payload::from(ExecutionResult::Affected { rows_affected: 4, elapsed_ms: 2 });
        assert_eq!(payload, Payload::Affected(4));

        let payload = Payload::from(ExecutionResult::failure(ErrorKind::Cancelled, "cancelled"));
        assert_eq!(payload.status(), Status::ExecutionError);
    }

    #[test]
    fn test_csv_rendering() {
        assert_eq!(
            to_csv(&rows()),
            "name,note\nAda,\"says \"\"hi\"\", twice\"\nLinus,\n42,true\n"
        );
    }

    #[test]
    fn test_csv_falls_back_to_json_without_rows() {
        let formatter = ResponseFormatter::new(OutputFormat::Csv, true);
        let rendered = formatter.render(&AgentResponse::new(None, Payload::Affected(2))).unwrap();
        assert!(rendered.starts_with(r#"{"status":"success","sql":null,"affected":2"#));
    }

    #[test]
    fn test_schema_mentions_payload_keys() {
        let schema = ResponseFormatter::default().schema().unwrap();
        for key in ["status", "rows", "affected", "issues", "elapsedMs"] {
            assert!(schema.contains(key), "missing {key}");
        }
    }

    #[test]
    fn test_error_envelope_from_agent_error() {
        let err = AgentError::connection("could not open database");
        let envelope = ErrorEnvelope::from_error("sqlite", "tables", &err);
        assert!(!envelope.ok);
        assert_eq!(envelope.error.code, "CONNECTION_FAILED");
        assert!(envelope.error.message.contains("could not open database"));
    }
}
