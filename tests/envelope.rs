//! Output Validation Tests
//!
//! Checks the response envelope produced by real pipeline runs:
//! - Stable camelCase keys with exactly one payload field
//! - JSON and CSV rendering through `ResponseFormatter`
//! - The published JSON Schema covers every envelope field
//! - Auxiliary-command envelopes keep the `ok`/`engine`/`command` shape
//!
//! Uses `insta` for snapshot testing to detect unintended output changes.

#![cfg(feature = "sqlite")]

mod common;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use common::{pipeline, Scripted, TempDb};
use sqlagent::output::{ErrorEnvelope, SuccessEnvelope};
use sqlagent::{
    AgentError, AgentResponse, OrchestratorSettings, OutputFormat, ResponseFormatter, Status,
};

async fn ask(db: &TempDb, reply: &str, request: &str) -> AgentResponse {
    let settings = OrchestratorSettings { max_retries: 0, ..OrchestratorSettings::default() };
    pipeline(db, Scripted::new(&[reply]), settings).handle(request).await
}

/// Envelope as JSON with the run-dependent fields masked
fn masked(response: &AgentResponse) -> Value {
    let rendered = ResponseFormatter::new(OutputFormat::Json, true).render(response).unwrap();
    let mut value: Value = serde_json::from_str(&rendered).unwrap();
    value["timestamp"] = json!("<timestamp>");
    value["elapsedMs"] = json!("<elapsed>");
    value
}

// ============================================================================
// Response Envelope
// ============================================================================

#[tokio::test]
async fn test_rows_envelope_snapshot() {
    let db = TempDb::shop();
    let sql = "SELECT name, country FROM customers WHERE id = 3";
    let response = ask(&db, sql, "where is customer 3 from").await;

    insta::assert_json_snapshot!(masked(&response), @r###"
    {
      "attempts": 1,
      "elapsedMs": "<elapsed>",
      "rows": {
        "columns": [
          "name",
          "country"
        ],
        "rowCount": 1,
        "rows": [
          [
            "Carla",
            "Italy"
          ]
        ],
        "truncated": false
      },
      "sql": "SELECT name, country FROM customers WHERE id = 3",
      "status": "success",
      "suggestions": [],
      "timestamp": "<timestamp>"
    }
    "###);
}

#[tokio::test]
async fn test_issues_envelope_shape() {
    let db = TempDb::shop();
    let response = ask(&db, "SELECT emali FROM customers", "emails").await;
    let value = masked(&response);

    assert_eq!(value["status"], "validation-error");
    assert_eq!(value["sql"], "SELECT emali FROM customers");
    assert_eq!(value["issues"][0]["kind"], "unknown-column");
    assert_eq!(value["issues"][0]["identifier"], "emali");
    assert!(value.get("rows").is_none());
    assert!(value.get("error").is_none());
}

#[tokio::test]
async fn test_exactly_one_payload_field() {
    let db = TempDb::shop();
    let responses = [
        ask(&db, "SELECT id FROM orders WHERE id = 1", "order 1").await,
        ask(&db, "SELECT nope FROM orders", "nope").await,
        ask(&db, "SELECT id FROM orders WHERE id = 1 +", "broken").await,
    ];

    for response in &responses {
        let value = masked(response);
        let present: Vec<&str> = ["rows", "affected", "error", "issues"]
            .into_iter()
            .filter(|key| value.get(*key).is_some())
            .collect();
        assert_eq!(present.len(), 1, "{value}");
    }
}

#[tokio::test]
async fn test_csv_rendering_of_rows() {
    let db = TempDb::shop();
    let sql = "SELECT id, name FROM customers ORDER BY id LIMIT 2";
    let response = ask(&db, sql, "first two customers").await;
    assert_eq!(response.status(), Status::Success);

    let csv = ResponseFormatter::new(OutputFormat::Csv, false).render(&response).unwrap();
    assert_eq!(csv, "id,name\n1,Amelie\n2,Bruno\n");
}

#[test]
fn test_envelope_schema_lists_fields() {
    let schema = ResponseFormatter::new(OutputFormat::Json, false).schema().unwrap();
    let fields =
        ["status", "sql", "suggestions", "attempts", "elapsedMs", "timestamp", "rows", "issues"];
    for field in fields {
        assert!(schema.contains(&format!("\"{field}\"")), "missing {field}");
    }
}

// ============================================================================
// Auxiliary Envelopes
// ============================================================================

#[test]
fn test_success_envelope_structure() {
    let envelope = SuccessEnvelope::new("sqlite", "tables", json!(["customers", "orders"]));
    let value = serde_json::to_value(&envelope).unwrap();

    assert_eq!(
        value,
        json!({
            "ok": true,
            "engine": "sqlite",
            "command": "tables",
            "data": ["customers", "orders"]
        })
    );
}

#[test]
fn test_error_envelope_structure() {
    let err = AgentError::invalid_input("Table 'invoices' not found");
    let value =
        serde_json::to_value(ErrorEnvelope::from_error("sqlite", "describe", &err)).unwrap();

    assert_eq!(value["ok"], false);
    assert_eq!(value["command"], "describe");
    assert_eq!(value["error"]["code"], err.error_code());
    assert!(value["error"]["message"].as_str().unwrap().contains("invoices"));
}
