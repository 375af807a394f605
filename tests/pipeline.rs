//! End-to-End Pipeline Tests
//!
//! Runs the orchestrator against real `SQLite` databases with a scripted text generator:
//! - Requests that translate, validate and execute
//! - Writes rejected in read-only mode before reaching the database
//! - Typos repaired through the retry loop
//! - Snapshot pinning under concurrent refresh

#![cfg(feature = "sqlite")]

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{pipeline, Scripted, TempDb};
use sqlagent::{IssueKind, OrchestratorSettings, RefreshPolicy, SchemaCatalog, Status};

// ============================================================================
// Pipeline Scenarios
// ============================================================================

#[tokio::test]
async fn test_customers_from_france() {
    let db = TempDb::shop();
    let generator = Scripted::new(&["SELECT * FROM customers WHERE country = 'France'"]);
    let response = pipeline(&db, generator, OrchestratorSettings::default())
        .handle("show all customers from France")
        .await;

    assert_eq!(response.status(), Status::Success);
    let rows = response.rows().expect("rows payload");
    let country = rows.columns.iter().position(|c| c == "country").unwrap();
    assert_eq!(rows.row_count, 2);
    assert!(rows.rows.iter().all(|row| row[country] == json!("France")));
}

#[tokio::test]
async fn test_aggregate_request_runs_end_to_end() {
    let db = TempDb::shop();
    let generator = Scripted::new(&[
        "Here is the query:\n```sql\n\
         SELECT c.name, SUM(o.total) AS total_value\n\
         FROM customers c JOIN orders o ON o.customer_id = c.id\n\
         WHERE c.country = 'France'\n\
         GROUP BY c.name\n\
         ORDER BY c.name;\n```",
    ]);
    let response = pipeline(&db, generator.clone(), OrchestratorSettings::default())
        .handle("total order value per customer in France")
        .await;

    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.attempts, 1);

    let rows = response.rows().expect("rows payload");
    assert_eq!(rows.columns, vec!["name".to_string(), "total_value".to_string()]);
    assert_eq!(
        rows.rows,
        vec![vec![json!("Amelie"), json!(30.5)], vec![json!("Bruno"), json!(5.25)]]
    );
    assert_eq!(rows.row_count, 2);
    assert!(!rows.truncated);

    // Both join columns are keys, so only the LIMIT rule fires
    assert_eq!(
        response.suggestions,
        vec!["the result is unbounded; add a LIMIT clause to cap the rows returned".to_string()]
    );

    let prompt = &generator.prompts()[0];
    assert!(prompt.contains("SQLite"));
    assert!(prompt.contains("customers"));
    assert!(prompt.contains("read-only"));
}

#[tokio::test]
async fn test_delete_rejected_in_read_only_mode() {
    let db = TempDb::shop();
    let generator = Scripted::new(&["DELETE FROM customers WHERE active = 0"]);
    let settings = OrchestratorSettings { max_retries: 1, ..OrchestratorSettings::default() };
    let response =
        pipeline(&db, generator.clone(), settings).handle("Delete inactive users").await;

    assert_eq!(response.status(), Status::ValidationError);
    assert_eq!(response.issues()[0].kind, IssueKind::WriteOnReadOnlyMode);
    assert_eq!(response.attempts, 2);
    assert_eq!(generator.prompts().len(), 2);
    assert_eq!(db.count("customers"), 3);
}

#[tokio::test]
async fn test_delete_runs_when_writes_allowed() {
    let db = TempDb::shop();
    db.execute("DELETE FROM orders WHERE customer_id = 2");
    let generator = Scripted::new(&["DELETE FROM customers WHERE active = 0"]);
    let settings = OrchestratorSettings { allow_writes: true, ..OrchestratorSettings::default() };
    let response = pipeline(&db, generator, settings).handle("Delete inactive users").await;

    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.payload(), &sqlagent::output::Payload::Affected(1));
    assert_eq!(db.count("customers"), 2);
}

#[tokio::test]
async fn test_misspelled_column_repaired_on_retry() {
    let db = TempDb::shop();
    let generator = Scripted::new(&[
        "SELECT emali FROM customers WHERE country = 'Italy'",
        "SELECT email FROM customers WHERE country = 'Italy' LIMIT 10",
    ]);
    let response = pipeline(&db, generator.clone(), OrchestratorSettings::default())
        .handle("emails of Italian customers")
        .await;

    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.attempts, 2);
    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT email FROM customers WHERE country = 'Italy' LIMIT 10")
    );
    assert_eq!(
        response.rows().map(|r| r.rows.clone()),
        Some(vec![vec![json!("carla@example.it")]])
    );

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Earlier attempts were rejected"));
    assert!(prompts[1].contains("emali"));
}

#[tokio::test]
async fn test_execution_failure_is_not_retried() {
    let db = TempDb::shop();
    let generator = Scripted::new(&[
        "INSERT INTO customers (id, name, email, country) VALUES (1, 'Dup', 'd@x', 'Spain')",
    ]);
    let settings = OrchestratorSettings { allow_writes: true, ..OrchestratorSettings::default() };
    let response = pipeline(&db, generator.clone(), settings).handle("add customer 1 again").await;

    assert_eq!(response.status(), Status::ExecutionError);
    assert_eq!(
        response.error().map(|e| e.kind),
        Some(sqlagent::ErrorKind::ConstraintViolation)
    );
    assert_eq!(generator.prompts().len(), 1);
}

#[tokio::test]
async fn test_empty_database_yields_unknown_table() {
    let path =
        std::env::temp_dir().join(format!("sqlagent_empty_{}.db", uuid::Uuid::new_v4()));
    rusqlite::Connection::open(&path)
        .and_then(|conn| conn.execute_batch("PRAGMA user_version = 1"))
        .expect("Failed to create database");
    let db = TempDb { path };

    let settings = OrchestratorSettings { max_retries: 0, ..OrchestratorSettings::default() };
    let response = pipeline(&db, Scripted::new(&["SELECT name FROM customers"]), settings)
        .handle("customer names")
        .await;

    assert_eq!(response.status(), Status::ValidationError);
    assert_eq!(response.issues()[0].kind, IssueKind::UnknownTable);
}

// ============================================================================
// Catalog Concurrency
// ============================================================================

#[tokio::test]
async fn test_pinned_snapshot_survives_refresh() {
    let db = TempDb::shop();
    let catalog = SchemaCatalog::new(db.engine(), RefreshPolicy::Manual);

    let pinned = catalog.pin().await.unwrap();
    db.execute("ALTER TABLE customers ADD COLUMN phone TEXT");
    let refreshed = catalog.refresh().await.unwrap();

    assert!(!pinned.table("customers").unwrap().has_column("phone"));
    assert!(refreshed.table("customers").unwrap().has_column("phone"));
    assert!(catalog.current().unwrap().table("customers").unwrap().has_column("phone"));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_catalog() {
    let db = TempDb::shop();
    let generator = Scripted::new(&["SELECT name FROM customers ORDER BY id LIMIT 5"]);
    let orchestrator = pipeline(&db, generator, OrchestratorSettings::default());

    let (a, b, c) = tokio::join!(
        orchestrator.handle("customer names"),
        orchestrator.handle("names of customers"),
        orchestrator.handle("list customer names"),
    );

    for response in [a, b, c] {
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.rows().map(|r| r.row_count), Some(3));
    }
}
