//! Validation Performance Benchmarks
//!
//! Measures the per-candidate work done before anything reaches the database:
//! - Statement parsing in each dialect
//! - Schema validation against a mid-sized snapshot
//! - Optimizer advice
//! - Schema context selection for prompts

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sqlagent::advisor::{Advisor, AdvisorSettings};
use sqlagent::catalog::{ColumnSchema, ForeignKey, SchemaSnapshot, TableSchema};
use sqlagent::statement::CandidateQuery;
use sqlagent::translator::select_context;
use sqlagent::{validator, DatabaseType};

const JOIN_QUERY: &str = "SELECT c.name, SUM(o.total) AS total_value \
     FROM customers c JOIN orders o ON o.customer_id = c.id \
     WHERE c.country = 'France' AND o.total > 10 \
     GROUP BY c.name ORDER BY total_value DESC LIMIT 20";

/// Snapshot with the shop tables plus filler tables
fn snapshot() -> SchemaSnapshot {
    let mut customers = TableSchema::new(
        "customers",
        vec![
            ColumnSchema::new("id", "INTEGER", false),
            ColumnSchema::new("name", "TEXT", false),
            ColumnSchema::new("country", "TEXT", false),
        ],
    );
    customers.primary_key.insert("id".to_string());

    let mut orders = TableSchema::new(
        "orders",
        vec![
            ColumnSchema::new("id", "INTEGER", false),
            ColumnSchema::new("customer_id", "INTEGER", false),
            ColumnSchema::new("total", "NUMERIC(10,2)", false),
        ],
    );
    orders.primary_key.insert("id".to_string());
    orders.foreign_keys.push(ForeignKey {
        column: "customer_id".to_string(),
        referenced_table: "customers".to_string(),
        referenced_column: "id".to_string(),
    });

    let mut tables = vec![customers, orders];
    for i in 0..48 {
        let columns =
            (0..10).map(|c| ColumnSchema::new(format!("field_{c}"), "TEXT", true)).collect();
        tables.push(TableSchema::new(format!("archive_{i}"), columns));
    }
    SchemaSnapshot::new("shop", tables)
}

fn bench_parse(c: &mut Criterion) {
    for engine in [DatabaseType::Postgres, DatabaseType::MySQL, DatabaseType::SQLite] {
        c.bench_function(&format!("parse_join_{engine}"), |b| {
            b.iter(|| CandidateQuery::new(black_box(JOIN_QUERY), "", engine, 1));
        });
    }
}

fn bench_validate(c: &mut Criterion) {
    let snapshot = snapshot();
    let candidate = CandidateQuery::new(JOIN_QUERY, "", DatabaseType::Postgres, 1).unwrap();
    let typo =
        CandidateQuery::new("SELECT emali, nme FROM customers", "", DatabaseType::Postgres, 1)
            .unwrap();

    c.bench_function("validate_valid_join", |b| {
        b.iter(|| validator::check(black_box(&candidate.statement), &snapshot, false));
    });

    c.bench_function("validate_unknown_columns", |b| {
        b.iter(|| validator::check(black_box(&typo.statement), &snapshot, false));
    });
}

fn bench_advise(c: &mut Criterion) {
    let snapshot = snapshot();
    let advisor = Advisor::new(AdvisorSettings::default());
    let candidate =
        CandidateQuery::new(JOIN_QUERY, "order totals in France", DatabaseType::Postgres, 1)
            .unwrap();

    c.bench_function("advise_join", |b| {
        b.iter(|| advisor.advise(black_box(&candidate), &snapshot));
    });
}

fn bench_context(c: &mut Criterion) {
    let snapshot = snapshot();

    c.bench_function("select_context_50_tables", |b| {
        b.iter(|| {
            select_context(
                black_box("total order value per customer in France"),
                &snapshot,
                &[],
                6000,
            )
        });
    });
}

criterion_group!(benches, bench_parse, bench_validate, bench_advise, bench_context);
criterion_main!(benches);
