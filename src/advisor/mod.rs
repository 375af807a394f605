//! Rule-based optimization advice
//!
//! Four rules, evaluated in a fixed order, each contributing at most one suggestion:
//!
//! 1. Missing WHERE on UPDATE/DELETE, or on reads of large tables
//! 2. Joins on columns with no key or index
//! 3. `SELECT *` when fewer columns are needed or the table is wide
//! 4. Missing LIMIT on unbounded row-returning statements
//!
//! Advice never blocks execution.

use std::collections::HashSet;

use crate::catalog::{SchemaSnapshot, TableSchema};
use crate::statement::{
    CandidateQuery, ColumnRef, CompareOp, ParsedStatement, Relation, Site, StatementKind,
    ROOT_SCOPE,
};

/// Advisor thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvisorSettings {
    /// Row-count statistic at which a table counts as large
    pub large_table_rows: u64,

    /// Column count above which a table counts as wide
    pub wide_table_columns: usize,
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        Self { large_table_rows: 10_000, wide_table_columns: 12 }
    }
}

/// Query optimizer advisor
#[derive(Debug, Clone, Copy, Default)]
pub struct Advisor {
    settings: AdvisorSettings,
}

impl Advisor {
    #[must_use]
    pub const fn new(settings: AdvisorSettings) -> Self {
        Self { settings }
    }

    /// Suggestions for a validated candidate, in rule order
    #[must_use]
    pub fn advise(&self, candidate: &CandidateQuery, snapshot: &SchemaSnapshot) -> Vec<String> {
        let statement = &candidate.statement;
        [
            self.missing_where(statement, snapshot),
            unkeyed_join(statement, snapshot),
            self.select_star(statement, snapshot, &candidate.request),
            missing_limit(statement, snapshot),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn missing_where(
        &self,
        statement: &ParsedStatement,
        snapshot: &SchemaSnapshot,
    ) -> Option<String> {
        if statement.has_where {
            return None;
        }
        match &statement.kind {
            StatementKind::Update | StatementKind::Delete => {
                let target = statement.root_tables().next()?;
                Some(format!(
                    "{} without a WHERE clause affects every row of '{}'; \
                     add a condition if that is not intended",
                    statement.kind.to_string().to_uppercase(),
                    target.name
                ))
            }
            kind if kind.returns_rows() && !is_ungrouped_aggregate(statement) => {
                let (table, rows) = statement.root_tables().find_map(|t| {
                    let rows = snapshot.table(&t.name)?.row_count?;
                    (rows >= self.settings.large_table_rows).then_some((&t.name, rows))
                })?;
                Some(format!(
                    "'{table}' holds about {rows} rows and the query has no WHERE clause; \
                     filter to avoid a full scan"
                ))
            }
            _ => None,
        }
    }

    fn select_star(
        &self,
        statement: &ParsedStatement,
        snapshot: &SchemaSnapshot,
        request: &str,
    ) -> Option<String> {
        if !statement.select_star || !statement.kind.returns_rows() {
            return None;
        }
        let table = snapshot.table(&statement.root_tables().next()?.name)?;

        let words = request_words(request);
        let named: Vec<&str> = table
            .columns
            .iter()
            .filter(|c| names_column(&words, request, &c.name))
            .map(|c| c.name.as_str())
            .collect();

        if !named.is_empty() && named.len() < table.columns.len() {
            return Some(format!(
                "SELECT * returns all {} columns of '{}'; the request only mentions {}",
                table.columns.len(),
                table.name,
                named.join(", ")
            ));
        }
        (table.columns.len() > self.settings.wide_table_columns).then(|| {
            format!(
                "SELECT * on '{}' returns {} columns; list only the columns you need",
                table.name,
                table.columns.len()
            )
        })
    }
}

fn unkeyed_join(statement: &ParsedStatement, snapshot: &SchemaSnapshot) -> Option<String> {
    statement.joins.iter().find_map(|join| {
        let left = resolve(statement, snapshot, &join.left)?;
        let right = resolve(statement, snapshot, &join.right)?;
        let unkeyed: Vec<String> = [(left, &join.left), (right, &join.right)]
            .into_iter()
            .filter(|(table, col)| !table.is_keyed(&col.name))
            .map(|(table, col)| format!("{}.{}", table.name, col.name))
            .collect();
        (!unkeyed.is_empty()).then(|| {
            format!(
                "join {} = {} uses {} without a key or index; consider indexing {}",
                join.left,
                join.right,
                if unkeyed.len() == 1 { "a column" } else { "columns" },
                unkeyed.join(" and ")
            )
        })
    })
}

fn missing_limit(statement: &ParsedStatement, snapshot: &SchemaSnapshot) -> Option<String> {
    if !statement.kind.returns_rows() || statement.has_limit || is_ungrouped_aggregate(statement) {
        return None;
    }
    let pinned = statement.comparisons.iter().any(|c| {
        c.site == Site::Filter
            && c.op == CompareOp::Eq
            && c.column.scope == ROOT_SCOPE
            && resolve(statement, snapshot, &c.column)
                .is_some_and(|t| t.is_sole_primary_key(&c.column.name))
    });
    (!pinned).then(|| {
        "the result is unbounded; add a LIMIT clause to cap the rows returned".to_string()
    })
}

const fn is_ungrouped_aggregate(statement: &ParsedStatement) -> bool {
    matches!(statement.kind, StatementKind::Aggregate) && !statement.has_group_by
}

/// Table a column reference belongs to, when that is unambiguous
fn resolve<'a>(
    statement: &ParsedStatement,
    snapshot: &'a SchemaSnapshot,
    column: &ColumnRef,
) -> Option<&'a TableSchema> {
    match &column.qualifier {
        Some(q) => match statement.relation(q, column.scope) {
            Relation::Table(table) => snapshot.table(&table.name),
            Relation::Derived(_) | Relation::Unknown => None,
        },
        None => {
            let mut owners = statement
                .tables_in_reach(column.scope)
                .filter_map(|t| snapshot.table(&t.name))
                .filter(|t| t.has_column(&column.name));
            let first = owners.next()?;
            owners.all(|t| t.name.eq_ignore_ascii_case(&first.name)).then_some(first)
        }
    }
}

fn request_words(request: &str) -> HashSet<String> {
    request
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether the request mentions a column (`email`, `emails`, `created_at` or "created at")
fn names_column(words: &HashSet<String>, request: &str, column: &str) -> bool {
    let column = column.to_lowercase();
    if column.contains('_') {
        let spaced = column.replace('_', " ");
        let request = request.to_lowercase();
        return request.contains(&spaced) || request.contains(&column);
    }
    words.contains(&column)
        || words.contains(&format!("{column}s"))
        || words.contains(&format!("{column}es"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnSchema, ForeignKey, IndexSchema};
    use crate::engine::DatabaseType;
    use pretty_assertions::assert_eq;

    fn snapshot() -> SchemaSnapshot {
        let mut customers = TableSchema::new(
            "customers",
            vec![
                ColumnSchema::new("id", "INTEGER", false),
                ColumnSchema::new("name", "TEXT", false),
                ColumnSchema::new("email", "TEXT", true),
                ColumnSchema::new("country", "TEXT", true),
            ],
        );
        customers.primary_key.insert("id".to_string());
        customers.row_count = Some(250);

        let mut orders = TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "INTEGER", false),
                ColumnSchema::new("customer_id", "INTEGER", false),
                ColumnSchema::new("customer_email", "TEXT", true),
                ColumnSchema::new("total", "DECIMAL(10,2)", false),
            ],
        );
        orders.primary_key.insert("id".to_string());
        orders.foreign_keys.push(ForeignKey {
            column: "customer_id".to_string(),
            referenced_table: "customers".to_string(),
            referenced_column: "id".to_string(),
        });
        orders.row_count = Some(50_000);

        let wide = TableSchema::new(
            "events",
            (0..20).map(|i| ColumnSchema::new(format!("c{i}"), "TEXT", true)).collect(),
        );

        let mut logs = TableSchema::new("logs", vec![ColumnSchema::new("host", "TEXT", true)]);
        logs.indexes.push(IndexSchema {
            name: "logs_host".to_string(),
            columns: vec!["host".to_string()],
            unique: false,
        });

        SchemaSnapshot::new("shop", vec![customers, orders, wide, logs])
    }

    fn advise(sql: &str, request: &str) -> Vec<String> {
        let candidate = CandidateQuery::new(sql, request, DatabaseType::SQLite, 1).unwrap();
        Advisor::default().advise(&candidate, &snapshot())
    }

    #[test]
    fn test_clean_query_gets_no_advice() {
        let advice = advise(
            "SELECT name, email FROM customers WHERE country = 'France' LIMIT 50",
            "names and emails of French customers",
        );
        assert!(advice.is_empty(), "{advice:?}");
    }

    #[test]
    fn test_delete_without_where() {
        let advice = advise("DELETE FROM customers", "delete all customers");
        assert_eq!(advice.len(), 1);
        assert!(advice[0].starts_with("DELETE without a WHERE clause"));
    }

    #[test]
    fn test_large_table_scan() {
        let advice = advise("SELECT id, total FROM orders LIMIT 10", "order totals");
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("'orders' holds about 50000 rows"));

        // small table: no advice
        assert!(advise("SELECT name FROM customers LIMIT 10", "names").is_empty());
    }

    #[test]
    fn test_ungrouped_aggregate_needs_neither_where_nor_limit() {
        assert!(advise("SELECT COUNT(*) FROM orders", "how many orders").is_empty());
    }

    #[test]
    fn test_join_on_unkeyed_column() {
        let advice = advise(
            "SELECT c.name, o.total FROM orders o \
             JOIN customers c ON o.customer_email = c.email WHERE o.total > 5 LIMIT 5",
            "order totals by customer",
        );
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("orders.customer_email and customers.email"));

        let advice = advise(
            "SELECT c.name, o.total FROM orders o \
             JOIN customers c ON o.customer_id = c.id WHERE o.total > 5 LIMIT 5",
            "order totals by customer",
        );
        assert!(advice.is_empty(), "{advice:?}");
    }

    #[test]
    fn test_select_star_with_named_columns() {
        let advice = advise(
            "SELECT * FROM customers WHERE country = 'France' LIMIT 5",
            "emails of French customers",
        );
        assert_eq!(
            advice,
            vec![
                "SELECT * returns all 4 columns of 'customers'; the request only mentions email"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_select_star_on_wide_table() {
        let advice = advise("SELECT * FROM events LIMIT 5", "recent events");
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("returns 20 columns"));
    }

    #[test]
    fn test_missing_limit() {
        let advice =
            advise("SELECT name FROM customers WHERE country = 'France'", "French customer names");
        assert_eq!(
            advice,
            vec!["the result is unbounded; add a LIMIT clause to cap the rows returned".to_string()]
        );

        // pinned by primary key
        assert!(advise("SELECT name FROM customers WHERE id = 7", "customer 7").is_empty());

        // a key lookup inside a subquery does not pin the outer result
        let advice = advise(
            "SELECT name FROM customers \
             WHERE country IN (SELECT country FROM customers WHERE id = 7)",
            "customers from the same country as customer 7",
        );
        assert_eq!(advice.len(), 1);
    }

    #[test]
    fn test_rules_ignore_tables_inside_ctes() {
        // orders is large, but only the CTE reads it
        let advice = advise(
            "WITH t AS (SELECT customer_id FROM orders WHERE total > 5) \
             SELECT name FROM customers LIMIT 10",
            "customers",
        );
        assert!(advice.is_empty(), "{advice:?}");
    }

    #[test]
    fn test_rules_keep_fixed_order() {
        let advice = advise(
            "SELECT * FROM orders o JOIN customers c ON o.customer_email = c.email",
            "everything",
        );
        assert_eq!(advice.len(), 3);
        assert!(advice[0].contains("no WHERE clause"));
        assert!(advice[1].starts_with("join"));
        assert!(advice[2].contains("LIMIT"));
    }
}
