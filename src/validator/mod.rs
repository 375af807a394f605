//! Static Query Validation
//!
//! Checks a candidate statement against a schema snapshot before anything is run.
//!
//! # Validation Strategy
//! - Write and DDL statements are rejected outright unless writes are allowed
//! - Every referenced table and column must exist (aliases and qualified names resolved)
//! - Literal comparisons are type-checked only when the mismatch is unambiguous
//! - All issues are collected, not just the first, so one repair round can fix them
//!
//! The validator is a pure function of (candidate, snapshot) and needs no locking.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::catalog::{ColumnSchema, ScalarKind, SchemaSnapshot, TableSchema};
use crate::statement::{
    CandidateQuery, ColumnRef, CompareOp, DerivedRelation, Literal, ParsedStatement, Relation, Site,
    StatementKind,
};

/// Validation issue kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    UnknownTable,
    UnknownColumn,
    TypeMismatch,
    UnsupportedConstruct,
    WriteOnReadOnlyMode,
    /// No usable statement could be translated from the request
    NoStatement,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UnknownTable => "unknown-table",
            Self::UnknownColumn => "unknown-column",
            Self::TypeMismatch => "type-mismatch",
            Self::UnsupportedConstruct => "unsupported-construct",
            Self::WriteOnReadOnlyMode => "write-on-read-only-mode",
            Self::NoStatement => "no-statement",
        };
        f.write_str(name)
    }
}

/// One problem found in a candidate statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationIssue {
    /// Issue kind
    pub kind: IssueKind,

    /// The offending identifier (table, column, or statement keyword)
    pub identifier: String,

    /// Human-readable explanation
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, identifier: identifier.into(), message: message.into() }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.identifier, self.message)
    }
}

/// Outcome of validating one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid(CandidateQuery),
    Invalid(Vec<ValidationIssue>),
}

impl ValidationResult {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Validate a candidate against a snapshot
pub fn validate(
    candidate: CandidateQuery,
    snapshot: &SchemaSnapshot,
    allow_writes: bool,
) -> ValidationResult {
    let issues = check(&candidate.statement, snapshot, allow_writes);
    if issues.is_empty() {
        ValidationResult::Valid(candidate)
    } else {
        tracing::debug!(
            attempt = candidate.attempt,
            issues = issues.len(),
            "candidate rejected by validator"
        );
        ValidationResult::Invalid(issues)
    }
}

/// Collect every issue in a parsed statement
#[must_use]
pub fn check(
    statement: &ParsedStatement,
    snapshot: &SchemaSnapshot,
    allow_writes: bool,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if statement.kind.is_write() && !allow_writes {
        let keyword = statement.kind.to_string().to_uppercase();
        issues.push(ValidationIssue::new(
            IssueKind::WriteOnReadOnlyMode,
            &keyword,
            format!("{keyword} statements are not allowed while writes are disabled"),
        ));
    }

    match &statement.kind {
        StatementKind::Other(keyword) => {
            issues.push(ValidationIssue::new(
                IssueKind::UnsupportedConstruct,
                keyword,
                format!(
                    "{keyword} statements are not supported; use SELECT, INSERT, UPDATE or DELETE"
                ),
            ));
            return issues;
        }
        // Objects named by DDL may not exist yet
        StatementKind::Ddl => return issues,
        _ => {}
    }

    check_tables(statement, snapshot, &mut issues);
    check_columns(statement, snapshot, &mut issues);
    check_literals(statement, snapshot, &mut issues);

    dedup(issues)
}

fn check_tables(
    statement: &ParsedStatement,
    snapshot: &SchemaSnapshot,
    issues: &mut Vec<ValidationIssue>,
) {
    for table in &statement.tables {
        if snapshot.table(&table.name).is_none() {
            issues.push(ValidationIssue::new(
                IssueKind::UnknownTable,
                &table.name,
                format!("table '{}' does not exist", table.name),
            ));
        }
    }
}

fn check_columns(
    statement: &ParsedStatement,
    snapshot: &SchemaSnapshot,
    issues: &mut Vec<ValidationIssue>,
) {
    for column in &statement.columns {
        match &column.qualifier {
            Some(qualifier) => match statement.relation(qualifier, column.scope) {
                Relation::Table(table_ref) => {
                    // Unknown tables were reported already
                    let Some(table) = snapshot.table(&table_ref.name) else {
                        continue;
                    };
                    if !table.has_column(&column.name) {
                        issues.push(ValidationIssue::new(
                            IssueKind::UnknownColumn,
                            &column.name,
                            format!(
                                "column '{}' does not exist in table '{}'",
                                column.name, table.name
                            ),
                        ));
                    }
                }
                Relation::Derived(derived) => {
                    if !derived.may_own(&column.name) {
                        issues.push(ValidationIssue::new(
                            IssueKind::UnknownColumn,
                            &column.name,
                            format!(
                                "column '{}' does not exist in '{}'",
                                column.name, derived.name
                            ),
                        ));
                    }
                }
                Relation::Unknown => {
                    issues.push(ValidationIssue::new(
                        IssueKind::UnknownTable,
                        qualifier,
                        format!("'{qualifier}' is not a table or alias in this statement"),
                    ));
                }
            },
            None => {
                if statement.is_output_alias(&column.name, column.scope) {
                    continue;
                }
                let known: Vec<&TableSchema> = statement
                    .tables_in_reach(column.scope)
                    .filter_map(|t| snapshot.table(&t.name))
                    .collect();
                let derived: Vec<&DerivedRelation> =
                    statement.derived_in_reach(column.scope).collect();

                if known.iter().any(|t| t.has_column(&column.name))
                    || derived.iter().any(|d| d.may_own(&column.name))
                    || (known.is_empty() && derived.is_empty())
                {
                    continue;
                }

                let mut owners: Vec<&str> = Vec::new();
                let names = known
                    .iter()
                    .map(|t| t.name.as_str())
                    .chain(derived.iter().map(|d| d.name.as_str()));
                for name in names {
                    if !name.is_empty() && !owners.iter().any(|o| o.eq_ignore_ascii_case(name)) {
                        owners.push(name);
                    }
                }
                issues.push(ValidationIssue::new(
                    IssueKind::UnknownColumn,
                    &column.name,
                    format!(
                        "column '{}' does not exist in {}",
                        column.name,
                        describe_tables(&owners)
                    ),
                ));
            }
        }
    }
}

fn describe_tables(tables: &[&str]) -> String {
    match tables {
        [] => "any relation of this query".to_string(),
        [one] => format!("table '{one}'"),
        many => {
            let quoted: Vec<String> = many.iter().map(|t| format!("'{t}'")).collect();
            format!("tables {}", quoted.join(", "))
        }
    }
}

fn check_literals(
    statement: &ParsedStatement,
    snapshot: &SchemaSnapshot,
    issues: &mut Vec<ValidationIssue>,
) {
    for comparison in &statement.comparisons {
        if comparison.op == CompareOp::Like {
            continue;
        }
        let Some(column) = resolve_column(statement, snapshot, &comparison.column) else {
            continue;
        };
        if !clearly_mismatched(column.kind, &comparison.literal) {
            continue;
        }
        let verb = match comparison.site {
            Site::Filter => "compared with",
            Site::Assignment => "assigned",
        };
        issues.push(ValidationIssue::new(
            IssueKind::TypeMismatch,
            &comparison.column.name,
            format!(
                "column '{}' is {} but is {verb} {}",
                comparison.column.name, column.kind, comparison.literal
            ),
        ));
    }
}

/// Find the catalog column a reference points at, if it is unambiguous enough
fn resolve_column<'s>(
    statement: &ParsedStatement,
    snapshot: &'s SchemaSnapshot,
    column: &ColumnRef,
) -> Option<&'s ColumnSchema> {
    match &column.qualifier {
        Some(qualifier) => match statement.relation(qualifier, column.scope) {
            Relation::Table(table) => snapshot.table(&table.name)?.column(&column.name),
            Relation::Derived(_) | Relation::Unknown => None,
        },
        None => statement
            .tables_in_reach(column.scope)
            .filter_map(|t| snapshot.table(&t.name))
            .find_map(|t| t.column(&column.name)),
    }
}

/// Only flag literals that can never match the column's kind
fn clearly_mismatched(kind: ScalarKind, literal: &Literal) -> bool {
    match (kind, literal) {
        (k, Literal::Text(text)) if k.is_numeric() => text.trim().parse::<f64>().is_err(),
        (ScalarKind::Boolean, Literal::Text(text)) => !matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "false" | "t" | "f" | "yes" | "no" | "y" | "n" | "1" | "0" | "on" | "off"
        ),
        (ScalarKind::Boolean, Literal::Number(n)) => !matches!(n.as_str(), "0" | "1"),
        _ => false,
    }
}

fn dedup(issues: Vec<ValidationIssue>) -> Vec<ValidationIssue> {
    let mut seen = std::collections::HashSet::new();
    issues
        .into_iter()
        .filter(|issue| seen.insert((issue.kind, issue.identifier.to_lowercase())))
        .collect()
}
