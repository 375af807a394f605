//! Statement Extraction
//!
//! Turns SQL text into a [`ParsedStatement`]: the statement kind plus every table,
//! column, alias and literal comparison the later stages need. Extraction runs once
//! per candidate; the validator and advisor only read the result.
//!
//! The first statement is cut from the text with the `sqlparser` tokenizer, parsed
//! with [`Parser::parse_sql`] in the engine's dialect and then walked. Every query
//! body (the outer statement, a CTE, a derived table, an expression subquery) opens
//! a [`Scope`]. Column references remember the scope they appear in, so they are
//! resolved only against the relations visible from there. A CTE body does not see
//! the FROM clause of the query that defines it.

use std::ops::ControlFlow;

use serde::Serialize;
use sqlparser::ast::{
    AssignmentTarget, BinaryOperator, Delete, Expr, FromTable, GroupByExpr, Ident, Insert,
    JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableAlias, TableFactor, TableWithJoins, UnaryOperator, Value, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, TokenWithLocation, Tokenizer, TokenizerError};

use crate::engine::DatabaseType;
use crate::error::{AgentError, Result};

/// Scope of the outermost statement
pub const ROOT_SCOPE: usize = 0;

/// Statement kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatementKind {
    /// Row-returning read
    Read,
    /// Read with GROUP BY or an aggregate in the outer projection
    Aggregate,
    /// INSERT, REPLACE, or SELECT ... INTO
    Insert,
    Update,
    Delete,
    /// CREATE / ALTER / DROP / TRUNCATE / COMMENT
    Ddl,
    /// Anything else (SHOW, PRAGMA, GRANT, transaction control, ...)
    Other(String),
}

impl StatementKind {
    /// Whether the statement mutates data or schema
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Ddl)
    }

    /// Whether the statement produces a result set
    #[must_use]
    pub const fn returns_rows(&self) -> bool {
        matches!(self, Self::Read | Self::Aggregate)
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Aggregate => f.write_str("aggregate"),
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
            Self::Ddl => f.write_str("ddl"),
            Self::Other(keyword) => write!(f, "{}", keyword.to_lowercase()),
        }
    }
}

/// A real table named by the statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A CTE, subquery or table function in a FROM clause
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedRelation {
    /// Alias or CTE name; empty when the relation is unaliased
    pub name: String,

    /// Output columns, when every one of them has a plain name
    pub columns: Option<Vec<String>>,
}

impl DerivedRelation {
    /// Whether this relation could supply a column of the given name
    #[must_use]
    pub fn may_own(&self, column: &str) -> bool {
        self.columns
            .as_ref()
            .map_or(true, |columns| columns.iter().any(|c| c.eq_ignore_ascii_case(column)))
    }
}

/// Relations visible to the column references of one query body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Scope {
    /// Enclosing scope (correlated references resolve outwards)
    pub parent: Option<usize>,

    /// Indexes into [`ParsedStatement::tables`] of the real tables in FROM
    pub tables: Vec<usize>,

    /// Derived relations in FROM
    pub derived: Vec<DerivedRelation>,

    /// Select-list aliases (usable in ORDER BY / GROUP BY / HAVING)
    pub output_aliases: Vec<String>,
}

/// A column reference, optionally qualified by a table name or alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    pub name: String,

    /// Scope the reference appears in
    #[serde(skip)]
    pub scope: usize,
}

impl ColumnRef {
    /// Reference in the outermost scope
    pub fn new(qualifier: Option<&str>, name: impl Into<String>) -> Self {
        Self { qualifier: qualifier.map(str::to_string), name: name.into(), scope: ROOT_SCOPE }
    }

    fn from_parts(parts: &[Ident], scope: usize) -> Option<Self> {
        let (name, rest) = parts.split_last()?;
        Some(Self {
            qualifier: rest.last().map(|q| q.value.clone()),
            name: name.value.clone(),
            scope,
        })
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Literal value appearing opposite a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Literal {
    Number(String),
    Text(String),
    Boolean(bool),
    Null,
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => f.write_str(n),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Self::Null => f.write_str("NULL"),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
}

impl CompareOp {
    /// Operator with its operands swapped (`5 < a` is `a > 5`)
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt => Self::Lt,
            Self::GtEq => Self::LtEq,
            other => other,
        }
    }

    fn from_binary(op: &BinaryOperator) -> Option<Self> {
        Some(match op {
            BinaryOperator::Eq | BinaryOperator::Spaceship => Self::Eq,
            BinaryOperator::NotEq => Self::NotEq,
            BinaryOperator::Lt => Self::Lt,
            BinaryOperator::LtEq => Self::LtEq,
            BinaryOperator::Gt => Self::Gt,
            BinaryOperator::GtEq => Self::GtEq,
            _ => return None,
        })
    }
}

/// Where a column meets a literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Site {
    /// WHERE / ON / HAVING predicate
    Filter,
    /// UPDATE SET or INSERT VALUES position
    Assignment,
}

/// Column compared with (or assigned) a literal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub column: ColumnRef,
    pub op: CompareOp,
    pub literal: Literal,
    pub site: Site,
}

/// Column-equals-column predicate (explicit ON or implicit WHERE join)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinCondition {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

/// What a qualifier resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation<'a> {
    /// A real table (by alias or by name)
    Table(&'a TableRef),
    /// A CTE, subquery or table function
    Derived(&'a DerivedRelation),
    /// Nothing visible has this name
    Unknown,
}

/// Structured view of a single SQL statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedStatement {
    pub kind: StatementKind,

    /// Real tables, in order of appearance (the DML target comes first)
    pub tables: Vec<TableRef>,

    /// Query scopes; [`ROOT_SCOPE`] is the outer statement
    pub scopes: Vec<Scope>,

    /// Column references, in order of appearance
    pub columns: Vec<ColumnRef>,

    pub comparisons: Vec<Comparison>,
    pub joins: Vec<JoinCondition>,

    /// Outer projection is `*` or `t.*`
    pub select_star: bool,
    /// Outer statement has a WHERE clause
    pub has_where: bool,
    /// Outer statement has LIMIT / TOP / FETCH
    pub has_limit: bool,
    /// Outer statement has GROUP BY
    pub has_group_by: bool,
}

impl ParsedStatement {
    /// Parse exactly one statement
    ///
    /// Trailing segments after a `;` that do not parse as SQL are treated as
    /// commentary and dropped. Empty input, commentary-only input, unparseable SQL
    /// and more than one statement are translation errors.
    pub fn parse(sql: &str, engine: DatabaseType) -> Result<Self> {
        parse_first(sql, engine).map(|(_, statement)| statement)
    }

    fn empty(kind: StatementKind) -> Self {
        Self {
            kind,
            tables: Vec::new(),
            scopes: Vec::new(),
            columns: Vec::new(),
            comparisons: Vec::new(),
            joins: Vec::new(),
            select_star: false,
            has_where: false,
            has_limit: false,
            has_group_by: false,
        }
    }

    /// Scopes visible from `scope`, innermost first
    pub fn visible_scopes(&self, scope: usize) -> impl Iterator<Item = &Scope> + '_ {
        std::iter::successors(self.scopes.get(scope), move |s| {
            s.parent.and_then(|p| self.scopes.get(p))
        })
    }

    fn scope_tables<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a TableRef> + 'a {
        scope.tables.iter().filter_map(move |&i| self.tables.get(i))
    }

    /// Real tables visible from `scope`
    pub fn tables_in_reach(&self, scope: usize) -> impl Iterator<Item = &TableRef> + '_ {
        self.visible_scopes(scope).flat_map(move |s| self.scope_tables(s))
    }

    /// Derived relations visible from `scope`
    pub fn derived_in_reach(&self, scope: usize) -> impl Iterator<Item = &DerivedRelation> + '_ {
        self.visible_scopes(scope).flat_map(|s| s.derived.iter())
    }

    /// Real tables of the outer statement
    pub fn root_tables(&self) -> impl Iterator<Item = &TableRef> + '_ {
        self.scopes.first().into_iter().flat_map(move |s| self.scope_tables(s))
    }

    /// Resolve a column qualifier, innermost scope first
    ///
    /// Within a scope aliases win over derived names, which win over table names.
    #[must_use]
    pub fn relation(&self, qualifier: &str, scope: usize) -> Relation<'_> {
        for visible in self.visible_scopes(scope) {
            if let Some(table) = self
                .scope_tables(visible)
                .find(|t| t.alias.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(qualifier)))
            {
                return Relation::Table(table);
            }
            if let Some(derived) =
                visible.derived.iter().find(|d| d.name.eq_ignore_ascii_case(qualifier))
            {
                return Relation::Derived(derived);
            }
            if let Some(table) =
                self.scope_tables(visible).find(|t| t.name.eq_ignore_ascii_case(qualifier))
            {
                return Relation::Table(table);
            }
        }
        Relation::Unknown
    }

    /// Whether an unqualified name is a select-list alias of `scope`
    #[must_use]
    pub fn is_output_alias(&self, name: &str, scope: usize) -> bool {
        self.scopes
            .get(scope)
            .is_some_and(|s| s.output_aliases.iter().any(|a| a.eq_ignore_ascii_case(name)))
    }
}

/// A candidate SQL statement produced for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateQuery {
    /// SQL text as it will be executed
    pub sql: String,

    /// Identifiers and flags extracted from `sql`
    pub statement: ParsedStatement,

    /// Natural-language request this candidate answers
    pub request: String,

    /// Translation attempt that produced it (1-based)
    pub attempt: u32,
}

impl CandidateQuery {
    /// Parse SQL into a candidate
    pub fn new(
        sql: impl Into<String>,
        request: impl Into<String>,
        engine: DatabaseType,
        attempt: u32,
    ) -> Result<Self> {
        let sql = sql.into();
        let (text, statement) = parse_first(&sql, engine)?;
        Ok(Self { sql: text.to_string(), statement, request: request.into(), attempt })
    }

    #[must_use]
    pub const fn kind(&self) -> &StatementKind {
        &self.statement.kind
    }
}

// ---------------------------------------------------------------------------
// Splitting and parsing
// ---------------------------------------------------------------------------

fn dialect_for(engine: DatabaseType) -> Box<dyn Dialect> {
    match engine {
        DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Text between semicolons that holds at least one non-comment token
struct Segment<'a> {
    text: &'a str,
    /// Leading keyword, upper-cased (None when the segment starts with anything else)
    lead: Option<String>,
}

const STATEMENT_STARTERS: &[&str] = &[
    "ALTER", "ANALYZE", "ATTACH", "BEGIN", "CALL", "COMMENT", "COMMIT", "COPY", "CREATE",
    "DELETE", "DESC", "DESCRIBE", "DETACH", "DROP", "EXEC", "EXECUTE", "EXPLAIN", "GRANT",
    "INSERT", "LOCK", "MERGE", "PRAGMA", "REINDEX", "REPLACE", "REVOKE", "ROLLBACK",
    "SAVEPOINT", "SELECT", "SET", "SHOW", "TABLE", "TRUNCATE", "UPDATE", "USE", "VACUUM",
    "VALUES", "WITH",
];

/// Leading keywords that make a later segment count as a second statement when it parses.
/// SHOW / SET / USE are left out: prose like "Show me more" parses as SHOW.
const SECOND_STATEMENT_STARTERS: &[&str] = &[
    "ALTER", "CREATE", "DELETE", "DROP", "EXPLAIN", "GRANT", "INSERT", "MERGE", "PRAGMA",
    "REPLACE", "REVOKE", "SELECT", "TRUNCATE", "UPDATE", "VALUES", "WITH",
];

fn parse_first(sql: &str, engine: DatabaseType) -> Result<(&str, ParsedStatement)> {
    let mut segments = split(sql, engine)?.into_iter();

    let first = segments
        .next()
        .filter(|s| s.lead.as_deref().is_some_and(|k| STATEMENT_STARTERS.contains(&k)))
        .ok_or_else(|| AgentError::translation("no SQL statement found"))?;

    if segments.any(|s| is_second_statement(&s, engine)) {
        return Err(AgentError::translation(
            "multiple statements found; exactly one statement is allowed",
        ));
    }

    let statement = parse_one(first.text, engine)?;
    Ok((first.text, Walker::extract(&statement)))
}

fn is_second_statement(segment: &Segment<'_>, engine: DatabaseType) -> bool {
    segment.lead.as_deref().is_some_and(|k| SECOND_STATEMENT_STARTERS.contains(&k))
        && parse_one(segment.text, engine).is_ok()
}

/// Parse one segment, falling back to the generic dialect for syntax the engine
/// dialect does not cover (SQLite's REPLACE INTO, for one)
fn parse_one(text: &str, engine: DatabaseType) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&*dialect_for(engine), text)
        .or_else(|err| Parser::parse_sql(&GenericDialect {}, text).map_err(|_| err))
        .map_err(|e| AgentError::translation(format!("could not parse SQL: {e}")))?;

    match (statements.pop(), statements.is_empty()) {
        (Some(statement), true) => Ok(statement),
        (None, _) => Err(AgentError::translation("no SQL statement found")),
        (Some(_), false) => Err(AgentError::translation(
            "multiple statements found; exactly one statement is allowed",
        )),
    }
}

fn tokenize(
    sql: &str,
    engine: DatabaseType,
) -> std::result::Result<Vec<TokenWithLocation>, TokenizerError> {
    Tokenizer::new(&*dialect_for(engine), sql)
        .tokenize_with_location()
        .or_else(|_| Tokenizer::new(&GenericDialect {}, sql).tokenize_with_location())
}

fn split(sql: &str, engine: DatabaseType) -> Result<Vec<Segment<'_>>> {
    let (sql, tail) = match tokenize(sql, engine) {
        Ok(tokens) => return Ok(segments(sql, &tokens)),
        // Prose after the statement ("that won't ...") can leave a quote open
        Err(err) => {
            let cut =
                byte_offset(sql, err.location.line, err.location.column).unwrap_or(sql.len());
            let end = sql.get(..cut).and_then(|head| head.rfind(';')).ok_or_else(|| {
                AgentError::translation(format!("could not tokenize SQL: {err}"))
            })?;
            (&sql[..=end], sql.get(end + 1..).unwrap_or_default().trim())
        }
    };
    let tokens = tokenize(sql, engine)
        .map_err(|e| AgentError::translation(format!("could not tokenize SQL: {e}")))?;
    let mut segments = segments(sql, &tokens);
    if !tail.is_empty() {
        segments.push(Segment { text: tail, lead: None });
    }
    Ok(segments)
}

fn segments<'a>(sql: &'a str, tokens: &[TokenWithLocation]) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut start = 0;
    // Some(lead) once the current segment has content
    let mut lead: Option<Option<String>> = None;

    for token in tokens {
        match &token.token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => {
                let end = byte_offset(sql, token.location.line, token.location.column)
                    .unwrap_or(sql.len());
                if let Some(lead) = lead.take() {
                    let text = sql.get(start..end).unwrap_or_default().trim();
                    segments.push(Segment { text, lead });
                }
                start = (end + 1).min(sql.len());
            }
            Token::Word(word) if lead.is_none() => {
                let keyword = word.quote_style.is_none().then(|| word.value.to_ascii_uppercase());
                lead = Some(keyword);
            }
            _ => {
                if lead.is_none() {
                    lead = Some(None);
                }
            }
        }
    }
    if let Some(lead) = lead {
        segments.push(Segment { text: sql.get(start..).unwrap_or_default().trim(), lead });
    }
    segments
}

/// Byte offset of a 1-based line/column position
fn byte_offset(text: &str, line: u64, column: u64) -> Option<usize> {
    let line = usize::try_from(line).ok()?.checked_sub(1)?;
    let column = usize::try_from(column).ok()?.checked_sub(1)?;
    let start: usize = text.split_inclusive('\n').take(line).map(str::len).sum();
    let row = text.split_inclusive('\n').nth(line)?;
    row.char_indices().nth(column).map(|(b, _)| start + b)
}

// ---------------------------------------------------------------------------
// Walking
// ---------------------------------------------------------------------------

const AGGREGATES: &[&str] = &[
    "ARRAY_AGG", "AVG", "COUNT", "GROUP_CONCAT", "JSON_AGG", "MAX", "MIN", "STRING_AGG", "SUM",
    "TOTAL",
];

fn is_aggregate(name: &ObjectName) -> bool {
    name.0
        .last()
        .is_some_and(|ident| AGGREGATES.contains(&ident.value.to_ascii_uppercase().as_str()))
}

/// Column references and subqueries of one expression
///
/// Nested queries are cloned out at their outermost level and walked separately
/// so they get their own scope.
struct References {
    scope: usize,
    depth: usize,
    columns: Vec<ColumnRef>,
    subqueries: Vec<Query>,
    aggregate: bool,
}

impl References {
    const fn new(scope: usize) -> Self {
        Self { scope, depth: 0, columns: Vec::new(), subqueries: Vec::new(), aggregate: false }
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if self.depth == 0 {
            self.subqueries.push(query.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match expr {
            // INSERT ... VALUES (DEFAULT)
            Expr::Identifier(ident)
                if ident.quote_style.is_none() && ident.value.eq_ignore_ascii_case("DEFAULT") => {}
            Expr::Identifier(ident) => {
                self.columns.push(ColumnRef {
                    qualifier: None,
                    name: ident.value.clone(),
                    scope: self.scope,
                });
            }
            Expr::CompoundIdentifier(parts) => {
                self.columns.extend(ColumnRef::from_parts(parts, self.scope));
            }
            Expr::Function(function) if function.over.is_none() && is_aggregate(&function.name) => {
                self.aggregate = true;
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

enum Operand {
    Column(ColumnRef),
    Literal(Literal),
    Other,
}

fn operand(expr: &Expr, scope: usize) -> Operand {
    match expr {
        Expr::Identifier(ident) => Operand::Column(ColumnRef {
            qualifier: None,
            name: ident.value.clone(),
            scope,
        }),
        Expr::CompoundIdentifier(parts) => {
            ColumnRef::from_parts(parts, scope).map_or(Operand::Other, Operand::Column)
        }
        Expr::Value(value) => literal(value).map_or(Operand::Other, Operand::Literal),
        Expr::UnaryOp { op: UnaryOperator::Minus, expr } => match expr.as_ref() {
            Expr::Value(Value::Number(n, _)) => Operand::Literal(Literal::Number(format!("-{n}"))),
            _ => Operand::Other,
        },
        Expr::Nested(inner) => operand(inner, scope),
        _ => Operand::Other,
    }
}

fn literal(value: &Value) -> Option<Literal> {
    match value {
        Value::Number(n, _) => Some(Literal::Number(n.clone())),
        Value::SingleQuotedString(s)
        | Value::DoubleQuotedString(s)
        | Value::NationalStringLiteral(s)
        | Value::EscapedStringLiteral(s) => Some(Literal::Text(s.clone())),
        Value::Boolean(b) => Some(Literal::Boolean(*b)),
        Value::Null => Some(Literal::Null),
        _ => None,
    }
}

fn alias_columns(alias: &TableAlias) -> Option<Vec<String>> {
    (!alias.columns.is_empty()).then(|| alias.columns.iter().map(|c| c.value.clone()).collect())
}

/// Name a projection item gets when it is a bare column
fn output_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()),
        _ => None,
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c)
        | JoinOperator::AsOf { constraint: c, .. } => Some(c),
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

fn leading_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("STATEMENT")
        .to_ascii_uppercase()
}

struct Walker {
    out: ParsedStatement,
    /// CTEs in lexical reach, innermost last
    ctes: Vec<DerivedRelation>,
    aggregate: bool,
    nested_write: Option<StatementKind>,
    select_into: bool,
}

impl Walker {
    fn extract(statement: &Statement) -> ParsedStatement {
        let mut walker = Self {
            out: ParsedStatement::empty(StatementKind::Read),
            ctes: Vec::new(),
            aggregate: false,
            nested_write: None,
            select_into: false,
        };
        let kind = walker.statement(statement);
        walker.out.kind = kind;
        walker.out
    }

    fn statement(&mut self, statement: &Statement) -> StatementKind {
        match statement {
            Statement::Query(query) => {
                self.query(query, None);
                if self.select_into {
                    StatementKind::Insert
                } else if let Some(kind) = self.nested_write.take() {
                    kind
                } else if self.out.has_group_by || self.aggregate {
                    StatementKind::Aggregate
                } else {
                    StatementKind::Read
                }
            }
            Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_) => {
                self.write(statement, None)
            }
            Statement::Explain { statement, .. } => self.statement(statement),
            Statement::CreateTable(_)
            | Statement::CreateIndex(_)
            | Statement::CreateView { .. }
            | Statement::CreateVirtualTable { .. }
            | Statement::CreateSchema { .. }
            | Statement::CreateDatabase { .. }
            | Statement::CreateSequence { .. }
            | Statement::CreateType { .. }
            | Statement::CreateFunction { .. }
            | Statement::CreateTrigger { .. }
            | Statement::CreateProcedure { .. }
            | Statement::AlterTable { .. }
            | Statement::AlterIndex { .. }
            | Statement::AlterView { .. }
            | Statement::Drop { .. }
            | Statement::DropFunction { .. }
            | Statement::DropProcedure { .. }
            | Statement::DropTrigger { .. }
            | Statement::Truncate { .. }
            | Statement::Comment { .. } => StatementKind::Ddl,
            other => StatementKind::Other(leading_keyword(other)),
        }
    }

    fn open_scope(&mut self, parent: Option<usize>) -> usize {
        self.out.scopes.push(Scope { parent, ..Scope::default() });
        self.out.scopes.len() - 1
    }

    fn scope_mut(&mut self, scope: usize) -> &mut Scope {
        &mut self.out.scopes[scope]
    }

    /// Walk a query in a new scope and return its output column names
    fn query(&mut self, query: &Query, parent: Option<usize>) -> Option<Vec<String>> {
        let scope = self.open_scope(parent);

        let mark = self.ctes.len();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.clone();
                let declared = alias_columns(&cte.alias);
                // Registered first so a recursive CTE can name itself
                self.ctes.push(DerivedRelation { name, columns: declared.clone() });
                let produced = self.query(&cte.query, parent);
                if let Some(entry) = self.ctes.last_mut() {
                    entry.columns = declared.or(produced);
                }
            }
        }

        let columns = self.set_expr(&query.body, scope);

        if let Some(order_by) = &query.order_by {
            for item in &order_by.exprs {
                self.expr(&item.expr, scope);
            }
        }
        if scope == ROOT_SCOPE && (query.limit.is_some() || query.fetch.is_some()) {
            self.out.has_limit = true;
        }
        self.ctes.truncate(mark);
        columns
    }

    fn set_expr(&mut self, body: &SetExpr, scope: usize) -> Option<Vec<String>> {
        match body {
            SetExpr::Select(select) => self.select(select, scope),
            SetExpr::Query(query) => self.query(query, Some(scope)),
            SetExpr::SetOperation { left, right, .. } => {
                let columns = self.set_expr(left, scope);
                self.set_expr(right, scope);
                columns
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for value in row {
                        self.expr(value, scope);
                    }
                }
                None
            }
            SetExpr::Insert(statement) | SetExpr::Update(statement) => {
                let kind = self.write(statement, Some(scope));
                self.nested_write.get_or_insert(kind);
                None
            }
            SetExpr::Table(table) => {
                if let Some(name) = &table.table_name {
                    let name = ObjectName(vec![Ident::new(name.clone())]);
                    self.add_table(&name, None, scope);
                }
                None
            }
        }
    }

    /// INSERT / UPDATE / DELETE, at the top level or inside a CTE body
    fn write(&mut self, statement: &Statement, parent: Option<usize>) -> StatementKind {
        let scope = self.open_scope(parent);
        match statement {
            Statement::Insert(insert) => {
                self.insert(insert, scope);
                StatementKind::Insert
            }
            Statement::Update { table, assignments, from, selection, returning, .. } => {
                self.table_with_joins(table, scope);
                if let Some(from) = from {
                    self.table_with_joins(from, scope);
                }
                self.assignments(assignments, scope);
                if let Some(selection) = selection {
                    self.where_clause(selection, scope);
                }
                if let Some(returning) = returning {
                    self.items(returning, scope);
                }
                StatementKind::Update
            }
            Statement::Delete(delete) => {
                self.delete(delete, scope);
                StatementKind::Delete
            }
            other => StatementKind::Other(leading_keyword(other)),
        }
    }

    fn select(&mut self, select: &Select, scope: usize) -> Option<Vec<String>> {
        let root = scope == ROOT_SCOPE;
        if select.into.is_some() {
            self.select_into = true;
        }
        if root && select.top.is_some() {
            self.out.has_limit = true;
        }

        // FROM first so every relation of the scope is known
        for from in &select.from {
            self.table_with_joins(from, scope);
        }

        let mut columns = Some(Vec::new());
        for item in &select.projection {
            let name = match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.projection(expr, scope);
                    output_name(expr)
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.projection(expr, scope);
                    self.scope_mut(scope).output_aliases.push(alias.value.clone());
                    Some(alias.value.clone())
                }
                SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(_) => {
                    if root {
                        self.out.select_star = true;
                    }
                    None
                }
            };
            match (name, columns.as_mut()) {
                (Some(name), Some(names)) => names.push(name),
                (None, _) => columns = None,
                (Some(_), None) => {}
            }
        }

        if let Some(selection) = &select.selection {
            self.where_clause(selection, scope);
        }
        match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => {
                if root && !exprs.is_empty() {
                    self.out.has_group_by = true;
                }
                for expr in exprs {
                    self.expr(expr, scope);
                }
            }
            GroupByExpr::All(_) => {
                if root {
                    self.out.has_group_by = true;
                }
            }
        }
        if let Some(having) = &select.having {
            self.filter(having, scope);
        }
        columns
    }

    fn projection(&mut self, expr: &Expr, scope: usize) {
        if self.expr(expr, scope) && scope == ROOT_SCOPE {
            self.aggregate = true;
        }
    }

    fn items(&mut self, items: &[SelectItem], scope: usize) {
        for item in items {
            if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
                self.expr(expr, scope);
            }
        }
    }

    fn table_with_joins(&mut self, from: &TableWithJoins, scope: usize) {
        self.table_factor(&from.relation, scope);
        for join in &from.joins {
            self.table_factor(&join.relation, scope);
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(expr)) => self.filter(expr, scope),
                Some(JoinConstraint::Using(names)) => {
                    for name in names {
                        self.out.columns.push(ColumnRef {
                            qualifier: None,
                            name: name.value.clone(),
                            scope,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    fn table_factor(&mut self, factor: &TableFactor, scope: usize) {
        match factor {
            TableFactor::Table { name, alias, args: None, .. } => {
                self.add_table(name, alias.as_ref(), scope);
            }
            // Table-valued function call
            TableFactor::Table { alias, .. } => self.add_derived(alias.as_ref(), None, scope),
            TableFactor::Derived { subquery, alias, .. } => {
                let columns = self.query(subquery, Some(scope));
                self.add_derived(alias.as_ref(), columns, scope);
            }
            TableFactor::NestedJoin { table_with_joins, alias } => {
                self.table_with_joins(table_with_joins, scope);
                if alias.is_some() {
                    self.add_derived(alias.as_ref(), None, scope);
                }
            }
            TableFactor::Pivot { table, alias, .. }
            | TableFactor::Unpivot { table, alias, .. }
            | TableFactor::MatchRecognize { table, alias, .. } => {
                self.table_factor(table, scope);
                self.add_derived(alias.as_ref(), None, scope);
            }
            TableFactor::TableFunction { alias, .. }
            | TableFactor::Function { alias, .. }
            | TableFactor::UNNEST { alias, .. }
            | TableFactor::JsonTable { alias, .. } => self.add_derived(alias.as_ref(), None, scope),
        }
    }

    /// Columns of the innermost CTE with this name
    fn cte(&self, name: &str) -> Option<Option<Vec<String>>> {
        self.ctes
            .iter()
            .rev()
            .find(|cte| cte.name.eq_ignore_ascii_case(name))
            .map(|cte| cte.columns.clone())
    }

    fn add_table(&mut self, name: &ObjectName, alias: Option<&TableAlias>, scope: usize) {
        let Some(last) = name.0.last() else {
            return;
        };
        if name.0.len() == 1 {
            if let Some(columns) = self.cte(&last.value) {
                let columns = alias.and_then(alias_columns).or(columns);
                let name = alias.map_or_else(|| last.value.clone(), |a| a.name.value.clone());
                self.scope_mut(scope).derived.push(DerivedRelation { name, columns });
                return;
            }
        }
        self.out.tables.push(TableRef {
            name: last.value.clone(),
            alias: alias.map(|a| a.name.value.clone()),
        });
        let index = self.out.tables.len() - 1;
        self.scope_mut(scope).tables.push(index);
    }

    fn add_derived(
        &mut self,
        alias: Option<&TableAlias>,
        columns: Option<Vec<String>>,
        scope: usize,
    ) {
        let name = alias.map(|a| a.name.value.clone()).unwrap_or_default();
        let columns = alias.and_then(alias_columns).or(columns);
        self.scope_mut(scope).derived.push(DerivedRelation { name, columns });
    }

    fn insert(&mut self, insert: &Insert, scope: usize) {
        let Some(target) = insert.table_name.0.last().map(|t| t.value.clone()) else {
            return;
        };
        self.out.tables.push(TableRef {
            name: target.clone(),
            alias: insert.table_alias.as_ref().map(|a| a.value.clone()),
        });
        let index = self.out.tables.len() - 1;
        self.scope_mut(scope).tables.push(index);

        let column = |name: &Ident| ColumnRef {
            qualifier: Some(target.clone()),
            name: name.value.clone(),
            scope,
        };
        self.out.columns.extend(insert.columns.iter().map(column));

        if let Some(source) = &insert.source {
            match source.body.as_ref() {
                SetExpr::Values(values) if source.with.is_none() => {
                    for row in &values.rows {
                        for (position, value) in row.iter().enumerate() {
                            self.expr(value, scope);
                            let Some(name) = insert.columns.get(position) else {
                                continue;
                            };
                            if let Operand::Literal(literal) = operand(value, scope) {
                                if literal != Literal::Null {
                                    self.out.comparisons.push(Comparison {
                                        column: column(name),
                                        op: CompareOp::Eq,
                                        literal,
                                        site: Site::Assignment,
                                    });
                                }
                            }
                        }
                    }
                }
                _ => {
                    self.query(source, Some(scope));
                }
            }
        }
        if let Some(returning) = &insert.returning {
            self.items(returning, scope);
        }
    }

    fn assignments(&mut self, assignments: &[sqlparser::ast::Assignment], scope: usize) {
        for assignment in assignments {
            self.expr(&assignment.value, scope);
            match &assignment.target {
                AssignmentTarget::ColumnName(name) => {
                    let Some(column) = ColumnRef::from_parts(&name.0, scope) else {
                        continue;
                    };
                    if let Operand::Literal(literal) = operand(&assignment.value, scope) {
                        if literal != Literal::Null {
                            self.out.comparisons.push(Comparison {
                                column: column.clone(),
                                op: CompareOp::Eq,
                                literal,
                                site: Site::Assignment,
                            });
                        }
                    }
                    self.out.columns.push(column);
                }
                AssignmentTarget::Tuple(names) => {
                    self.out
                        .columns
                        .extend(names.iter().filter_map(|n| ColumnRef::from_parts(&n.0, scope)));
                }
            }
        }
    }

    fn delete(&mut self, delete: &Delete, scope: usize) {
        let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) = &delete.from;
        for table in from {
            self.table_with_joins(table, scope);
        }
        for table in delete.using.iter().flatten() {
            self.table_with_joins(table, scope);
        }
        if let Some(selection) = &delete.selection {
            self.where_clause(selection, scope);
        }
        if let Some(returning) = &delete.returning {
            self.items(returning, scope);
        }
        for item in &delete.order_by {
            self.expr(&item.expr, scope);
        }
        if scope == ROOT_SCOPE && delete.limit.is_some() {
            self.out.has_limit = true;
        }
    }

    fn where_clause(&mut self, selection: &Expr, scope: usize) {
        if scope == ROOT_SCOPE {
            self.out.has_where = true;
        }
        self.filter(selection, scope);
    }

    /// Record references, then walk nested queries in child scopes.
    /// Returns whether the expression calls an aggregate outside a window.
    fn expr(&mut self, expr: &Expr, scope: usize) -> bool {
        let mut references = References::new(scope);
        let _ = expr.visit(&mut references);
        self.out.columns.append(&mut references.columns);
        for subquery in &references.subqueries {
            self.query(subquery, Some(scope));
        }
        references.aggregate
    }

    fn filter(&mut self, expr: &Expr, scope: usize) {
        self.expr(expr, scope);
        self.predicate(expr, scope);
    }

    fn predicate(&mut self, expr: &Expr, scope: usize) {
        match expr {
            Expr::BinaryOp { left, op: BinaryOperator::And | BinaryOperator::Or, right } => {
                self.predicate(left, scope);
                self.predicate(right, scope);
            }
            Expr::Nested(inner) | Expr::UnaryOp { op: UnaryOperator::Not, expr: inner } => {
                self.predicate(inner, scope);
            }
            Expr::BinaryOp { left, op, right } => {
                if let Some(op) = CompareOp::from_binary(op) {
                    self.compare(left, op, right, scope);
                }
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.compare(expr, CompareOp::Like, pattern, scope);
            }
            _ => {}
        }
    }

    fn compare(&mut self, left: &Expr, op: CompareOp, right: &Expr, scope: usize) {
        match (operand(left, scope), operand(right, scope)) {
            (Operand::Column(column), Operand::Literal(literal)) if literal != Literal::Null => {
                self.out.comparisons.push(Comparison { column, op, literal, site: Site::Filter });
            }
            (Operand::Literal(literal), Operand::Column(column)) if literal != Literal::Null => {
                self.out.comparisons.push(Comparison {
                    column,
                    op: op.flipped(),
                    literal,
                    site: Site::Filter,
                });
            }
            (Operand::Column(left), Operand::Column(right)) if op == CompareOp::Eq => {
                self.out.joins.push(JoinCondition { left, right });
            }
            _ => {}
        }
    }
}
