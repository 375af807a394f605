//! Natural-Language Translation
//!
//! Turns a request plus schema context into a [`CandidateQuery`].
//!
//! The translator owns three things and delegates the rest:
//! - **Context windowing**: tables are ranked by plain word overlap with the
//!   request (and with earlier failed attempts) and rendered until the size
//!   budget runs out. No semantic ranking, so the choice is reproducible.
//! - **Prompt construction**: fixed instructions, schema context, prior attempts
//!   with the issues they raised, then the request.
//! - **Output parsing**: the SQL is cut out of whatever commentary surrounds it.
//!   More than one candidate statement is an error, never a guess.
//!
//! Text generation itself sits behind the [`TextGenerator`] trait.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{SchemaSnapshot, TableSchema};
use crate::engine::DatabaseType;
use crate::error::{AgentError, Result};
use crate::statement::CandidateQuery;
use crate::validator::ValidationIssue;

/// Text-completion capability (`complete(prompt) -> text`)
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// One round-trip, no streaming
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Name used in logs
    fn name(&self) -> &str {
        "text-generator"
    }
}

/// A previous translation attempt for the same request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorAttempt {
    /// SQL that was produced, if any
    pub sql: Option<String>,

    /// Issues the validator raised against it
    pub issues: Vec<ValidationIssue>,

    /// Why no SQL could be extracted, if that was the problem
    pub error: Option<String>,
}

/// Translator settings
#[derive(Debug, Clone, Copy)]
pub struct TranslatorSettings {
    /// Dialect the SQL must be written in
    pub dialect: DatabaseType,

    /// Maximum characters of schema context in the prompt
    pub context_budget: usize,

    /// Timeout for one `complete` call
    pub timeout: Option<Duration>,

    /// Whether the prompt may ask for writes
    pub allow_writes: bool,
}

impl TranslatorSettings {
    #[must_use]
    pub const fn new(dialect: DatabaseType) -> Self {
        Self {
            dialect,
            context_budget: 6000,
            timeout: Some(Duration::from_secs(30)),
            allow_writes: false,
        }
    }
}

/// Query translator
pub struct QueryTranslator {
    generator: Arc<dyn TextGenerator>,
    settings: TranslatorSettings,
}

impl QueryTranslator {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: TranslatorSettings) -> Self {
        Self { generator, settings }
    }

    #[must_use]
    pub const fn settings(&self) -> &TranslatorSettings {
        &self.settings
    }

    /// Produce a candidate statement for a request
    ///
    /// The attempt number is `prior.len() + 1`.
    pub async fn translate(
        &self,
        request: &str,
        snapshot: &SchemaSnapshot,
        prior: &[PriorAttempt],
    ) -> Result<CandidateQuery> {
        let attempt = u32::try_from(prior.len() + 1).unwrap_or(u32::MAX);
        let prompt = self.build_prompt(request, snapshot, prior);
        let started = Instant::now();

        let completion = match self.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, self.generator.complete(&prompt))
                .await
                .map_err(|_| AgentError::TranslationTimeout(duration_ms(limit)))??,
            None => self.generator.complete(&prompt).await?,
        };

        tracing::debug!(
            generator = self.generator.name(),
            attempt,
            prompt_chars = prompt.len(),
            elapsed_ms = duration_ms(started.elapsed()),
            "completion received"
        );

        let sql = extract_sql(&completion)?;
        CandidateQuery::new(sql, request, self.settings.dialect, attempt)
    }

    /// Render the full prompt
    #[must_use]
    pub fn build_prompt(
        &self,
        request: &str,
        snapshot: &SchemaSnapshot,
        prior: &[PriorAttempt],
    ) -> String {
        let dialect = self.settings.dialect.dialect_name();
        let context = select_context(request, snapshot, prior, self.settings.context_budget);

        let mut prompt = String::new();
        let _ = writeln!(prompt, "You translate requests into a single {dialect} SQL statement.");
        prompt.push_str("Rules:\n");
        prompt.push_str("- Use only the tables and columns listed in the schema below.\n");
        prompt.push_str("- Reply with exactly one statement inside a ```sql code block.\n");
        prompt.push_str(
            "- Do not invent columns; if something is missing, use the closest listed one.\n",
        );
        let _ = writeln!(prompt, "- The statement must be valid {dialect} syntax.");
        if self.settings.allow_writes {
            prompt.push_str(
                "- INSERT, UPDATE and DELETE are permitted when the request asks for them.\n",
            );
        } else {
            prompt.push_str(
                "- The database is read-only: write a SELECT. Never modify data or schema.\n",
            );
        }

        let _ = writeln!(prompt, "\nSchema ({}):", snapshot.database);
        prompt.push_str(&context.rendered);
        if context.omitted > 0 {
            let _ = writeln!(
                prompt,
                "({} more table{} not shown)",
                context.omitted,
                if context.omitted == 1 { "" } else { "s" }
            );
        }

        if !prior.is_empty() {
            prompt.push_str("\nEarlier attempts were rejected:\n");
            for (i, attempt) in prior.iter().enumerate() {
                let _ = writeln!(prompt, "Attempt {}:", i + 1);
                if let Some(sql) = &attempt.sql {
                    let _ = writeln!(prompt, "```sql\n{}\n```", sql.trim());
                }
                if let Some(error) = &attempt.error {
                    let _ = writeln!(prompt, "- {error}");
                }
                for issue in &attempt.issues {
                    let _ = writeln!(prompt, "- {}: {}", issue.kind, issue.message);
                }
            }
            prompt.push_str("Fix every problem listed above.\n");
        }

        let _ = write!(prompt, "\nRequest: {}\n", request.trim());
        prompt
    }
}

/// Schema context chosen for one prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaContext {
    /// Rendered table descriptions
    pub rendered: String,
    /// Tables included, in rank order
    pub included: Vec<String>,
    /// Tables left out for lack of budget
    pub omitted: usize,
}

/// Rank tables by overlap with the request and render them within a budget
///
/// Table-name matches weigh 3, column-name matches 1, and identifiers mentioned by
/// prior attempts add 2 per table and 1 per column. Ties go to the table name. The
/// first table is always included even if it alone exceeds the budget.
#[must_use]
pub fn select_context(
    request: &str,
    snapshot: &SchemaSnapshot,
    prior: &[PriorAttempt],
    budget: usize,
) -> SchemaContext {
    let request_words = words(request);
    let prior_words: HashSet<String> = prior
        .iter()
        .flat_map(|p| {
            p.sql
                .iter()
                .map(String::as_str)
                .chain(p.issues.iter().flat_map(|i| [i.identifier.as_str(), i.message.as_str()]))
                .flat_map(words)
                .collect::<Vec<_>>()
        })
        .collect();

    let mut ranked: Vec<(u32, &TableSchema)> = snapshot
        .tables()
        .map(|table| (score(table, &request_words, &prior_words), table))
        .collect();
    ranked.sort_by(|(sa, ta), (sb, tb)| sb.cmp(sa).then_with(|| ta.name.cmp(&tb.name)));

    let mut rendered = String::new();
    let mut included = Vec::new();
    for (_, table) in &ranked {
        let block = render_table(table);
        if !included.is_empty() && rendered.len() + block.len() > budget {
            break;
        }
        rendered.push_str(&block);
        included.push(table.name.clone());
    }

    SchemaContext { omitted: ranked.len() - included.len(), rendered, included }
}

fn score(table: &TableSchema, request: &HashSet<String>, prior: &HashSet<String>) -> u32 {
    let mut score = 0;
    if matches_name(&table.name, request) {
        score += 3;
    }
    if matches_name(&table.name, prior) {
        score += 2;
    }
    for column in &table.columns {
        if matches_name(&column.name, request) {
            score += 1;
        }
        if matches_name(&column.name, prior) {
            score += 1;
        }
    }
    score
}

/// Whole-name match, or a match on every `_`-separated part
fn matches_name(name: &str, words: &HashSet<String>) -> bool {
    let lower = name.to_lowercase();
    if words.contains(&lower) || words.contains(&singular(&lower)) {
        return true;
    }
    let parts: Vec<&str> = lower.split('_').filter(|p| !p.is_empty()).collect();
    parts.len() > 1 && parts.iter().all(|p| words.contains(*p) || words.contains(&singular(p)))
}

/// Lower-cased words with naive singular forms added
fn words(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        let word = word.to_lowercase();
        if word.len() < 2 {
            continue;
        }
        out.insert(singular(&word));
        for part in word.split('_').filter(|p| p.len() >= 2) {
            out.insert(singular(part));
            out.insert(part.to_string());
        }
        out.insert(word);
    }
    out
}

fn singular(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{stem}y")
    } else if let Some(stem) = word.strip_suffix("sses") {
        format!("{stem}ss")
    } else if word.ends_with("ss") || word.ends_with("us") {
        word.to_string()
    } else if let Some(stem) = word.strip_suffix('s') {
        stem.to_string()
    } else {
        word.to_string()
    }
}

fn render_table(table: &TableSchema) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut col = format!("{} {}", c.name, c.declared_type);
            if table.is_primary_key(&c.name) {
                col.push_str(" PRIMARY KEY");
            } else if !c.nullable {
                col.push_str(" NOT NULL");
            }
            col
        })
        .collect();

    let mut block = format!("- {}({})", table.name, columns.join(", "));
    if let Some(rows) = table.row_count {
        let _ = write!(block, " -- ~{rows} rows");
    }
    block.push('\n');
    for fk in &table.foreign_keys {
        let _ = writeln!(
            block,
            "    {}.{} references {}.{}",
            table.name, fk.column, fk.referenced_table, fk.referenced_column
        );
    }
    block
}

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("valid fenced block regex")
});

static SQL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)^\s*(?:",
        r"(?:select|insert|update|delete|replace|create|alter|drop|truncate|explain|pragma|",
        r"merge)\b",
        r"|values\s*\(",
        r"|with\s+(?:recursive\s+)?[a-z_][a-z0-9_]*\s*(?:\(|as\b))",
    ))
    .expect("valid SQL line regex")
});

/// Lines that can only continue a statement, never start one
static CLAUSE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)^\s*(?:(?:",
        r"where|and|or|order|group|having|limit|offset|fetch|inner|left|right|full|cross|",
        r"natural|join|on|using|set|from|values|union|intersect|except|returning",
        r")\b|[);])",
    ))
    .expect("valid clause line regex")
});

/// Cut the SQL statement out of model output
///
/// A single fenced block that starts with SQL wins. Otherwise the text runs from the
/// first line that starts with a SQL keyword to the first blank line that is not
/// followed by a continuing clause (`WHERE`, `ORDER BY`, ...). A second statement
/// anywhere else in the output (another SQL block, or SQL outside the chosen one) is
/// an error.
pub fn extract_sql(output: &str) -> Result<String> {
    let blocks: Vec<&str> = FENCED_BLOCK
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|b| SQL_LINE.is_match(b))
        .collect();

    match blocks.as_slice() {
        [one] => {
            let outside = FENCED_BLOCK.replace_all(output, "\n");
            let lines: Vec<&str> = outside.lines().collect();
            if contains_statement(&lines) {
                return Err(AgentError::translation(
                    "model returned SQL outside the code block as well; expected exactly one \
                     statement",
                ));
            }
            return Ok((*one).to_string());
        }
        [] => {}
        _ => {
            return Err(AgentError::translation(format!(
                "model returned {} SQL blocks; expected exactly one",
                blocks.len()
            )))
        }
    }

    let lines: Vec<&str> =
        output.lines().filter(|l| !l.trim_start().starts_with("```")).collect();
    let Some(start) = lines.iter().position(|l| SQL_LINE.is_match(l)) else {
        return Err(AgentError::translation("no SQL statement found in model output"));
    };
    let end = statement_end(&lines, start);

    if contains_statement(&lines[end..]) {
        return Err(AgentError::translation(
            "model returned more than one SQL statement; expected exactly one",
        ));
    }

    Ok(lines[start..end].join("\n").trim().to_string())
}

/// End (exclusive) of the statement starting at `start`
///
/// A blank line ends it unless the next paragraph opens with a clause keyword and
/// the statement still parses with that paragraph attached.
fn statement_end(lines: &[&str], start: usize) -> usize {
    let mut end = start;
    let mut i = start;
    while i < lines.len() {
        if !lines[i].trim().is_empty() {
            i += 1;
            end = i;
            continue;
        }
        let Some(next) = lines[i..].iter().position(|l| !l.trim().is_empty()).map(|o| i + o)
        else {
            break;
        };
        let paragraph_end = paragraph_end(lines, next);
        if !CLAUSE_LINE.is_match(lines[next]) || !parses(&lines[start..paragraph_end].join("\n"))
        {
            break;
        }
        i = next;
    }
    end
}

fn paragraph_end(lines: &[&str], from: usize) -> usize {
    lines[from..].iter().position(|l| l.trim().is_empty()).map_or(lines.len(), |o| from + o)
}

/// Whether any SQL-looking paragraph in `lines` is a complete statement
fn contains_statement(lines: &[&str]) -> bool {
    lines.iter().enumerate().any(|(at, line)| {
        SQL_LINE.is_match(line) && parses(&lines[at..paragraph_end(lines, at)].join("\n"))
    })
}

fn parses(text: &str) -> bool {
    Parser::parse_sql(&GenericDialect {}, text).is_ok_and(|statements| !statements.is_empty())
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnSchema, ForeignKey};
    use crate::statement::StatementKind;
    use crate::validator::IssueKind;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned completions and records the prompts it saw
    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
                delay: None,
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::generation("no reply")))
        }
    }

    fn snapshot() -> SchemaSnapshot {
        let mut orders = TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "INTEGER", false),
                ColumnSchema::new("customer_id", "INTEGER", false),
                ColumnSchema::new("total", "REAL", false),
            ],
        );
        orders.primary_key.insert("id".to_string());
        orders.foreign_keys.push(ForeignKey {
            column: "customer_id".to_string(),
            referenced_table: "customers".to_string(),
            referenced_column: "id".to_string(),
        });
        SchemaSnapshot::new(
            "shop",
            vec![
                TableSchema::new(
                    "customers",
                    vec![
                        ColumnSchema::new("id", "INTEGER", false),
                        ColumnSchema::new("name", "TEXT", false),
                        ColumnSchema::new("country", "TEXT", true),
                    ],
                ),
                orders,
                TableSchema::new("audit_log", vec![ColumnSchema::new("entry", "TEXT", true)]),
            ],
        )
    }

    fn translator(generator: Arc<Scripted>) -> QueryTranslator {
        QueryTranslator::new(generator, TranslatorSettings::new(DatabaseType::SQLite))
    }

    #[test]
    fn test_extract_from_fenced_block() {
        let output = "Here you go:\n```sql\nSELECT * FROM customers\n\
                      WHERE country = 'France';\n```\nThis lists French customers.";
        assert_eq!(
            extract_sql(output).unwrap(),
            "SELECT * FROM customers\nWHERE country = 'France';"
        );
    }

    #[test]
    fn test_extract_ignores_non_sql_blocks() {
        let output = "```sql\nSELECT 1\n```\nExample output:\n```\n| 1 |\n```";
        assert_eq!(extract_sql(output).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_extract_bare_sql_with_commentary() {
        let output = "Sure.\nSELECT name\nFROM customers\n\nThis returns all names.";
        assert_eq!(extract_sql(output).unwrap(), "SELECT name\nFROM customers");

        let output = "with recent as (select * from orders) select * from recent";
        assert!(extract_sql(output).unwrap().starts_with("with recent"));
    }

    #[test]
    fn test_extract_keeps_clauses_after_blank_lines() {
        let output = "DELETE FROM users\n\nWHERE id = 1";
        assert_eq!(extract_sql(output).unwrap(), output);

        let output = "SELECT name\nFROM customers\n\nWHERE country = 'France'\n\n\
                      ORDER BY name\n\nThis sorts French customers by name.";
        assert_eq!(
            extract_sql(output).unwrap(),
            "SELECT name\nFROM customers\n\nWHERE country = 'France'\n\nORDER BY name"
        );

        // Prose that happens to open with a clause word is not pulled in
        let output = "SELECT name FROM customers\n\nFrom here you can filter by country.";
        assert_eq!(extract_sql(output).unwrap(), "SELECT name FROM customers");
    }

    #[test]
    fn test_extract_rejects_sql_outside_single_block() {
        let output = "```sql\nSELECT 1\n```\nAlternatively:\nSELECT 2";
        let err = extract_sql(output).unwrap_err();
        assert!(err.is_repairable());
        assert!(err.message().contains("outside the code block"));

        // Prose starting with a SQL word is fine
        let output = "```sql\nSELECT id FROM orders\n```\nSelect the rows you need.";
        assert_eq!(extract_sql(output).unwrap(), "SELECT id FROM orders");
    }

    #[test]
    fn test_extract_rejects_multiple_candidates() {
        let output = "```sql\nSELECT 1\n```\nor\n```sql\nSELECT 2\n```";
        assert!(extract_sql(output).unwrap_err().message().contains("2 SQL blocks"));

        let output = "SELECT 1\n\nAlternatively:\nSELECT 2";
        assert!(extract_sql(output).unwrap_err().is_repairable());
    }

    #[test]
    fn test_extract_without_sql() {
        let err = extract_sql("I'm not sure which table holds that.").unwrap_err();
        assert!(matches!(err, AgentError::Translation(_)));
    }

    #[test]
    fn test_context_ranks_by_overlap() {
        let context = select_context("total of orders per customer", &snapshot(), &[], 10_000);
        assert_eq!(context.included, vec!["orders", "customers", "audit_log"]);
        assert_eq!(context.omitted, 0);
        assert!(context.rendered.contains("orders.customer_id references customers.id"));
        assert!(context.rendered.contains("id INTEGER PRIMARY KEY"));
    }

    #[test]
    fn test_context_respects_budget_but_keeps_first_table() {
        let context = select_context("customers from France", &snapshot(), &[], 1);
        assert_eq!(context.included, vec!["customers"]);
        assert_eq!(context.omitted, 2);
    }

    #[test]
    fn test_prior_attempts_boost_tables() {
        let prior = vec![PriorAttempt {
            sql: Some("SELECT entry FROM audit_log".to_string()),
            issues: Vec::new(),
            error: None,
        }];
        let context = select_context("show everything", &snapshot(), &prior, 10_000);
        assert_eq!(context.included[0], "audit_log");
    }

    #[test]
    fn test_singular_forms() {
        assert_eq!(singular("customers"), "customer");
        assert_eq!(singular("categories"), "category");
        assert_eq!(singular("status"), "status");
        assert_eq!(singular("addresses"), "address");
    }

    #[tokio::test]
    async fn test_translate_produces_candidate() {
        let generator = Scripted::new(vec![Ok(
            "```sql\nSELECT * FROM customers WHERE country = 'France'\n```".to_string(),
        )]);
        let candidate = translator(generator.clone())
            .translate("show all customers from France", &snapshot(), &[])
            .await
            .unwrap();

        assert_eq!(candidate.attempt, 1);
        assert_eq!(candidate.kind(), &StatementKind::Read);
        assert_eq!(candidate.request, "show all customers from France");

        let prompts = generator.prompts.lock();
        assert!(prompts[0].contains("read-only"));
        assert!(prompts[0].contains("Request: show all customers from France"));
    }

    #[tokio::test]
    async fn test_repair_prompt_carries_issues() {
        let generator = Scripted::new(vec![Ok("SELECT email FROM customers".to_string())]);
        let prior = vec![PriorAttempt {
            sql: Some("SELECT emali FROM customers".to_string()),
            issues: vec![ValidationIssue::new(
                IssueKind::UnknownColumn,
                "emali",
                "column 'emali' does not exist in table 'customers'",
            )],
            error: None,
        }];
        let candidate = translator(generator.clone())
            .translate("customer emails", &snapshot(), &prior)
            .await
            .unwrap();

        assert_eq!(candidate.attempt, 2);
        let prompts = generator.prompts.lock();
        assert!(prompts[0].contains("SELECT emali FROM customers"));
        assert!(prompts[0].contains("unknown-column: column 'emali' does not exist"));
    }

    #[tokio::test]
    async fn test_translate_times_out() {
        let generator = Arc::new(Scripted {
            replies: Mutex::new(VecDeque::from(vec![Ok("SELECT 1".to_string())])),
            prompts: Mutex::new(Vec::new()),
            delay: Some(Duration::from_millis(200)),
        });
        let mut settings = TranslatorSettings::new(DatabaseType::SQLite);
        settings.timeout = Some(Duration::from_millis(10));
        let err = QueryTranslator::new(generator, settings)
            .translate("anything", &snapshot(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::TranslationTimeout(10));
    }

    #[tokio::test]
    async fn test_generation_failure_passes_through() {
        let generator = Scripted::new(vec![Err(AgentError::generation("HTTP 503"))]);
        let err = translator(generator).translate("anything", &snapshot(), &[]).await.unwrap_err();
        assert!(matches!(err, AgentError::Generation(_)));
        assert!(!err.is_repairable());
    }
}
