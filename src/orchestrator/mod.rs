//! Request Orchestration
//!
//! Drives one request through the pipeline:
//!
//! ```text
//! Translating → Validating → Advising → Executing → Done
//!      ↑            │
//!      └─ repair ───┘   (at most max_retries times)
//! ```
//!
//! Validation problems and translation output without usable SQL loop back to
//! Translating with the earlier attempts as context. Execution failures are terminal.
//! Every request ends with exactly one [`AgentResponse`].
//!
//! The schema snapshot is pinned once per request, so a concurrent refresh never
//! changes the schema a request validates against.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::advisor::Advisor;
use crate::catalog::{SchemaCatalog, SchemaSnapshot};
use crate::error::{AgentError, Result};
use crate::executor::{ErrorKind, QueryExecutor};
use crate::output::AgentResponse;
use crate::statement::{CandidateQuery, StatementKind};
use crate::translator::{PriorAttempt, QueryTranslator};
use crate::validator::{self, IssueKind, ValidationIssue, ValidationResult};

/// Orchestrator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub allow_writes: bool,
    /// Repair rounds after the first translation
    pub max_retries: u32,
    /// Run the advisor on valid candidates
    pub advise: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self { allow_writes: false, max_retries: 2, advise: true }
    }
}

/// Pipeline state
#[derive(Debug)]
enum State {
    Translating,
    Validating(CandidateQuery),
    Advising(CandidateQuery),
    Executing(CandidateQuery, Vec<String>),
    Done(AgentResponse),
}

/// Result of checking a hand-written statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub sql: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StatementKind>,
    pub issues: Vec<ValidationIssue>,
    pub suggestions: Vec<String>,
}

/// Request orchestrator
pub struct Orchestrator {
    catalog: Arc<SchemaCatalog>,
    translator: QueryTranslator,
    executor: QueryExecutor,
    advisor: Advisor,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        translator: QueryTranslator,
        executor: QueryExecutor,
        advisor: Advisor,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { catalog, translator, executor, advisor, settings }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    /// Handle one request to completion
    pub async fn handle(&self, request: &str) -> AgentResponse {
        self.handle_with_cancel(request, &CancellationToken::new()).await
    }

    /// Handle one request; `cancel` aborts it at the next suspension point
    pub async fn handle_with_cancel(
        &self,
        request: &str,
        cancel: &CancellationToken,
    ) -> AgentResponse {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("request", id = %request_id);
        let started = Instant::now();

        let (response, attempts) = self.run(request, cancel).instrument(span.clone()).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let response = response.with_attempts(attempts).with_elapsed_ms(elapsed_ms);

        span.in_scope(|| {
            tracing::info!(
                target: "sqlagent::audit",
                request_id = %request_id,
                request,
                status = %response.status(),
                attempts,
                sql = response.sql.as_deref().unwrap_or(""),
                elapsed_ms,
                "request finished"
            );
        });
        response
    }

    async fn run(&self, request: &str, cancel: &CancellationToken) -> (AgentResponse, u32) {
        if request.trim().is_empty() {
            let issue = ValidationIssue::new(IssueKind::NoStatement, "", "request is empty");
            return (AgentResponse::validation_error(None, vec![issue]), 0);
        }

        let snapshot = match cancellable(cancel, self.catalog.pin()).await {
            Ok(snapshot) => snapshot,
            Err(err) => return (terminal(None, &err), 0),
        };

        let mut prior: Vec<PriorAttempt> = Vec::new();
        let mut attempts = 0;
        let mut state = State::Translating;

        loop {
            state = match state {
                State::Translating => {
                    attempts += 1;
                    tracing::debug!(attempt = attempts, "translating");
                    let translation = self.translator.translate(request, &snapshot, &prior);
                    match cancellable(cancel, translation).await {
                        Ok(candidate) => State::Validating(candidate),
                        Err(err) if err.is_repairable() => {
                            tracing::debug!(
                                attempt = attempts,
                                error = %err,
                                "no usable SQL in model output"
                            );
                            prior.push(PriorAttempt {
                                sql: None,
                                issues: Vec::new(),
                                error: Some(err.message()),
                            });
                            self.repair_or_give_up(attempts, &prior)
                        }
                        Err(err) => State::Done(terminal(last_sql(&prior), &err)),
                    }
                }
                State::Validating(candidate) => {
                    let sql = candidate.sql.clone();
                    match validator::validate(candidate, &snapshot, self.settings.allow_writes) {
                        ValidationResult::Valid(candidate) if self.settings.advise => {
                            State::Advising(candidate)
                        }
                        ValidationResult::Valid(candidate) => {
                            State::Executing(candidate, Vec::new())
                        }
                        ValidationResult::Invalid(issues) => {
                            prior.push(PriorAttempt { sql: Some(sql), issues, error: None });
                            self.repair_or_give_up(attempts, &prior)
                        }
                    }
                }
                State::Advising(candidate) => {
                    let suggestions = self.advisor.advise(&candidate, &snapshot);
                    State::Executing(candidate, suggestions)
                }
                State::Executing(candidate, suggestions) => {
                    if cancel.is_cancelled() {
                        State::Done(terminal(Some(candidate.sql), &AgentError::Cancelled))
                    } else {
                        let result = self.executor.execute(&candidate, cancel).await;
                        State::Done(
                            AgentResponse::new(Some(candidate.sql), result)
                                .with_suggestions(suggestions),
                        )
                    }
                }
                State::Done(response) => return (response, attempts),
            };
        }
    }

    fn repair_or_give_up(&self, attempts: u32, prior: &[PriorAttempt]) -> State {
        if attempts <= self.settings.max_retries {
            tracing::warn!(
                attempt = attempts,
                max_retries = self.settings.max_retries,
                "candidate rejected, repairing"
            );
            return State::Translating;
        }

        let issues = prior.last().map_or_else(Vec::new, |last| {
            if last.issues.is_empty() {
                let message =
                    last.error.clone().unwrap_or_else(|| "no SQL statement produced".to_string());
                vec![ValidationIssue::new(IssueKind::NoStatement, "", message)]
            } else {
                last.issues.clone()
            }
        });
        State::Done(AgentResponse::validation_error(last_sql(prior), issues))
    }

    /// Validate and advise a hand-written statement without running it
    pub async fn check(&self, sql: &str) -> Result<CheckReport> {
        let snapshot = self.catalog.pin().await?;
        Ok(self.check_against(sql, &snapshot))
    }

    fn check_against(&self, sql: &str, snapshot: &SchemaSnapshot) -> CheckReport {
        let candidate = match CandidateQuery::new(sql, "", self.translator.settings().dialect, 1) {
            Ok(candidate) => candidate,
            Err(err) => {
                return CheckReport {
                    sql: sql.to_string(),
                    valid: false,
                    kind: None,
                    issues: vec![ValidationIssue::new(IssueKind::NoStatement, "", err.message())],
                    suggestions: Vec::new(),
                }
            }
        };

        let issues = validator::check(&candidate.statement, snapshot, self.settings.allow_writes);
        let suggestions = if issues.is_empty() && self.settings.advise {
            self.advisor.advise(&candidate, snapshot)
        } else {
            Vec::new()
        };
        CheckReport {
            sql: candidate.sql,
            valid: issues.is_empty(),
            kind: Some(candidate.statement.kind),
            issues,
            suggestions,
        }
    }
}

/// Race a future against cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AgentError::Cancelled),
        result = fut => result,
    }
}

fn last_sql(prior: &[PriorAttempt]) -> Option<String> {
    prior.iter().rev().find_map(|p| p.sql.clone())
}

/// Response for an error that ends the request before execution
fn terminal(sql: Option<String>, err: &AgentError) -> AgentResponse {
    let kind = match err {
        AgentError::TranslationTimeout(_) => ErrorKind::Timeout,
        AgentError::Cancelled => ErrorKind::Cancelled,
        AgentError::Connection(_) => ErrorKind::ConnectionLost,
        _ => ErrorKind::Unknown,
    };
    tracing::warn!(error = %err, %kind, "request aborted");
    AgentResponse::execution_error(sql, kind, err.message())
}
