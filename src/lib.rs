//! sqlagent - Natural-Language-to-SQL Agent
//!
//! sqlagent turns a natural-language request into one SQL statement, checks it against the
//! live schema, repairs it through the text generator when the check fails, and runs it
//! with least-privilege limits.
//!
//! # Core Principles
//! - Nothing reaches the database unless it passed validation against a schema snapshot
//! - Read-only by default; writes require an explicit opt-in
//! - Every request ends in exactly one structured response (JSON or CSV)
//! - Bounded work: limited repair attempts, statement timeouts, row caps
//!
//! # Module Organization
//! - [`error`] - Error types and handling
//! - [`engine`] - Database capabilities (`MetadataSource`, `SqlRunner`) and drivers
//! - [`catalog`] - Cached, atomically swapped schema snapshots
//! - [`statement`] - Dialect-aware parsing of candidate statements
//! - [`validator`] - Schema checks producing structured issues
//! - [`translator`] - Prompt construction and SQL extraction
//! - [`llm`] - OpenAI-compatible text generator
//! - [`advisor`] - Non-blocking performance suggestions
//! - [`executor`] - Limit-enforced execution and error classification
//! - [`output`] - Response envelope and formatting
//! - [`orchestrator`] - Request pipeline with the repair loop
//! - [`config`] - Connection registry and agent settings

pub mod advisor;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod llm;
pub mod orchestrator;
pub mod output;
pub mod statement;
pub mod translator;
pub mod validator;

// Re-export commonly used types for convenience
pub use advisor::{Advisor, AdvisorSettings};
pub use catalog::{RefreshPolicy, SchemaCatalog, SchemaSnapshot, TableSchema};
pub use config::{AgentSettings, ConfigFile, ConfigLocation, LlmSettings, StoredConnection};
pub use engine::{ConnectionConfig, DatabaseEngine, DatabaseType, ExecutionLimits};
pub use error::{AgentError, Result};
pub use executor::{ErrorKind, ExecutionResult, QueryExecutor};
pub use orchestrator::{CheckReport, Orchestrator, OrchestratorSettings};
pub use output::{AgentResponse, OutputFormat, ResponseFormatter, Status};
pub use statement::{CandidateQuery, StatementKind};
pub use translator::{QueryTranslator, TextGenerator, TranslatorSettings};
pub use validator::{IssueKind, ValidationIssue, ValidationResult};
