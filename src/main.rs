//! sqlagent CLI Entry Point
//!
//! Subcommands:
//! - `ask` - Translate, validate and run one natural-language request
//! - `check` - Validate and advise a hand-written statement without running it
//! - `tables` / `describe` - Catalog views
//! - `connect` - Save a named database connection
//! - `envelope-schema` - Print the response envelope JSON Schema
//!
//! All output to stdout is JSON (or CSV rows for `ask --format csv`). Logs go to stderr.
//!
//! Exit codes: 0 success, 1 execution or runtime error, 2 validation error, 64 usage error.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sqlagent::config::{self, ResolvedConnection};
use sqlagent::engine::{self, DatabaseEngine, MetadataSource};
use sqlagent::llm::ChatCompletions;
use sqlagent::output::{ErrorEnvelope, SuccessEnvelope};
use sqlagent::{
    Advisor, AgentError, AgentSettings, ConfigLocation, ConnectionConfig, DatabaseType,
    Orchestrator, OrchestratorSettings, OutputFormat, QueryExecutor, QueryTranslator,
    ResponseFormatter, SchemaCatalog, StoredConnection,
};

const EXIT_USAGE: u8 = 64;

/// sqlagent - Natural-language-to-SQL agent
#[derive(Parser)]
#[command(name = "sqlagent")]
#[command(
    about = "Natural-language-to-SQL agent with schema validation and least-privilege execution"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Named connection (defaults to the configured default)
    #[arg(long)]
    name: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one request
    Ask {
        /// Natural-language request
        request: String,

        #[command(flatten)]
        target: Target,

        /// Permit INSERT / UPDATE / DELETE / DDL
        #[arg(long)]
        allow_writes: bool,

        /// Repair rounds after the first translation
        #[arg(long)]
        max_retries: Option<u32>,

        /// Skip optimizer suggestions
        #[arg(long)]
        no_advice: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Single-line JSON
        #[arg(long)]
        compact: bool,
    },

    /// Validate and advise a statement without running it
    Check {
        sql: String,

        #[command(flatten)]
        target: Target,

        #[arg(long)]
        allow_writes: bool,
    },

    /// List tables
    Tables {
        #[command(flatten)]
        target: Target,
    },

    /// Show one table's columns, keys and indexes
    Describe {
        table: String,

        #[command(flatten)]
        target: Target,
    },

    /// Save a named connection
    Connect {
        /// Connection name
        #[arg(long, default_value = "default")]
        name: String,

        /// postgres, mysql or sqlite
        #[arg(long)]
        engine: DatabaseType,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        user: Option<String>,

        /// Prompted for when omitted (postgres/mysql)
        #[arg(long)]
        password: Option<String>,

        /// Read the password from this environment variable instead of storing it
        #[arg(long, conflicts_with = "password")]
        password_env: Option<String>,

        #[arg(long)]
        database: Option<String>,

        /// `SQLite` database file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Never allow writes through this connection
        #[arg(long)]
        readonly: bool,

        /// Save to the per-user config instead of `.sqlagent/config.json`
        #[arg(long)]
        global: bool,
    },

    /// Print the response envelope JSON Schema
    EnvelopeSchema,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = command_name(&cli.command);
    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            let err = into_agent_error(err);
            let code = match err {
                AgentError::InvalidInput(_) | AgentError::Config(_) => EXIT_USAGE,
                _ => 1,
            };
            tracing::debug!(error = %err, "command failed");
            let envelope = ErrorEnvelope::from_error("", command, &err);
            match serde_json::to_string_pretty(&envelope) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{{\"ok\":false}}"),
            }
            ExitCode::from(code)
        }
    }
}

const fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Ask { .. } => "ask",
        Commands::Check { .. } => "check",
        Commands::Tables { .. } => "tables",
        Commands::Describe { .. } => "describe",
        Commands::Connect { .. } => "connect",
        Commands::EnvelopeSchema => "envelope-schema",
    }
}

fn into_agent_error(err: anyhow::Error) -> AgentError {
    match err.downcast::<AgentError>() {
        Ok(agent) => agent,
        Err(other) => AgentError::config(format!("{other:#}")),
    }
}

async fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Ask {
            request,
            target,
            allow_writes,
            max_retries,
            no_advice,
            format,
            compact,
        } => {
            let session = Session::open(target.name.as_deref(), |settings| {
                settings.allow_writes |= allow_writes;
                if let Some(n) = max_retries {
                    settings.max_retries = n;
                }
                if no_advice {
                    settings.advise = false;
                }
            })?;
            let orchestrator = session.orchestrator()?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling request");
                    on_interrupt.cancel();
                }
            });

            let response = orchestrator.handle_with_cancel(&request, &cancel).await;
            let formatter = ResponseFormatter::new(format, compact);
            println!("{}", formatter.render(&response)?);
            Ok(exit_code(response.status().exit_code()))
        }

        Commands::Check { sql, target, allow_writes } => {
            let session = Session::open(target.name.as_deref(), |settings| {
                settings.allow_writes |= allow_writes;
            })?;
            let engine_name = session.dialect().to_string();
            let report = session.orchestrator()?.check(&sql).await?;
            let valid = report.valid;
            print_success(&engine_name, "check", report)?;
            Ok(exit_code(if valid { 0 } else { 2 }))
        }

        Commands::Tables { target } => {
            let session = Session::open(target.name.as_deref(), |_| {})?;
            let catalog = session.catalog();
            let snapshot = catalog.pin().await?;
            let tables: Vec<TableSummary> = snapshot
                .tables()
                .map(|t| TableSummary {
                    name: t.name.clone(),
                    columns: t.columns.len(),
                    row_count: t.row_count,
                })
                .collect();
            print_success(session.dialect().as_str(), "tables", tables)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Describe { table, target } => {
            let session = Session::open(target.name.as_deref(), |_| {})?;
            let catalog = session.catalog();
            catalog.pin().await?;
            let schema = catalog
                .describe(&table)
                .ok_or_else(|| AgentError::invalid_input(format!("Table '{table}' not found")))?;
            print_success(session.dialect().as_str(), "describe", schema)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Connect {
            name,
            engine,
            host,
            port,
            user,
            password,
            password_env,
            database,
            file,
            readonly,
            global,
        } => {
            let password = match (engine, password, &password_env) {
                (DatabaseType::SQLite, _, _) | (_, _, Some(_)) => None,
                (_, Some(password), None) => Some(password),
                (_, None, None) => Some(
                    dialoguer::Password::new()
                        .with_prompt("Password")
                        .allow_empty_password(true)
                        .interact()
                        .context("failed to read password")?,
                ),
            };
            let stored = StoredConnection {
                config: ConnectionConfig { engine, host, port, user, password, database, file },
                password_env,
                readonly: readonly.then_some(true),
            };

            // Verify before saving
            let (resolved, _) = stored.resolve()?;
            let introspection = engine::connect(&resolved)?.introspect().await?;

            let location = if global { ConfigLocation::Global } else { ConfigLocation::Local };
            let path = config::save_connection(Some(name.clone()), stored, location)?;
            print_success(
                engine.as_str(),
                "connect",
                ConnectSummary {
                    name,
                    database: introspection.database,
                    tables: introspection.tables.len(),
                    config_path: path.display().to_string(),
                },
            )?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::EnvelopeSchema => {
            println!("{}", ResponseFormatter::new(OutputFormat::Json, false).schema()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TableSummary {
    name: String,
    columns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    row_count: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSummary {
    name: String,
    database: String,
    tables: usize,
    config_path: String,
}

/// Resolved connection plus effective settings for one command
struct Session {
    connection: ResolvedConnection,
    engine: Arc<dyn DatabaseEngine>,
    settings: AgentSettings,
    llm: config::LlmSettings,
}

impl Session {
    /// Load config, apply flag overrides, then the connection's read-only pin
    fn open(
        name: Option<&str>,
        overrides: impl FnOnce(&mut AgentSettings),
    ) -> anyhow::Result<Self> {
        let file = config::load_with_precedence()?;
        let connection = file.resolve_connection(name)?;
        let mut settings = file.agent_settings();
        overrides(&mut settings);
        if connection.readonly {
            settings.allow_writes = false;
        }
        let engine = engine::connect(&connection.config)?;
        tracing::debug!(
            connection = %connection.name,
            engine = %connection.config.engine,
            "session opened"
        );
        Ok(Self { connection, engine, settings, llm: file.llm_settings() })
    }

    fn dialect(&self) -> DatabaseType {
        self.connection.config.engine
    }

    fn catalog(&self) -> Arc<SchemaCatalog> {
        Arc::new(SchemaCatalog::new(
            Arc::clone(&self.engine).metadata_source(),
            self.settings.refresh_policy(),
        ))
    }

    fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        let generator = ChatCompletions::from_settings(&self.llm)?;
        let translator =
            QueryTranslator::new(Arc::new(generator), self.settings.translator(self.dialect()));
        let executor = QueryExecutor::new(
            Arc::clone(&self.engine).sql_runner(),
            self.settings.execution_limits(),
        );
        Ok(Orchestrator::new(
            self.catalog(),
            translator,
            executor,
            Advisor::new(self.settings.advisor()),
            OrchestratorSettings {
                allow_writes: self.settings.allow_writes,
                max_retries: self.settings.max_retries,
                advise: self.settings.advise,
            },
        ))
    }
}

fn print_success<T: Serialize>(engine: &str, command: &str, data: T) -> anyhow::Result<()> {
    let envelope = SuccessEnvelope::new(engine, command, data);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
