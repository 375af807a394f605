//! Shared fixtures: seeded `SQLite` databases and a scripted text generator

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use sqlagent::engine::sqlite::SqliteEngine;
use sqlagent::{
    Advisor, AdvisorSettings, AgentError, ConnectionConfig, ExecutionLimits, Orchestrator,
    OrchestratorSettings, QueryExecutor, QueryTranslator, RefreshPolicy, SchemaCatalog,
    TextGenerator, TranslatorSettings,
};

pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    /// Shop database: customers and their orders
    pub fn shop() -> Self {
        let path = std::env::temp_dir()
            .join(format!("sqlagent_pipeline_{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&path).expect("Failed to create temp database");
        conn.execute_batch(
            "CREATE TABLE customers (
                 id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 email TEXT NOT NULL,
                 country TEXT NOT NULL,
                 active INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE orders (
                 id INTEGER PRIMARY KEY,
                 customer_id INTEGER NOT NULL REFERENCES customers(id),
                 total REAL NOT NULL
             );
             INSERT INTO customers (id, name, email, country, active) VALUES
                 (1, 'Amelie', 'amelie@example.fr', 'France', 1),
                 (2, 'Bruno', 'bruno@example.fr', 'France', 0),
                 (3, 'Carla', 'carla@example.it', 'Italy', 1);
             INSERT INTO orders (id, customer_id, total) VALUES
                 (1, 1, 10.5),
                 (2, 1, 20.0),
                 (3, 2, 5.25),
                 (4, 3, 99.0);",
        )
        .expect("Failed to seed database");
        Self { path }
    }

    pub fn engine(&self) -> Arc<SqliteEngine> {
        Arc::new(SqliteEngine::new(ConnectionConfig::sqlite(self.path.clone())))
    }

    pub fn execute(&self, sql: &str) {
        let conn = rusqlite::Connection::open(&self.path).expect("Failed to open database");
        conn.execute_batch(sql).expect("Failed to run setup SQL");
    }

    pub fn count(&self, table: &str) -> i64 {
        let conn = rusqlite::Connection::open(&self.path).expect("Failed to open database");
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("Failed to count rows")
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Replies in order, then repeats the last one; records every prompt
pub struct Scripted {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| (*r).to_string()).collect()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for Scripted {
    async fn complete(&self, prompt: &str) -> sqlagent::Result<String> {
        self.prompts.lock().push(prompt.to_string());
        let next = self.replies.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(reply) = next {
            *last = Some(reply);
        }
        last.clone().ok_or_else(|| AgentError::generation("no scripted reply"))
    }
}

pub fn pipeline(
    db: &TempDb,
    generator: Arc<Scripted>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    let engine = db.engine();
    let catalog = Arc::new(SchemaCatalog::new(engine.clone(), RefreshPolicy::Manual));

    let mut translator_settings = TranslatorSettings::new(sqlagent::DatabaseType::SQLite);
    translator_settings.allow_writes = settings.allow_writes;
    let limits =
        ExecutionLimits { read_only: !settings.allow_writes, ..ExecutionLimits::default() };

    Orchestrator::new(
        catalog,
        QueryTranslator::new(generator, translator_settings),
        QueryExecutor::new(engine, limits),
        Advisor::new(AdvisorSettings::default()),
        settings,
    )
}
