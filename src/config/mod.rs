//! Configuration Management
//!
//! Loads and saves named database connections together with agent and model settings.
//!
//! # Configuration Locations
//! - Local: `.sqlagent/config.json` (team-shareable, per-project)
//! - Global: `<config dir>/sqlagent/config.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Command-line flags (highest priority, applied by the CLI)
//! 2. Local config file
//! 3. Global config file
//!
//! Connections merge by name with local entries winning. The `agent` and `llm`
//! blocks are replaced wholesale by the local file when it has them.
//!
//! Settings are plain values handed to component constructors; nothing here is
//! process-global.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::advisor::AdvisorSettings;
use crate::catalog::RefreshPolicy;
use crate::engine::{ConnectionConfig, DatabaseType, ExecutionLimits};
use crate::error::{AgentError, Result};
use crate::translator::TranslatorSettings;

/// Contents of one configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Named connections
    #[serde(default)]
    pub connections: BTreeMap<String, StoredConnection>,

    /// Name of the default connection (must exist in `connections`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmSettings>,
}

/// Stored connection configuration
///
/// Like [`ConnectionConfig`] but the password may come from an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConnection {
    #[serde(flatten)]
    pub config: ConnectionConfig,

    /// Environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Force read-only mode regardless of `allow_writes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

impl StoredConnection {
    /// Resolve environment variables
    ///
    /// Returns the connection config and the read-only flag.
    pub fn resolve(&self) -> Result<(ConnectionConfig, bool)> {
        let mut config = self.config.clone();

        if let Some(env_var) = &self.password_env {
            match std::env::var(env_var) {
                Ok(password) => config.password = Some(password),
                Err(_) => {
                    return Err(AgentError::config(format!(
                        "Environment variable {env_var} not found for password"
                    )));
                }
            }
        }

        Ok((config, self.readonly.unwrap_or(false)))
    }
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Permit INSERT / UPDATE / DELETE / DDL
    pub allow_writes: bool,

    /// Repair rounds after the first translation
    pub max_retries: u32,

    pub translation_timeout_ms: u64,
    pub execution_timeout_ms: u64,

    /// Hard cap on materialized rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    /// Reload the schema after this many seconds; `None` reloads only on demand
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_ttl_secs: Option<u64>,

    /// Characters of schema context sent with each prompt
    pub context_budget_chars: usize,

    /// Run the optimizer advisor
    pub advise: bool,

    pub large_table_rows: u64,
    pub wide_table_columns: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            allow_writes: false,
            max_retries: 2,
            translation_timeout_ms: 30_000,
            execution_timeout_ms: 30_000,
            max_rows: None,
            schema_ttl_secs: None,
            context_budget_chars: 6000,
            advise: true,
            large_table_rows: 10_000,
            wide_table_columns: 12,
        }
    }
}

impl AgentSettings {
    #[must_use]
    pub fn translator(&self, dialect: DatabaseType) -> TranslatorSettings {
        TranslatorSettings {
            dialect,
            context_budget: self.context_budget_chars,
            timeout: millis(self.translation_timeout_ms),
            allow_writes: self.allow_writes,
        }
    }

    #[must_use]
    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: millis(self.execution_timeout_ms),
            max_rows: self.max_rows,
            read_only: !self.allow_writes,
        }
    }

    #[must_use]
    pub const fn advisor(&self) -> AdvisorSettings {
        AdvisorSettings {
            large_table_rows: self.large_table_rows,
            wide_table_columns: self.wide_table_columns,
        }
    }

    #[must_use]
    pub const fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy::from_ttl_secs(self.schema_ttl_secs)
    }
}

/// `0` disables a timeout
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Text-generation endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// OpenAI-compatible API root
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub temperature: f32,
    /// HTTP timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
            timeout_ms: None,
        }
    }
}

/// Configuration file location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLocation {
    /// `.sqlagent/config.json` in the current directory
    Local,
    /// `<config dir>/sqlagent/config.json`
    Global,
}

impl ConfigLocation {
    pub fn path(self) -> Result<PathBuf> {
        match self {
            Self::Local => local_config_path(),
            Self::Global => global_config_path(),
        }
    }
}

/// Path to the local config file
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir()
        .map_err(|e| AgentError::config(format!("Could not determine current directory: {e}")))?;
    Ok(current_dir.join(".sqlagent").join("config.json"))
}

/// Path to the global config file
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AgentError::config("Could not determine user config directory"))?;
    Ok(config_dir.join("sqlagent").join("config.json"))
}

/// Load one config file; a missing file is an empty config
pub fn load_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| AgentError::config(format!("Could not read config file: {e}")))?;
    serde_json::from_str(&contents).map_err(|e| {
        AgentError::config(format!("Invalid config file format in {}: {e}", path.display()))
    })
}

/// Write one config file, creating parent directories
pub fn save_file(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AgentError::config(format!("Could not create config directory: {e}")))?;
    }
    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| AgentError::config(format!("Could not serialize config: {e}")))?;
    fs::write(path, contents)
        .map_err(|e| AgentError::config(format!("Could not write config file: {e}")))
}

/// Merge a global and a local config; local wins
#[must_use]
pub fn merge(global: ConfigFile, local: ConfigFile) -> ConfigFile {
    let mut merged = global;
    merged.connections.extend(local.connections);
    if local.default.is_some() {
        merged.default = local.default;
    }
    if local.agent.is_some() {
        merged.agent = local.agent;
    }
    if local.llm.is_some() {
        merged.llm = local.llm;
    }
    merged
}

/// Load the merged view of both config files
pub fn load_with_precedence() -> Result<ConfigFile> {
    let global = load_file(&global_config_path()?)?;
    let local = load_file(&local_config_path()?)?;
    Ok(merge(global, local))
}

/// A connection ready to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub name: String,
    pub config: ConnectionConfig,
    pub readonly: bool,
}

impl ConfigFile {
    /// Resolve a connection by name, or the default one
    pub fn resolve_connection(&self, name: Option<&str>) -> Result<ResolvedConnection> {
        let conn_name = match name {
            Some(n) => n.to_string(),
            None => match (&self.default, self.connections.len()) {
                (Some(d), _) => d.clone(),
                (None, 1) => self.connections.keys().next().cloned().unwrap_or_default(),
                (None, _) => {
                    let available: Vec<_> = self.connections.keys().collect();
                    return Err(AgentError::config(format!(
                        "No default connection set. Available connections: {available:?}. \
                         Specify one with --name or run 'sqlagent connect'."
                    )));
                }
            },
        };

        let stored = self.connections.get(&conn_name).ok_or_else(|| {
            let available: Vec<_> = self.connections.keys().collect();
            AgentError::config(format!(
                "Connection '{conn_name}' not found. Available connections: {available:?}"
            ))
        })?;

        let (config, readonly) = stored.resolve()?;
        Ok(ResolvedConnection { name: conn_name, config, readonly })
    }

    /// Agent settings with defaults filled in
    #[must_use]
    pub fn agent_settings(&self) -> AgentSettings {
        self.agent.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn llm_settings(&self) -> LlmSettings {
        self.llm.clone().unwrap_or_default()
    }
}

/// Save a connection; the first connection in a file becomes its default
pub fn save_connection(
    name: Option<String>,
    connection: StoredConnection,
    location: ConfigLocation,
) -> Result<PathBuf> {
    let path = location.path()?;
    save_connection_to(&path, name, connection)?;
    Ok(path)
}

fn save_connection_to(
    path: &Path,
    name: Option<String>,
    connection: StoredConnection,
) -> Result<()> {
    let conn_name = name.unwrap_or_else(|| "default".to_string());
    let mut file = load_file(path)?;
    file.connections.insert(conn_name.clone(), connection);
    if file.default.is_none() {
        file.default = Some(conn_name);
    }
    save_file(path, &file)
}
