//! TOML configuration.
//!
//! Loaded once per process with [`load_config`]. A sync run works from a
//! [`SyncSettings`] snapshot taken at its start, so edits to the file never
//! affect a run in flight.

use anyhow::{bail, Context, Result};
use jira_mirror_core::fields::{is_valid_field_id, CustomFieldDef, FieldCatalog};
use jira_mirror_core::models::ScopeBase;
use jira_mirror_core::query::EngineSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::source::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub jira: JiraConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub custom_fields: Vec<CustomFieldDef>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraConfig {
    pub url: String,
    pub username: String,
    /// API token. Prefer `token_env` so the secret stays out of the file.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_token_env() -> String {
    "JIRA_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub jql: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            project: None,
            jql: None,
            rate_limit_per_minute: default_rate_limit(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_rate_limit() -> u32 {
    100
}
fn default_batch_size() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Result count beyond which callers are told to refine the query.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_pattern_timeout")]
    pub pattern_timeout_secs: u64,
    #[serde(default = "default_suggest_limit")]
    pub suggest_limit: usize,
    #[serde(default = "default_suggest_timeout_ms")]
    pub suggest_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_results: default_max_results(),
            pattern_timeout_secs: default_pattern_timeout(),
            suggest_limit: default_suggest_limit(),
            suggest_timeout_ms: default_suggest_timeout_ms(),
        }
    }
}

fn default_limit() -> usize {
    50
}
fn default_max_results() -> usize {
    10_000
}
fn default_pattern_timeout() -> u64 {
    5
}
fn default_suggest_timeout_ms() -> u64 {
    1500
}

fn default_suggest_limit() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Access control for the `/api` routes.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Reject `/api` requests that carry no `X-API-Key` header.
    #[serde(default)]
    pub require_key: bool,
    #[serde(default = "default_true")]
    pub rate_limiting: bool,
    /// Requests per minute for callers without a key, counted per address.
    #[serde(default = "default_anonymous_rate_limit")]
    pub anonymous_rate_limit: u32,
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            require_key: false,
            rate_limiting: true,
            anonymous_rate_limit: default_anonymous_rate_limit(),
            keys: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default = "default_key_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}
fn default_anonymous_rate_limit() -> u32 {
    30
}
fn default_key_rate_limit() -> u32 {
    60
}

/// Immutable view of everything a sync run needs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub scope: ScopeBase,
    pub batch_size: usize,
    pub rate_limit_per_minute: u32,
    pub retry: RetryPolicy,
    pub catalog: FieldCatalog,
}

impl Config {
    /// Snapshot the sync settings, with optional command-line scope overrides.
    pub fn snapshot(&self, project: Option<&str>, jql: Option<&str>) -> Result<SyncSettings> {
        let scope = match (project.or(self.sync.project.as_deref()), jql) {
            (_, Some(q)) => ScopeBase::Jql(q.to_string()),
            (Some(p), None) if project.is_some() || self.sync.jql.is_none() => {
                ScopeBase::Project(p.to_string())
            }
            _ => match &self.sync.jql {
                Some(q) => ScopeBase::Jql(q.clone()),
                None => bail!("no sync scope: set sync.project or sync.jql"),
            },
        };
        Ok(SyncSettings {
            scope,
            batch_size: self.sync.batch_size,
            rate_limit_per_minute: self.sync.rate_limit_per_minute,
            retry: self.retry_policy(),
            catalog: self.catalog(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts,
            base_delay: Duration::from_millis(self.sync.base_delay_ms),
            max_delay: Duration::from_millis(self.sync.max_delay_ms),
            jitter: true,
        }
    }

    pub fn catalog(&self) -> FieldCatalog {
        FieldCatalog::new(self.custom_fields.clone())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_limit: self.search.default_limit,
            ceiling: self.search.max_results,
            pattern_timeout: Duration::from_secs(self.search.pattern_timeout_secs),
            suggest_limit: self.search.suggest_limit,
            suggest_timeout: Duration::from_millis(self.search.suggest_timeout_ms),
        }
    }

    /// The API token from the file, falling back to `token_env`.
    pub fn jira_token(&self) -> Result<String> {
        if let Some(token) = self.jira.token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(token.clone());
        }
        std::env::var(&self.jira.token_env).with_context(|| {
            format!(
                "no Jira token: set jira.token or the {} environment variable",
                self.jira.token_env
            )
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !config.jira.url.starts_with("http://") && !config.jira.url.starts_with("https://") {
        bail!("jira.url must start with http:// or https://");
    }
    if config.jira.username.trim().is_empty() {
        bail!("jira.username must not be empty");
    }
    if config.jira.timeout_secs == 0 {
        bail!("jira.timeout_secs must be > 0");
    }

    // Validate sync
    if config.sync.project.is_some() && config.sync.jql.is_some() {
        bail!("set only one of sync.project and sync.jql");
    }
    if !(1..=1000).contains(&config.sync.batch_size) {
        bail!("sync.batch_size must be between 1 and 1000");
    }
    if config.sync.rate_limit_per_minute == 0 {
        bail!("sync.rate_limit_per_minute must be > 0");
    }
    if config.sync.max_attempts == 0 {
        bail!("sync.max_attempts must be >= 1");
    }
    if config.sync.base_delay_ms > config.sync.max_delay_ms {
        bail!("sync.base_delay_ms must not exceed sync.max_delay_ms");
    }

    // Validate search
    if config.search.default_limit == 0 {
        bail!("search.default_limit must be >= 1");
    }
    if config.search.max_results < config.search.default_limit {
        bail!("search.max_results must be >= search.default_limit");
    }
    if config.search.pattern_timeout_secs == 0 {
        bail!("search.pattern_timeout_secs must be > 0");
    }

    // Validate api
    if config.api.anonymous_rate_limit == 0 {
        bail!("api.anonymous_rate_limit must be > 0");
    }
    let mut seen_keys = std::collections::HashSet::new();
    for key in &config.api.keys {
        if key.name.trim().is_empty() || key.key.trim().is_empty() {
            bail!("every api.keys entry needs a name and a key");
        }
        if key.rate_limit == 0 {
            bail!("api key '{}' needs a rate_limit > 0", key.name);
        }
        if !seen_keys.insert(key.key.as_str()) {
            bail!("api key '{}' repeats another entry's key", key.name);
        }
    }
    if config.api.require_key && !config.api.keys.iter().any(|k| k.enabled) {
        bail!("api.require_key is set but no enabled api.keys entry exists");
    }

    for field in &config.custom_fields {
        if !is_valid_field_id(&field.id) {
            bail!(
                "custom field id '{}' may only contain letters, digits and '_'",
                field.id
            );
        }
        if field.name.trim().is_empty() {
            bail!("custom field '{}' needs a name", field.id);
        }
    }

    Ok(config)
}
