//! `jmirror init-config` and `jmirror validate-config`.
//!
//! Both run before any configuration is loaded, since the file may not
//! exist yet or may be the thing that is broken.

use std::path::Path;

use anyhow::{bail, Context, Result};
use jira_mirror_core::models::ScopeBase;

use crate::config::{load_config, Config};

const FULL_TEMPLATE: &str = include_str!("../config/jmirror.example.toml");

const MINIMAL_TEMPLATE: &str = r#"# jmirror configuration

[db]
path = "./data/mirror.sqlite"

[jira]
url = "https://jira.example.com"
username = "sync-bot"
# Read from this environment variable unless `token` is set here.
token_env = "JIRA_TOKEN"

[sync]
project = "PROJ"
"#;

pub fn template(minimal: bool) -> &'static str {
    if minimal {
        MINIMAL_TEMPLATE
    } else {
        FULL_TEMPLATE
    }
}

/// Write a configuration template. An existing file is never replaced.
pub fn run_init_config(path: &Path, minimal: bool) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists; remove it or pass a different --config path",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, template(minimal))
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Configuration template created: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the file with your Jira URL, user and scope");
    println!("  2. jmirror test-connection");
    println!("  3. jmirror discover-fields");
    println!("  4. jmirror init && jmirror sync");
    Ok(())
}

/// Things that load fine but will stop a command later.
pub fn warnings(config: &Config) -> Vec<String> {
    let mut out = Vec::new();
    if config.jira_token().is_err() {
        out.push(format!(
            "no Jira token: set jira.token or export {}",
            config.jira.token_env
        ));
    }
    if config.snapshot(None, None).is_err() {
        out.push("no sync scope: set sync.project or sync.jql".to_string());
    }
    if !config.api.require_key && !config.api.keys.is_empty() {
        out.push("api.keys are configured but api.require_key is off".to_string());
    }
    out
}

fn token_source(config: &Config) -> String {
    if config.jira.token.as_ref().is_some_and(|t| !t.is_empty()) {
        "in config file".to_string()
    } else if std::env::var(&config.jira.token_env).is_ok() {
        format!("from ${}", config.jira.token_env)
    } else {
        "missing".to_string()
    }
}

fn print_summary(config: &Config) {
    println!();
    println!("Jira:          {} (user {})", config.jira.url, config.jira.username);
    println!("Token:         {}", token_source(config));
    match config.snapshot(None, None).map(|s| s.scope) {
        Ok(ScopeBase::Project(p)) => println!("Scope:         project {}", p),
        Ok(ScopeBase::Jql(q)) => println!("Scope:         jql {}", q),
        Err(_) => println!("Scope:         none"),
    }
    println!("Database:      {}", config.db.path.display());
    println!(
        "Sync:          batch {}, {} requests/min, {} attempts",
        config.sync.batch_size, config.sync.rate_limit_per_minute, config.sync.max_attempts
    );
    println!(
        "Search:        limit {}, max {} results, pattern timeout {}s",
        config.search.default_limit, config.search.max_results, config.search.pattern_timeout_secs
    );
    println!("Server:        {}", config.server.bind);
    let enabled = config.api.keys.iter().filter(|k| k.enabled).count();
    println!(
        "API:           {} keys ({} enabled), key required: {}, rate limiting: {}",
        config.api.keys.len(),
        enabled,
        if config.api.require_key { "yes" } else { "no" },
        if config.api.rate_limiting {
            format!("{}/min anonymous", config.api.anonymous_rate_limit)
        } else {
            "off".to_string()
        }
    );
    if config.custom_fields.is_empty() {
        println!("Custom fields: none");
    } else {
        println!("Custom fields: {}", config.custom_fields.len());
        for field in &config.custom_fields {
            println!("  - {} ({}) [{:?}]", field.name, field.id, field.field_type);
        }
    }
}

/// Load and check the configuration. Errors fail the command; warnings
/// are printed but do not.
pub fn run_validate_config(path: &Path, detailed: bool) -> Result<()> {
    let config = load_config(path)
        .with_context(|| format!("Configuration {} is invalid", path.display()))?;
    println!("Configuration is valid: {}", path.display());

    for warning in warnings(&config) {
        println!("Warning: {}", warning);
    }
    if detailed {
        print_summary(&config);
    }
    Ok(())
}
