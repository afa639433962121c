//! Mirror status: issue counts, sync checkpoints and recent runs.
//!
//! `jmirror status` prints it; `GET /api/status` serves the same
//! [`StatusReport`] as JSON.

use anyhow::Result;
use chrono::{DateTime, Utc};
use jira_mirror_core::models::{SyncCheckpoint, SyncRunRecord};
use jira_mirror_core::store::CheckpointStore;
use serde::Serialize;

use crate::config::Config;
use crate::sqlite_store::{self, SqliteStore};

const RECENT_RUNS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ScopeStatus {
    pub scope: String,
    pub last_successful: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub cursor: Option<u64>,
    pub sync_type: String,
}

impl From<SyncCheckpoint> for ScopeStatus {
    fn from(cp: SyncCheckpoint) -> Self {
        Self {
            scope: cp.scope,
            last_successful: cp.last_successful,
            in_progress: cp.in_progress,
            cursor: cp.cursor,
            sync_type: cp.sync_type.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub issues: i64,
    pub deleted: i64,
    pub db_bytes: u64,
    pub scopes: Vec<ScopeStatus>,
    pub recent_runs: Vec<SyncRunRecord>,
}

pub async fn status_report(store: &SqliteStore, config: &Config) -> Result<StatusReport> {
    let (issues, deleted) = store.issue_counts().await?;
    let scopes = store
        .checkpoints()
        .await?
        .into_iter()
        .map(ScopeStatus::from)
        .collect();
    let recent_runs = store.last_runs(RECENT_RUNS).await?;
    let db_bytes = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    Ok(StatusReport {
        issues,
        deleted,
        db_bytes,
        scopes,
        recent_runs,
    })
}

pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let store = sqlite_store::open(config).await?;
    let report = status_report(&store, config).await;
    store.pool().close().await;
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Jira Mirror Status");
    println!("==================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(report.db_bytes));
    println!();
    println!("  Issues:      {}", report.issues);
    println!("  Deleted:     {}", report.deleted);

    if report.scopes.is_empty() {
        println!();
        println!("  Never synced. Run `jmirror sync --full` first.");
    } else {
        println!();
        println!("  {:<40} {:>18}   {}", "SCOPE", "LAST SUCCESS", "STATE");
        println!("  {}", "-".repeat(76));
        for s in &report.scopes {
            let last = s
                .last_successful
                .map(format_relative)
                .unwrap_or_else(|| "never".to_string());
            let state = if s.in_progress {
                format!("{} in progress (cursor {})", s.sync_type, s.cursor.unwrap_or(0))
            } else {
                "idle".to_string()
            };
            println!("  {:<40} {:>18}   {}", truncate(&s.scope, 40), last, state);
        }
    }

    if !report.recent_runs.is_empty() {
        println!();
        println!("  Recent runs:");
        for run in &report.recent_runs {
            let c = &run.counts;
            println!(
                "    {}  {:<11} {:<10} fetched {} | new {} | updated {} | unchanged {} | skipped {} | deleted {}",
                run.started_at.format("%Y-%m-%d %H:%M"),
                run.sync_type.as_str(),
                run.state.as_str(),
                c.fetched,
                c.new,
                c.updated,
                c.unchanged,
                c.skipped,
                c.deleted
            );
            if let Some(err) = &run.error {
                println!("      error: {}", err);
            }
        }
    }
    println!();
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering, falling back to a date for old or future times.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    if delta < 0 || delta >= 86400 * 30 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    }
}
