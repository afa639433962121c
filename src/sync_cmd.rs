//! `jmirror sync` and `jmirror test-connection`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::source::jira::JiraSource;
use crate::source::GuardedSource;
use crate::sqlite_store;
use crate::sync::{SyncCoordinator, SyncOrchestrator};

pub async fn run_sync(
    config: &Config,
    full: bool,
    project: Option<&str>,
    jql: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let settings = config.snapshot(project, jql)?;
    let source = GuardedSource::new(
        JiraSource::from_config(config)?,
        settings.rate_limit_per_minute,
        settings.retry.clone(),
    );
    let store = Arc::new(sqlite_store::open(config).await?);
    let coordinator = Arc::new(SyncCoordinator::new());
    let orchestrator = SyncOrchestrator::new(source, store.clone(), settings, coordinator.clone());

    if dry_run {
        let report = orchestrator.dry_run(full).await;
        store.pool().close().await;
        let report = report?;
        println!("sync {} (dry-run)", report.scope);
        println!("  type: {}", report.sync_type.as_str());
        println!("  jql: {}", report.jql);
        match report.total {
            Some(total) => println!("  issues found: {}", total),
            None => println!("  issues found: unknown"),
        }
        return Ok(());
    }

    // Ctrl-C stops the run before its next page; the checkpoint keeps the
    // cursor, so the next sync resumes from there.
    let cancel = coordinator.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current page");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(full).await;
    watcher.abort();
    store.pool().close().await;
    let report = result?;

    info!(run_id = %report.run_id, "sync finished");
    println!("sync {}", report.scope);
    println!(
        "  type: {}{}",
        report.sync_type.as_str(),
        if report.resumed { " (resumed)" } else { "" }
    );
    println!("  pages: {}", report.pages);
    println!("  fetched: {} issues", report.counts.fetched);
    println!("  new: {}", report.counts.new);
    println!("  updated: {}", report.counts.updated);
    println!("  unchanged: {}", report.counts.unchanged);
    if report.counts.skipped > 0 {
        println!("  skipped: {}", report.counts.skipped);
    }
    println!("  deleted: {}", report.counts.deleted);
    if let Some(w) = report.watermark {
        println!("  checkpoint: {}", w.to_rfc3339());
    }
    println!("ok");
    Ok(())
}

pub async fn run_test_connection(config: &Config) -> Result<()> {
    let source = GuardedSource::new(
        JiraSource::from_config(config)?,
        config.sync.rate_limit_per_minute,
        config.retry_policy(),
    );
    match source.whoami().await {
        Ok(who) => {
            println!("Connected to {}", config.jira.url);
            println!("  user: {}", who.name);
            if let Some(display) = who.display_name {
                println!("  display name: {}", display);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: connection failed: {}", e);
            std::process::exit(1);
        }
    }
}
