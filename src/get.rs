//! Issue retrieval by key.
//!
//! Used by both `jmirror get` and `GET /api/issues/{key}`. Tombstoned issues
//! are returned too, flagged as deleted, so a link to a removed issue still
//! resolves to something explainable.

use anyhow::Result;
use jira_mirror_core::models::Issue;
use jira_mirror_core::normalize::{display_label, EnumKind};
use jira_mirror_core::store::MirrorStore;

use crate::config::Config;
use crate::sqlite_store;

/// Look up one issue. Keys are matched case-insensitively.
pub async fn get_issue<S: MirrorStore>(store: &S, key: &str) -> Result<Option<Issue>> {
    Ok(store.get_issue(&key.trim().to_uppercase()).await?)
}

pub async fn run_get(config: &Config, key: &str, json: bool) -> Result<()> {
    let store = sqlite_store::open(config).await?;
    let found = get_issue(&store, key).await;
    store.pool().close().await;

    let issue = match found? {
        Some(issue) => issue,
        None => {
            eprintln!("Error: issue not found: {}", key);
            std::process::exit(1);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&issue)?);
        return Ok(());
    }

    let d = &issue.data;
    let person = |p: &Option<jira_mirror_core::models::Person>| {
        p.as_ref()
            .and_then(|p| p.label().map(str::to_string))
            .unwrap_or_else(|| "unassigned".to_string())
    };

    println!("--- Issue ---");
    println!("key:        {}", d.key);
    println!(
        "project:    {}{}",
        d.project_key,
        d.project_name
            .as_ref()
            .map(|n| format!(" ({})", n))
            .unwrap_or_default()
    );
    println!("type:       {}", d.issue_type.as_deref().unwrap_or("-"));
    println!(
        "status:     {}",
        display_label(EnumKind::Status, &d.status).unwrap_or_else(|| "-".into())
    );
    println!(
        "priority:   {}",
        display_label(EnumKind::Priority, &d.priority).unwrap_or_else(|| "-".into())
    );
    println!("assignee:   {}", person(&d.assignee));
    println!("reporter:   {}", person(&d.reporter));
    println!("created:    {}", d.created.to_rfc3339());
    println!("updated:    {}", d.updated.to_rfc3339());
    if !d.labels.is_empty() {
        println!("labels:     {}", d.labels.join(", "));
    }
    if !d.components.is_empty() {
        println!("components: {}", d.components.join(", "));
    }
    for (id, value) in &d.custom_fields {
        if !value.is_null() {
            println!("{}: {}", id, value);
        }
    }
    println!("synced:     {}", issue.synced_at.to_rfc3339());
    if issue.deleted {
        let when = issue
            .deleted_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".into());
        println!("deleted:    yes (since {})", when);
    }
    println!();
    println!("--- Summary ---");
    println!("{}", d.summary);

    if let Some(desc) = d.description.as_deref().filter(|s| !s.trim().is_empty()) {
        println!();
        println!("--- Description ---");
        println!("{}", desc);
    }

    if !d.comments.is_empty() {
        println!();
        println!("--- Comments ({}) ---", d.comments.len());
        for c in &d.comments {
            let when = c
                .created
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("[{}] {}", when, c.author.as_deref().unwrap_or("anonymous"));
            println!("{}", c.body);
            println!();
        }
    }

    Ok(())
}
