//! `jmirror export`: write mirrored issues as CSV or JSON.
//!
//! Without `--query` every live issue is exported (tombstones too with
//! `--include-deleted`), most recently updated first. With a query the
//! engine decides the rows and their order, up to `[search] max_results`.
//!
//! CSV quoting follows RFC 4180: a field holding a comma, quote or line
//! break is wrapped in quotes with inner quotes doubled. List columns are
//! joined with `;` and custom fields are one JSON object column.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jira_mirror_core::models::Issue;
use jira_mirror_core::normalize::{display_label, EnumKind};
use jira_mirror_core::query::engine::SearchRequest;
use jira_mirror_core::query::Query;
use jira_mirror_core::store::MirrorStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::search::{open_engine, parse_mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => bail!("Unknown export format: {}. Use csv or json.", s),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

/// One exported issue.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub key: String,
    pub project: String,
    pub issue_type: Option<String>,
    pub summary: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub labels: Vec<String>,
    pub components: Vec<String>,
    pub comments: usize,
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

const CSV_COLUMNS: &[&str] = &[
    "key",
    "project",
    "issue_type",
    "summary",
    "description",
    "status",
    "priority",
    "assignee",
    "reporter",
    "created",
    "updated",
    "labels",
    "components",
    "comments",
    "custom_fields",
    "deleted",
    "deleted_at",
];

impl ExportRow {
    pub fn from_issue(issue: &Issue) -> Self {
        let d = &issue.data;
        let name = |p: &Option<jira_mirror_core::models::Person>| {
            p.as_ref().and_then(|p| p.label().map(str::to_string))
        };
        Self {
            key: d.key.clone(),
            project: d.project_key.clone(),
            issue_type: d.issue_type.clone(),
            summary: d.summary.clone(),
            description: d.description.clone(),
            status: display_label(EnumKind::Status, &d.status),
            priority: display_label(EnumKind::Priority, &d.priority),
            assignee: name(&d.assignee),
            reporter: name(&d.reporter),
            created: d.created,
            updated: d.updated,
            labels: d.labels.clone(),
            components: d.components.clone(),
            comments: d.comments.len(),
            custom_fields: d.custom_fields.clone(),
            deleted: issue.deleted,
            deleted_at: issue.deleted_at,
        }
    }

    fn csv_fields(&self) -> Vec<String> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let custom = if self.custom_fields.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.custom_fields).unwrap_or_default()
        };
        vec![
            self.key.clone(),
            self.project.clone(),
            opt(&self.issue_type),
            self.summary.clone(),
            opt(&self.description),
            opt(&self.status),
            opt(&self.priority),
            opt(&self.assignee),
            opt(&self.reporter),
            self.created.to_rfc3339(),
            self.updated.to_rfc3339(),
            self.labels.join(";"),
            self.components.join(";"),
            self.comments.to_string(),
            custom,
            self.deleted.to_string(),
            self.deleted_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ]
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn write_csv<W: Write>(out: &mut W, rows: &[ExportRow]) -> std::io::Result<()> {
    let header: Vec<String> = CSV_COLUMNS.iter().map(|c| c.to_string()).collect();
    write!(out, "{}\r\n", csv_line(&header))?;
    for row in rows {
        write!(out, "{}\r\n", csv_line(&row.csv_fields()))?;
    }
    Ok(())
}

pub fn write_json<W: Write>(out: &mut W, rows: &[ExportRow]) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, rows)?;
    writeln!(out)?;
    Ok(())
}

pub fn write_rows<W: Write>(format: ExportFormat, out: &mut W, rows: &[ExportRow]) -> Result<()> {
    match format {
        ExportFormat::Csv => write_csv(out, rows)?,
        ExportFormat::Json => write_json(out, rows)?,
    }
    out.flush()?;
    Ok(())
}

pub async fn run_export(
    config: &Config,
    format: &str,
    output: Option<&Path>,
    query: Option<&str>,
    mode: &str,
    include_deleted: bool,
) -> Result<()> {
    let format = ExportFormat::parse(format)?;
    let (store, engine) = open_engine(config).await?;

    let issues = match query {
        None => store.all_issues(include_deleted).await?,
        Some(q) => {
            let request = SearchRequest {
                limit: Some(config.search.max_results),
                include_deleted,
                ..SearchRequest::new(Query::new(parse_mode(mode)?, q))
            };
            let page = engine.search(&request).await?;
            if page.total_matched > page.items.len() {
                warn!(
                    matched = page.total_matched,
                    exported = page.items.len(),
                    "export truncated at search.max_results"
                );
                eprintln!(
                    "Note: the query matched {} issues; exporting the first {}.",
                    page.total_matched,
                    page.items.len()
                );
            }
            let mut issues = Vec::with_capacity(page.items.len());
            for item in &page.items {
                if let Some(issue) = store.get_issue(&item.key).await? {
                    issues.push(issue);
                }
            }
            issues
        }
    };
    store.pool().close().await;

    if issues.is_empty() {
        println!("No issues found for export.");
        return Ok(());
    }
    let rows: Vec<ExportRow> = issues.iter().map(ExportRow::from_issue).collect();
    // Progress goes to stderr so stdout stays clean for the data.
    eprintln!(
        "Exporting {} issues in {} format...",
        rows.len(),
        format.as_str().to_uppercase()
    );

    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_rows(format, &mut BufWriter::new(file), &rows)?;
            println!("Export completed: {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            write_rows(format, &mut stdout.lock(), &rows)?;
        }
    }
    info!(issues = rows.len(), format = format.as_str(), "exported issues");
    Ok(())
}
