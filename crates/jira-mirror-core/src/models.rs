//! Core data models used throughout Jira Mirror.
//!
//! These types represent the issues, checkpoints, and search results that
//! flow through the sync and query pipelines. Remote records enter as
//! loosely-typed [`RawIssue`]s and leave the reconciler as
//! [`NormalizedIssue`]s; the store wraps them into [`Issue`]s with
//! tombstone bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote issue record exactly as the source returned it.
///
/// No field is trusted until normalization; the only accessor used before
/// that is [`key`](RawIssue::key), which the orchestrator needs to look up
/// local state.
#[derive(Debug, Clone, PartialEq)]
pub struct RawIssue(pub serde_json::Value);

impl RawIssue {
    pub fn key(&self) -> Option<&str> {
        self.0.get("key").and_then(|k| k.as_str())
    }

    pub fn fields(&self) -> Option<&serde_json::Value> {
        self.0.get("fields")
    }
}

/// An enum-like attribute stored as a stable integer code plus the label the
/// source used. Code `0` means the label was missing or unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedValue {
    pub code: i64,
    pub label: Option<String>,
}

/// A user identity as seen on the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Account id, user name or user key, whichever the source supplied.
    pub id: Option<String>,
    pub display_name: Option<String>,
}

impl Person {
    /// Name used for display and for the search representation.
    pub fn label(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub body: String,
}

/// An issue after reconciliation: every attribute typed, enums coded,
/// custom fields reduced to the configured subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedIssue {
    pub key: String,
    pub project_key: String,
    pub project_name: Option<String>,
    pub issue_type: Option<String>,
    pub summary: String,
    pub description: Option<String>,
    pub status: CodedValue,
    pub priority: CodedValue,
    pub assignee: Option<Person>,
    pub reporter: Option<Person>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub labels: Vec<String>,
    pub components: Vec<String>,
    pub comments: Vec<Comment>,
    /// Configured custom field id → value (`null` when absent remotely).
    /// Text values are strings, numbers are numbers, dates are epoch millis.
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    /// SHA-256 of the normalized content, hex encoded.
    pub content_hash: String,
    /// The remote record this issue was derived from, kept for audit.
    pub raw_json: Option<String>,
}

impl NormalizedIssue {
    /// Numeric part of the key (`PROJ-123` → 123), used for natural key ordering.
    pub fn key_number(&self) -> i64 {
        key_number(&self.key)
    }

    /// All comments flattened into one searchable blob, one per line.
    pub fn comments_text(&self) -> String {
        self.comments
            .iter()
            .map(|c| match &c.author {
                Some(author) => format!("{}: {}", author, c.body),
                None => c.body.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The denormalized text the free-text index is built from.
    pub fn search_text(&self) -> String {
        let mut parts: Vec<String> = vec![self.key.clone(), self.summary.clone()];
        if let Some(d) = &self.description {
            parts.push(d.clone());
        }
        let comments = self.comments_text();
        if !comments.is_empty() {
            parts.push(comments);
        }
        for person in [&self.assignee, &self.reporter].into_iter().flatten() {
            if let Some(name) = person.label() {
                parts.push(name.to_string());
            }
        }
        parts.push(self.project_key.clone());
        if let Some(name) = &self.project_name {
            parts.push(name.clone());
        }
        if let Some(t) = &self.issue_type {
            parts.push(t.clone());
        }
        parts.extend(self.labels.iter().cloned());
        parts.extend(self.components.iter().cloned());
        for value in self.custom_fields.values() {
            if let Some(s) = value.as_str() {
                parts.push(s.to_string());
            }
        }
        parts.join("\n")
    }
}

/// An issue as held by the mirror store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    #[serde(flatten)]
    pub data: NormalizedIssue,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

/// A compact result row for result lists and previews.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueSummary {
    pub key: String,
    pub summary: String,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub updated: DateTime<Utc>,
    /// Relevance score (free-text mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub deleted: bool,
}

impl IssueSummary {
    pub fn from_issue(issue: &Issue, score: Option<f64>, snippet: Option<String>) -> Self {
        use crate::normalize::{display_label, EnumKind};
        let d = &issue.data;
        Self {
            key: d.key.clone(),
            summary: d.summary.clone(),
            status: display_label(EnumKind::Status, &d.status),
            priority: display_label(EnumKind::Priority, &d.priority),
            assignee: d
                .assignee
                .as_ref()
                .and_then(|p| p.label().map(str::to_string)),
            updated: d.updated,
            score,
            snippet,
            deleted: issue.deleted,
        }
    }
}

/// Whether a sync run enumerates the whole scope or only recent changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(SyncType::Full),
            "incremental" => Some(SyncType::Incremental),
            _ => None,
        }
    }
}

/// What the remote system should enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeBase {
    Project(String),
    Jql(String),
}

/// A sync scope plus the optional incremental watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    pub base: ScopeBase,
    pub updated_since: Option<DateTime<Utc>>,
}

impl QueryScope {
    pub fn new(base: ScopeBase) -> Self {
        Self {
            base,
            updated_since: None,
        }
    }

    pub fn with_watermark(&self, since: DateTime<Utc>) -> Self {
        Self {
            base: self.base.clone(),
            updated_since: Some(since),
        }
    }

    /// Stable identifier of the scope, independent of the watermark.
    /// Checkpoints and scope membership are keyed by it.
    pub fn id(&self) -> String {
        match &self.base {
            ScopeBase::Project(p) => format!("project:{}", p.to_uppercase()),
            ScopeBase::Jql(q) => format!("jql:{}", base_jql(q)),
        }
    }

    /// The scope's filter without any ordering.
    pub fn filter_jql(&self) -> String {
        let base = match &self.base {
            ScopeBase::Project(p) => format!("project = \"{}\"", p),
            ScopeBase::Jql(q) => base_jql(q).to_string(),
        };
        match self.updated_since {
            // Remote dates are minute-precision; flooring re-fetches at most
            // one minute of already-mirrored changes.
            Some(since) => format!(
                "({}) AND updated >= \"{}\"",
                base,
                since.format("%Y-%m-%d %H:%M")
            ),
            None => base,
        }
    }

    /// Render the scope as a paged remote query.
    ///
    /// Pages are ordered by key, which an edit never changes, so an issue
    /// updated while a run is paging cannot move across the offset cursor.
    pub fn to_jql(&self) -> String {
        format!("{} ORDER BY key ASC", self.filter_jql())
    }

    /// The scope restricted to the given keys.
    pub fn keys_jql(&self, keys: &[String]) -> String {
        let list: Vec<String> = keys
            .iter()
            .map(|k| format!("\"{}\"", k.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("({}) AND key in ({})", self.filter_jql(), list.join(", "))
    }
}

/// Strip a trailing `ORDER BY` clause so the base query can be wrapped.
/// Text inside quoted values is never taken for the clause.
fn base_jql(q: &str) -> &str {
    match order_by_position(q) {
        Some(pos) => q[..pos].trim(),
        None => q.trim(),
    }
}

/// Byte offset of the last unquoted `ORDER BY`, if any.
fn order_by_position(q: &str) -> Option<usize> {
    let bytes = q.as_bytes();
    let mut quote: Option<u8> = None;
    let mut found = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(open) if b == open => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None => {
                let at_word = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
                if at_word
                    && bytes.len() - i >= 5
                    && bytes[i..i + 5].eq_ignore_ascii_case(b"ORDER")
                {
                    let rest = &q[i + 5..];
                    let trimmed = rest.trim_start();
                    if rest.len() > trimmed.len()
                        && trimmed.len() >= 2
                        && trimmed.as_bytes()[..2].eq_ignore_ascii_case(b"BY")
                    {
                        found = Some(i);
                    }
                }
            }
        }
        i += 1;
    }
    found
}

/// Persisted resume state for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub scope: String,
    /// Watermark for the next incremental run.
    pub last_successful: Option<DateTime<Utc>>,
    /// Cursor of the next page to fetch for the run in progress.
    pub cursor: Option<u64>,
    pub sync_type: SyncType,
    pub run_id: Option<String>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub in_progress: bool,
}

impl SyncCheckpoint {
    pub fn empty(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            last_successful: None,
            cursor: None,
            sync_type: SyncType::Full,
            run_id: None,
            run_started_at: None,
            in_progress: false,
        }
    }
}

/// Terminal state of a recorded sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => RunState::Succeeded,
            "failed" => RunState::Failed,
            "cancelled" => RunState::Cancelled,
            _ => RunState::Running,
        }
    }
}

/// Per-run counters, accumulated page by page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub fetched: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub deleted: u64,
}

impl ChangeCounts {
    pub fn absorb(&mut self, other: &ChangeCounts) {
        self.fetched += other.fetched;
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
    }
}

/// History row for one sync run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunRecord {
    pub id: String,
    pub scope: String,
    pub sync_type: SyncType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub counts: ChangeCounts,
    pub error: Option<String>,
}

/// Numeric suffix of an issue key, or 0 when the key has none.
pub fn key_number(key: &str) -> i64 {
    key.rsplit_once('-')
        .and_then(|(_, n)| n.parse::<i64>().ok())
        .unwrap_or(0)
}
