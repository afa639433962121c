//! Normalization of remote records into [`NormalizedIssue`]s.
//!
//! Maps source-native enum labels to stable integer codes through a fixed,
//! versioned table, parses timestamps, flattens comments, and extracts the
//! configured custom fields. A record is rejected only when it has no usable
//! key or timestamps; everything else degrades to `null` or the unknown code.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fields::{FieldCatalog, FieldType};
use crate::models::{CodedValue, Comment, NormalizedIssue, Person, RawIssue};

/// Bump whenever a code below changes meaning. Stored databases re-derive
/// codes from their retained labels when this differs.
pub const ENUM_TABLE_VERSION: u32 = 1;

/// Code for missing or unrecognized labels.
pub const UNKNOWN_CODE: i64 = 0;

const STATUS_CODES: &[(&str, i64)] = &[
    ("Open", 1),
    ("In Progress", 2),
    ("Reopened", 3),
    ("Resolved", 4),
    ("Closed", 5),
    ("To Do", 6),
    ("Done", 7),
    ("In Review", 8),
    ("Blocked", 9),
    ("Backlog", 10),
    ("Selected for Development", 11),
];

const PRIORITY_CODES: &[(&str, i64)] = &[
    ("Blocker", 1),
    ("Critical", 2),
    ("Highest", 3),
    ("High", 4),
    ("Major", 5),
    ("Medium", 6),
    ("Minor", 7),
    ("Low", 8),
    ("Lowest", 9),
    ("Trivial", 10),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumKind {
    Status,
    Priority,
}

impl EnumKind {
    fn table(&self) -> &'static [(&'static str, i64)] {
        match self {
            EnumKind::Status => STATUS_CODES,
            EnumKind::Priority => PRIORITY_CODES,
        }
    }
}

/// Stable code for a label; case-insensitive, whitespace-trimmed.
pub fn code_for(kind: EnumKind, label: &str) -> i64 {
    let wanted = label.trim();
    kind.table()
        .iter()
        .find(|(l, _)| l.eq_ignore_ascii_case(wanted))
        .map(|(_, c)| *c)
        .unwrap_or(UNKNOWN_CODE)
}

/// Canonical label for a known code.
pub fn label_for(kind: EnumKind, code: i64) -> Option<&'static str> {
    kind.table().iter().find(|(_, c)| *c == code).map(|(l, _)| *l)
}

pub fn coded(kind: EnumKind, label: Option<&str>) -> CodedValue {
    CodedValue {
        code: label.map(|l| code_for(kind, l)).unwrap_or(UNKNOWN_CODE),
        label: label.map(|l| l.trim().to_string()),
    }
}

/// Label to show for a coded value: the source's own label when retained.
pub fn display_label(kind: EnumKind, value: &CodedValue) -> Option<String> {
    value
        .label
        .clone()
        .or_else(|| label_for(kind, value.code).map(str::to_string))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record has no issue key")]
    MissingKey,
    #[error("malformed issue key '{0}'")]
    InvalidKey(String),
    #[error("issue {key}: missing or unparseable '{field}' timestamp")]
    InvalidTimestamp { key: String, field: &'static str },
}

/// Whether `key` has the `PROJECT-123` shape.
pub fn is_issue_key(key: &str) -> bool {
    match key.rsplit_once('-') {
        Some((project, num)) => {
            !project.is_empty()
                && project
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
                && project
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !num.is_empty()
                && num.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Parse a remote timestamp (`2024-01-15T10:30:00.000+0000` or RFC 3339).
pub fn parse_remote_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Parse a user- or source-supplied date: full timestamp, `yyyy-MM-dd HH:mm`,
/// or a bare `yyyy-MM-dd` (midnight UTC).
pub fn parse_loose_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Some(dt) = parse_remote_timestamp(s) {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

/// Turn one remote record into a [`NormalizedIssue`].
pub fn normalize(raw: &RawIssue, catalog: &FieldCatalog) -> Result<NormalizedIssue, NormalizeError> {
    let key = raw.key().ok_or(NormalizeError::MissingKey)?.trim().to_string();
    if !is_issue_key(&key) {
        return Err(NormalizeError::InvalidKey(key));
    }

    let empty = Value::Object(Default::default());
    let fields = raw.fields().unwrap_or(&empty);

    let created = timestamp_field(fields, "created")
        .ok_or_else(|| NormalizeError::InvalidTimestamp {
            key: key.clone(),
            field: "created",
        })?;
    let updated = timestamp_field(fields, "updated")
        .ok_or_else(|| NormalizeError::InvalidTimestamp {
            key: key.clone(),
            field: "updated",
        })?;

    let project = fields.get("project");
    let project_key = project
        .and_then(|p| str_at(p, "key"))
        .map(str::to_string)
        .unwrap_or_else(|| {
            key.rsplit_once('-')
                .map(|(p, _)| p.to_string())
                .unwrap_or_default()
        });

    let mut custom_fields = BTreeMap::new();
    for def in &catalog.custom {
        let value = fields
            .get(&def.id)
            .map(|v| custom_value(v, def.field_type))
            .unwrap_or(Value::Null);
        custom_fields.insert(def.id.clone(), value);
    }

    let mut issue = NormalizedIssue {
        key,
        project_key,
        project_name: project.and_then(|p| str_at(p, "name")).map(str::to_string),
        issue_type: fields
            .get("issuetype")
            .and_then(|t| str_at(t, "name"))
            .map(str::to_string),
        summary: fields
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        description: fields
            .get("description")
            .and_then(|d| d.as_str())
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        status: coded(
            EnumKind::Status,
            fields.get("status").and_then(|s| str_at(s, "name")),
        ),
        priority: coded(
            EnumKind::Priority,
            fields.get("priority").and_then(|p| str_at(p, "name")),
        ),
        assignee: fields.get("assignee").and_then(person),
        reporter: fields.get("reporter").and_then(person),
        created,
        updated,
        labels: fields
            .get("labels")
            .and_then(|l| l.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        components: fields
            .get("components")
            .and_then(|c| c.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| str_at(v, "name").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        comments: comments(fields),
        custom_fields,
        content_hash: String::new(),
        raw_json: Some(raw.0.to_string()),
    };
    issue.content_hash = content_hash(&issue);
    Ok(issue)
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

fn timestamp_field(fields: &Value, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.as_str())
        .and_then(parse_remote_timestamp)
}

fn person(v: &Value) -> Option<Person> {
    if v.is_null() {
        return None;
    }
    let id = str_at(v, "accountId")
        .or_else(|| str_at(v, "name"))
        .or_else(|| str_at(v, "key"))
        .map(str::to_string);
    let display_name = str_at(v, "displayName").map(str::to_string);
    if id.is_none() && display_name.is_none() {
        return None;
    }
    Some(Person { id, display_name })
}

fn comments(fields: &Value) -> Vec<Comment> {
    fields
        .get("comment")
        .and_then(|c| c.get("comments"))
        .and_then(|c| c.as_array())
        .map(|list| {
            list.iter()
                .map(|c| Comment {
                    author: c
                        .get("author")
                        .and_then(|a| str_at(a, "displayName").or_else(|| str_at(a, "name")))
                        .map(str::to_string),
                    created: str_at(c, "created").and_then(parse_remote_timestamp),
                    body: str_at(c, "body").unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Reduce a remote custom field value to the configured type. Values that
/// do not fit the type become `null` rather than failing the record.
fn custom_value(v: &Value, field_type: FieldType) -> Value {
    match field_type {
        FieldType::Number => match v {
            Value::Number(n) => n.as_f64().map(Value::from).unwrap_or(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::Date => v
            .as_str()
            .and_then(parse_loose_date)
            .map(|dt| Value::from(dt.timestamp_millis()))
            .unwrap_or(Value::Null),
        FieldType::Text => match text_of(v) {
            Some(s) if !s.is_empty() => Value::String(s),
            _ => Value::Null,
        },
    }
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => str_at(v, "value")
            .or_else(|| str_at(v, "name"))
            .or_else(|| str_at(v, "displayName"))
            .map(str::to_string)
            .or_else(|| Some(v.to_string())),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(text_of).collect();
            Some(parts.join(", "))
        }
    }
}

fn content_hash(issue: &NormalizedIssue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(issue.key.as_bytes());
    hasher.update(issue.updated.timestamp_millis().to_le_bytes());
    hasher.update(issue.summary.as_bytes());
    hasher.update(issue.description.as_deref().unwrap_or_default().as_bytes());
    hasher.update(issue.status.code.to_le_bytes());
    hasher.update(issue.priority.code.to_le_bytes());
    hasher.update(issue.comments_text().as_bytes());
    for (id, value) in &issue.custom_fields {
        hasher.update(id.as_bytes());
        hasher.update(value.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
