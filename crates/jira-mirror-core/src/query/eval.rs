//! In-process predicate evaluation and result ordering.
//!
//! Comparisons against a missing value are false for every operator,
//! including `!=`, `!~` and `NOT IN`; `NOT` then negates the two-valued
//! result. The SQL translation follows the same rules, so both stores agree
//! on what matches.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::fields::{Field, FieldKind, FieldType};
use crate::models::{CodedValue, Issue};

use super::text::tokenize;
use super::{CompareOp, Operand, Predicate, SortSpec};

/// Text values of a field. Empty when the field has no value.
pub fn field_texts(field: &Field, issue: &Issue) -> Vec<String> {
    let d = &issue.data;
    let mut out: Vec<String> = Vec::new();
    match field {
        Field::Key => out.push(d.key.clone()),
        Field::Project => {
            out.push(d.project_key.clone());
            out.extend(d.project_name.clone());
        }
        Field::Summary => out.push(d.summary.clone()),
        Field::Description => out.extend(d.description.clone()),
        Field::Comments => {
            let text = d.comments_text();
            if !text.is_empty() {
                out.push(text);
            }
        }
        Field::Status => out.extend(d.status.label.clone()),
        Field::Priority => out.extend(d.priority.label.clone()),
        Field::Assignee | Field::Reporter => {
            let person = if *field == Field::Assignee {
                &d.assignee
            } else {
                &d.reporter
            };
            if let Some(p) = person {
                out.extend(p.id.clone());
                out.extend(p.display_name.clone());
            }
        }
        Field::IssueType => out.extend(d.issue_type.clone()),
        Field::Labels => out.extend(d.labels.iter().cloned()),
        Field::Components => out.extend(d.components.iter().cloned()),
        Field::Created => out.push(d.created.to_rfc3339()),
        Field::Updated => out.push(d.updated.to_rfc3339()),
        Field::Custom { id, .. } => match d.custom_fields.get(id) {
            Some(serde_json::Value::String(s)) => out.push(s.clone()),
            Some(serde_json::Value::Number(n)) => out.push(n.to_string()),
            _ => {}
        },
    }
    out.retain(|s| !s.is_empty());
    out
}

fn field_date(field: &Field, issue: &Issue) -> Option<DateTime<Utc>> {
    match field {
        Field::Created => Some(issue.data.created),
        Field::Updated => Some(issue.data.updated),
        Field::Custom {
            id,
            field_type: FieldType::Date,
        } => issue
            .data
            .custom_fields
            .get(id)
            .and_then(|v| v.as_i64())
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn field_number(field: &Field, issue: &Issue) -> Option<f64> {
    match field {
        Field::Custom { id, .. } => issue.data.custom_fields.get(id).and_then(|v| v.as_f64()),
        _ => None,
    }
}

fn coded<'a>(field: &Field, issue: &'a Issue) -> &'a CodedValue {
    if *field == Field::Priority {
        &issue.data.priority
    } else {
        &issue.data.status
    }
}

fn enum_present(value: &CodedValue) -> bool {
    value.code != 0 || value.label.is_some()
}

fn enum_eq(value: &CodedValue, code: i64, label: &str) -> bool {
    if code != 0 {
        value.code == code
    } else {
        value
            .label
            .as_deref()
            .is_some_and(|l| l.trim().eq_ignore_ascii_case(label.trim()))
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

fn compare(field: &Field, op: CompareOp, value: &Operand, issue: &Issue) -> bool {
    match (field.kind(), value) {
        (FieldKind::Enum, Operand::Enum { code, label }) => {
            let v = coded(field, issue);
            if !enum_present(v) {
                return false;
            }
            match op {
                CompareOp::Eq => enum_eq(v, *code, label),
                CompareOp::Ne => !enum_eq(v, *code, label),
                _ => false,
            }
        }
        (FieldKind::Date, Operand::Date(want)) => match field_date(field, issue) {
            Some(have) => ordered(op, have.cmp(want)),
            None => false,
        },
        (FieldKind::Number, Operand::Number(want)) => match field_number(field, issue) {
            Some(have) => have.partial_cmp(want).is_some_and(|o| ordered(op, o)),
            None => false,
        },
        (_, Operand::Text(want)) => {
            let texts = field_texts(field, issue);
            if texts.is_empty() {
                return false;
            }
            match op {
                CompareOp::Eq => texts.iter().any(|t| t.eq_ignore_ascii_case(want)),
                CompareOp::Ne => !texts.iter().any(|t| t.eq_ignore_ascii_case(want)),
                CompareOp::Contains => texts.iter().any(|t| contains_ci(t, want)),
                CompareOp::NotContains => !texts.iter().any(|t| contains_ci(t, want)),
                _ => false,
            }
        }
        _ => false,
    }
}

fn ordered(op: CompareOp, ord: Ordering) -> bool {
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
        CompareOp::Contains | CompareOp::NotContains => false,
    }
}

fn is_empty(field: &Field, issue: &Issue) -> bool {
    match field.kind() {
        FieldKind::Enum => !enum_present(coded(field, issue)),
        FieldKind::Date => field_date(field, issue).is_none(),
        FieldKind::Number => field_number(field, issue).is_none(),
        _ => field_texts(field, issue).is_empty(),
    }
}

impl Predicate {
    /// Evaluate against one issue. Tombstone filtering is the caller's job.
    pub fn matches(&self, issue: &Issue) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Nothing => false,
            Predicate::Compare { field, op, value } => compare(field, *op, value, issue),
            Predicate::In {
                field,
                values,
                negated,
            } => {
                if is_empty(field, issue) {
                    return false;
                }
                let any = values
                    .iter()
                    .any(|v| compare(field, CompareOp::Eq, v, issue));
                any != *negated
            }
            Predicate::Empty { field, negated } => is_empty(field, issue) != *negated,
            Predicate::Text(query) => {
                query
                    .key_hint
                    .as_deref()
                    .is_some_and(|k| k == issue.data.key)
                    || query.matches_tokens(&tokenize(&issue.data.search_text()))
            }
            Predicate::Pattern(pattern) => pattern
                .fields
                .iter()
                .any(|f| field_texts(f, issue).iter().any(|t| pattern.regex.is_match(t))),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(issue)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(issue)),
            Predicate::Not(inner) => !inner.matches(issue),
        }
    }
}

/// The `updated DESC, key ASC` tie-breaker every ranking ends with.
pub fn tie_break(a: &Issue, b: &Issue) -> Ordering {
    b.data
        .updated
        .cmp(&a.data.updated)
        .then_with(|| a.data.key.cmp(&b.data.key))
}

/// Order two issues by `spec`. Missing values sort first ascending, last
/// descending.
pub fn sort_cmp(spec: &SortSpec, a: &Issue, b: &Issue) -> Ordering {
    let primary = match spec.field.kind() {
        FieldKind::Key => a
            .data
            .project_key
            .cmp(&b.data.project_key)
            .then(a.data.key_number().cmp(&b.data.key_number())),
        FieldKind::Enum => coded(&spec.field, a).code.cmp(&coded(&spec.field, b).code),
        FieldKind::Date => field_date(&spec.field, a).cmp(&field_date(&spec.field, b)),
        FieldKind::Number => {
            let (x, y) = (field_number(&spec.field, a), field_number(&spec.field, b));
            match (x, y) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => x.is_some().cmp(&y.is_some()),
            }
        }
        _ => field_texts(&spec.field, a)
            .first()
            .map(|s| s.to_ascii_lowercase())
            .cmp(&field_texts(&spec.field, b).first().map(|s| s.to_ascii_lowercase())),
    };
    let primary = if spec.descending {
        primary.reverse()
    } else {
        primary
    };
    primary.then_with(|| tie_break(a, b))
}
