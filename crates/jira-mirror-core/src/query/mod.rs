//! Query language: three front-ends, one predicate.
//!
//! Free-text, structured (a JQL subset) and pattern (regex) queries each
//! compile into a [`CompiledQuery`]: a [`Predicate`] tree plus a
//! [`Ranking`]. Stores execute compiled queries without knowing which
//! front-end produced them.
//!
//! | Mode | Front-end | Ranking |
//! |------|-----------|---------|
//! | `natural` | [`text::FreeText`] | BM25 relevance |
//! | `jql` | [`structured::Structured`] | `ORDER BY` clause, default `updated DESC` |
//! | `regex` | [`pattern::Pattern`] | `updated DESC` |

pub mod engine;
pub mod eval;
pub mod pattern;
pub mod structured;
pub mod text;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::fields::{Field, FieldCatalog};
use crate::models::IssueSummary;
use crate::store::StoreError;

pub use engine::{EngineSettings, QueryEngine};
pub use pattern::PatternQuery;
pub use text::TextQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Natural,
    Jql,
    Regex,
}

impl QueryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "natural" | "text" => Some(QueryMode::Natural),
            "jql" | "structured" => Some(QueryMode::Jql),
            "regex" | "pattern" => Some(QueryMode::Regex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Natural => "natural",
            QueryMode::Jql => "jql",
            QueryMode::Regex => "regex",
        }
    }
}

/// Longest query text, in bytes, any mode accepts.
pub const MAX_QUERY_LEN: usize = 4096;

/// A query as the user wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub mode: QueryMode,
    pub raw: String,
}

impl Query {
    pub fn new(mode: QueryMode, raw: impl Into<String>) -> Self {
        Self {
            mode,
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    /// Rejected before execution. `position` is a byte offset into the query.
    #[error("syntax error at position {position}: {reason}")]
    Syntax { position: usize, reason: String },
    #[error("query timed out after {elapsed:?}; try a more specific query")]
    Timeout { elapsed: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn syntax(position: usize, reason: impl Into<String>) -> Self {
        QueryError::Syntax {
            position,
            reason: reason.into(),
        }
    }
}

/// A typed comparison value.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
    /// Enum label plus its normalized code (0 when the label is unknown).
    Enum { code: i64, label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    NotContains,
}

impl CompareOp {
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge
        )
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    /// Matches every issue.
    All,
    /// Matches nothing.
    Nothing,
    Compare {
        field: Field,
        op: CompareOp,
        value: Operand,
    },
    In {
        field: Field,
        values: Vec<Operand>,
        negated: bool,
    },
    Empty {
        field: Field,
        negated: bool,
    },
    Text(TextQuery),
    Pattern(PatternQuery),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Whether evaluating this predicate runs a regular expression.
    pub fn has_pattern(&self) -> bool {
        match self {
            Predicate::Pattern(_) => true,
            Predicate::And(ps) | Predicate::Or(ps) => ps.iter().any(Predicate::has_pattern),
            Predicate::Not(p) => p.has_pattern(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: Field,
    pub descending: bool,
}

impl SortSpec {
    pub fn updated_desc() -> Self {
        Self {
            field: Field::Updated,
            descending: true,
        }
    }
}

/// How matches are ordered. Every ordering ends with `updated DESC, key ASC`
/// as the tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ranking {
    /// Relevance score of the predicate's [`TextQuery`].
    Relevance(TextQuery),
    Sort(SortSpec),
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub mode: QueryMode,
    pub source: String,
    pub predicate: Predicate,
    pub ranking: Ranking,
}

/// Per-call execution parameters.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub limit: usize,
    pub offset: usize,
    pub include_deleted: bool,
    /// Abort with [`QueryError::Timeout`] once this instant passes.
    pub deadline: Option<Instant>,
    /// Results beyond this many are not returned; `refine_suggested` is set.
    pub ceiling: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            include_deleted: false,
            deadline: None,
            ceiling: 10_000,
        }
    }
}

impl ExecOptions {
    /// The page size after applying the ceiling.
    pub fn capped_limit(&self) -> usize {
        self.limit.min(self.ceiling.saturating_sub(self.offset))
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// One page of ranked results.
#[derive(Debug, Clone, Serialize)]
pub struct ResultPage {
    pub items: Vec<IssueSummary>,
    pub total_matched: usize,
    #[serde(serialize_with = "serialize_millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
    pub refine_suggested: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A type-ahead entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub key: String,
    pub summary: String,
    pub assignee: Option<String>,
}

/// Compiles one query mode into the common predicate form.
pub trait QueryFrontend: Send + Sync {
    fn mode(&self) -> QueryMode;

    /// Compile a full query. Syntax errors are reported here, before any
    /// row is read.
    fn compile(&self, raw: &str, catalog: &FieldCatalog) -> Result<CompiledQuery, QueryError>;

    /// Compile a type-ahead prefix. Front-ends that can relax matching for
    /// partial input (prefix terms) do so here.
    fn compile_suggest(
        &self,
        prefix: &str,
        catalog: &FieldCatalog,
    ) -> Result<CompiledQuery, QueryError> {
        self.compile(prefix, catalog)
    }
}

pub fn frontend_for(mode: QueryMode) -> Box<dyn QueryFrontend> {
    match mode {
        QueryMode::Natural => Box::new(text::FreeText),
        QueryMode::Jql => Box::new(structured::Structured),
        QueryMode::Regex => Box::new(pattern::Pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(QueryMode::parse("JQL"), Some(QueryMode::Jql));
        assert_eq!(QueryMode::parse("pattern"), Some(QueryMode::Regex));
        assert_eq!(QueryMode::parse("fuzzy"), None);
    }

    #[test]
    fn test_capped_limit() {
        let opts = ExecOptions {
            limit: 50,
            offset: 9_980,
            ceiling: 10_000,
            ..Default::default()
        };
        assert_eq!(opts.capped_limit(), 20);
        let past = ExecOptions {
            offset: 20_000,
            ..opts
        };
        assert_eq!(past.capped_limit(), 0);
    }
}
