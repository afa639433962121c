//! Query engine: compile, bound, execute.
//!
//! Stateless apart from its settings; every call is a pure read against the
//! store it wraps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::fields::FieldCatalog;
use crate::models::Issue;
use crate::store::{MirrorStore, StoreError};

use super::{
    frontend_for, CompiledQuery, ExecOptions, Query, QueryError, QueryMode, ResultPage,
    Suggestion, MAX_QUERY_LEN,
};

/// Suggestions carry at most this many characters of summary.
const SUGGEST_SUMMARY_CHARS: usize = 100;

/// Minimum prefix length before suggestions are produced.
pub const SUGGEST_MIN_CHARS: usize = 2;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_limit: usize,
    /// Result count beyond which `refine_suggested` is set.
    pub ceiling: usize,
    /// Wall-clock bound for every pattern-mode query.
    pub pattern_timeout: Duration,
    pub suggest_limit: usize,
    /// Latency budget of one suggestion call, in every mode.
    pub suggest_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_limit: 50,
            ceiling: 10_000,
            pattern_timeout: Duration::from_secs(5),
            suggest_limit: 8,
            suggest_timeout: Duration::from_millis(1500),
        }
    }
}

/// One search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Query,
    pub limit: Option<usize>,
    pub offset: usize,
    pub include_deleted: bool,
    /// Caller-imposed deadline, applied to every mode.
    pub deadline: Option<Instant>,
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            limit: None,
            offset: 0,
            include_deleted: false,
            deadline: None,
        }
    }
}

pub struct QueryEngine<S> {
    store: Arc<S>,
    catalog: FieldCatalog,
    settings: EngineSettings,
}

impl<S: MirrorStore> QueryEngine<S> {
    pub fn new(store: Arc<S>, catalog: FieldCatalog, settings: EngineSettings) -> Self {
        Self {
            store,
            catalog,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn compile(&self, query: &Query) -> Result<CompiledQuery, QueryError> {
        check_length(&query.raw)?;
        frontend_for(query.mode).compile(&query.raw, &self.catalog)
    }

    /// Check a query for syntax errors without running it.
    pub fn validate(&self, query: &Query) -> Result<(), QueryError> {
        self.compile(query).map(|_| ())
    }

    /// Pattern queries always get the configured bound; the caller's
    /// deadline wins when it is earlier.
    fn effective_deadline(&self, mode: QueryMode, external: Option<Instant>) -> Option<Instant> {
        if mode != QueryMode::Regex {
            return external;
        }
        let bound = Instant::now() + self.settings.pattern_timeout;
        Some(external.map_or(bound, |d| d.min(bound)))
    }

    /// Execute an already compiled query.
    pub async fn execute(
        &self,
        compiled: &CompiledQuery,
        mut opts: ExecOptions,
    ) -> Result<ResultPage, QueryError> {
        opts.deadline = self.effective_deadline(compiled.mode, opts.deadline);
        self.store.execute(compiled, &opts).await
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<ResultPage, QueryError> {
        let compiled = self.compile(&req.query)?;
        let opts = ExecOptions {
            limit: req.limit.unwrap_or(self.settings.default_limit),
            offset: req.offset,
            include_deleted: req.include_deleted,
            deadline: req.deadline,
            ceiling: self.settings.ceiling,
        };
        self.execute(&compiled, opts).await
    }

    /// Type-ahead suggestions for a short prefix.
    ///
    /// Runs the mode's normal execution path with a small limit, then moves
    /// entries whose key or summary starts with the prefix to the front.
    /// Prefixes that do not (yet) compile yield no suggestions.
    pub async fn suggest(
        &self,
        prefix: &str,
        mode: QueryMode,
    ) -> Result<Vec<Suggestion>, QueryError> {
        let deadline = Instant::now() + self.settings.suggest_timeout;
        let prefix = prefix.trim();
        if prefix.chars().count() < SUGGEST_MIN_CHARS || prefix.len() > MAX_QUERY_LEN {
            return Ok(Vec::new());
        }
        let compiled = match frontend_for(mode).compile_suggest(prefix, &self.catalog) {
            Ok(c) => c,
            Err(QueryError::Syntax { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let opts = ExecOptions {
            limit: self.settings.suggest_limit * 4,
            offset: 0,
            include_deleted: false,
            deadline: Some(deadline),
            ceiling: self.settings.ceiling,
        };
        let page = self.execute(&compiled, opts).await?;

        let lower = prefix.to_lowercase();
        let weight = |key: &str, summary: &str| {
            if key.to_lowercase().starts_with(&lower) {
                0
            } else if summary.to_lowercase().starts_with(&lower) {
                1
            } else {
                2
            }
        };
        let mut items = page.items;
        // Stable: keeps the engine's own order within each weight class.
        items.sort_by_key(|i| weight(&i.key, &i.summary));

        Ok(items
            .into_iter()
            .take(self.settings.suggest_limit)
            .map(|i| Suggestion {
                summary: i.summary.chars().take(SUGGEST_SUMMARY_CHARS).collect(),
                key: i.key,
                assignee: i.assignee,
            })
            .collect())
    }

    /// Full issue by key, including tombstoned ones.
    pub async fn issue(&self, key: &str) -> Result<Option<Issue>, StoreError> {
        self.store.get_issue(&key.trim().to_uppercase()).await
    }
}

fn check_length(raw: &str) -> Result<(), QueryError> {
    if raw.len() > MAX_QUERY_LEN {
        return Err(QueryError::syntax(
            MAX_QUERY_LEN,
            format!("query is longer than {} bytes", MAX_QUERY_LEN),
        ));
    }
    Ok(())
}
