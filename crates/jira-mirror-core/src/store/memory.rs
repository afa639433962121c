//! In-memory [`MirrorStore`] and [`CheckpointStore`] for tests and embedding.
//!
//! All state sits behind one `RwLock`, so a batch is applied under a single
//! write guard and readers observe it whole or not at all. Free-text ranking
//! computes BM25 over the stored token lists.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Issue, IssueSummary, SyncCheckpoint, SyncRunRecord};
use crate::query::eval::{sort_cmp, tie_break};
use crate::query::text::{bm25, tokenize, CorpusStats};
use crate::query::{CompiledQuery, ExecOptions, QueryError, Ranking, ResultPage};
use crate::reconcile::LocalState;

use super::{CheckpointStore, IssueBatch, MirrorStore, StoreError};

struct StoredIssue {
    issue: Issue,
    scope: String,
    last_seen_run: Option<String>,
    /// Search entry: tokens of the issue's search text.
    tokens: Vec<String>,
}

#[derive(Default)]
struct State {
    issues: HashMap<String, StoredIssue>,
    checkpoints: HashMap<String, SyncCheckpoint>,
    runs: Vec<SyncRunRecord>,
    lease: Option<(String, DateTime<Utc>)>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    fail_writes: RwLock<bool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with [`StoreError::Write`] until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut f) = self.fail_writes.write() {
            *f = fail;
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Read("lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        if self.fail_writes.read().map(|f| *f).unwrap_or(false) {
            return Err(StoreError::Write("writes disabled".into()));
        }
        self.state
            .write()
            .map_err(|_| StoreError::Write("lock poisoned".into()))
    }
}

fn timed_out(started: Instant) -> QueryError {
    QueryError::Timeout {
        elapsed: started.elapsed(),
    }
}

#[async_trait]
impl MirrorStore for InMemoryStore {
    async fn local_states(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, LocalState>, StoreError> {
        let state = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|k| {
                state.issues.get(k).map(|s| {
                    (
                        k.clone(),
                        LocalState {
                            updated: s.issue.data.updated,
                            deleted: s.issue.deleted,
                        },
                    )
                })
            })
            .collect())
    }

    async fn upsert_batch(&self, batch: &IssueBatch<'_>) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut applied = 0;
        for issue in batch.issues {
            if let Some(existing) = state.issues.get(&issue.key) {
                if issue.updated < existing.issue.data.updated {
                    continue;
                }
            }
            let tokens = tokenize(&issue.search_text());
            state.issues.insert(
                issue.key.clone(),
                StoredIssue {
                    issue: Issue {
                        data: issue.clone(),
                        deleted: false,
                        deleted_at: None,
                        synced_at: now,
                    },
                    scope: batch.scope.to_string(),
                    last_seen_run: Some(batch.run_id.to_string()),
                    tokens,
                },
            );
            applied += 1;
        }
        for key in batch.observed {
            if let Some(stored) = state.issues.get_mut(key) {
                stored.scope = batch.scope.to_string();
                stored.last_seen_run = Some(batch.run_id.to_string());
            }
        }
        Ok(applied)
    }

    async fn tombstone(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut count = 0;
        for key in keys {
            if let Some(stored) = state.issues.get_mut(key) {
                if !stored.issue.deleted {
                    stored.issue.deleted = true;
                    stored.issue.deleted_at = Some(now);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn rebuild_search_entry(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.issues.get_mut(key) {
            Some(stored) => {
                stored.tokens = tokenize(&stored.issue.data.search_text());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scope_keys(&self, scope: &str) -> Result<HashSet<String>, StoreError> {
        let state = self.read()?;
        Ok(state
            .issues
            .values()
            .filter(|s| s.scope == scope && !s.issue.deleted)
            .map(|s| s.issue.data.key.clone())
            .collect())
    }

    async fn seen_keys(&self, scope: &str, run_id: &str) -> Result<HashSet<String>, StoreError> {
        let state = self.read()?;
        Ok(state
            .issues
            .values()
            .filter(|s| s.scope == scope && s.last_seen_run.as_deref() == Some(run_id))
            .map(|s| s.issue.data.key.clone())
            .collect())
    }

    async fn get_issue(&self, key: &str) -> Result<Option<Issue>, StoreError> {
        let state = self.read()?;
        Ok(state.issues.get(key).map(|s| s.issue.clone()))
    }

    async fn execute(
        &self,
        query: &CompiledQuery,
        opts: &ExecOptions,
    ) -> Result<ResultPage, QueryError> {
        let started = Instant::now();
        let state = self.read()?;

        let mut matched: Vec<&StoredIssue> = Vec::new();
        for stored in state.issues.values() {
            if opts.expired() {
                return Err(timed_out(started));
            }
            if stored.issue.deleted && !opts.include_deleted {
                continue;
            }
            if query.predicate.matches(&stored.issue) {
                matched.push(stored);
            }
        }

        let mut scored: Vec<(&StoredIssue, Option<f64>)> = match &query.ranking {
            Ranking::Relevance(text) => {
                let stats = CorpusStats::build(
                    state
                        .issues
                        .values()
                        .filter(|s| !s.issue.deleted)
                        .map(|s| s.tokens.as_slice()),
                );
                let mut scored: Vec<_> = matched
                    .into_iter()
                    .map(|s| (s, Some(bm25(text, &s.tokens, &stats))))
                    .collect();
                let is_hint = |s: &StoredIssue| {
                    text.key_hint.as_deref() == Some(s.issue.data.key.as_str())
                };
                scored.sort_by(|(a, sa), (b, sb)| {
                    is_hint(b)
                        .cmp(&is_hint(a))
                        .then_with(|| {
                            sb.unwrap_or(0.0)
                                .partial_cmp(&sa.unwrap_or(0.0))
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .then_with(|| tie_break(&a.issue, &b.issue))
                });
                scored
            }
            Ranking::Sort(spec) => {
                matched.sort_by(|a, b| sort_cmp(spec, &a.issue, &b.issue));
                matched.into_iter().map(|s| (s, None)).collect()
            }
        };

        if opts.expired() {
            return Err(timed_out(started));
        }

        let total_matched = scored.len();
        let items = scored
            .drain(..)
            .skip(opts.offset)
            .take(opts.capped_limit())
            .map(|(s, score)| {
                let snippet = match &query.ranking {
                    Ranking::Relevance(text) => text.snippet(&s.issue.data),
                    Ranking::Sort(_) => None,
                };
                IssueSummary::from_issue(&s.issue, score, snippet)
            })
            .collect();

        Ok(ResultPage {
            items,
            total_matched,
            elapsed: started.elapsed(),
            refine_suggested: total_matched > opts.ceiling,
        })
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load_checkpoint(&self, scope: &str) -> Result<Option<SyncCheckpoint>, StoreError> {
        Ok(self.read()?.checkpoints.get(scope).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError> {
        self.write()?
            .checkpoints
            .insert(checkpoint.scope.clone(), checkpoint.clone());
        Ok(())
    }

    async fn record_run(&self, run: &SyncRunRecord) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => state.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn last_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StoreError> {
        let state = self.read()?;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn try_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Write("lock poisoned".into()))?;
        let now = Utc::now();
        let free = match &state.lease {
            None => true,
            Some((h, expires)) => h == holder || *expires <= now,
        };
        if free {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
            state.lease = Some((holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release_lease(&self, holder: &str) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Write("lock poisoned".into()))?;
        if state.lease.as_ref().is_some_and(|(h, _)| h == holder) {
            state.lease = None;
        }
        Ok(())
    }
}
