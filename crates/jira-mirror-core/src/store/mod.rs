//! Storage abstraction for Jira Mirror.
//!
//! The [`MirrorStore`] trait owns issues and their search entries; the
//! [`CheckpointStore`] trait owns sync resume state and run history. The
//! sync orchestrator and the query engine only ever talk to these traits,
//! so SQLite and in-memory backends are interchangeable.
//!
//! Every backend must provide:
//!
//! - **Batch atomicity**: [`upsert_batch`](MirrorStore::upsert_batch) applies
//!   all of a batch or none of it.
//! - **Monotonicity**: an issue whose `updated` is older than the stored one
//!   never overwrites it.
//! - **Search consistency**: the search entry for a key is rebuilt inside the
//!   same write as the issue itself.
//! - **Read isolation**: a query sees each batch either fully applied or not
//!   at all.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Issue, NormalizedIssue, SyncCheckpoint, SyncRunRecord};
use crate::query::{CompiledQuery, ExecOptions, QueryError, ResultPage};
use crate::reconcile::LocalState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store read failed: {0}")]
    Read(String),
}

/// One page worth of writes for a sync run.
#[derive(Debug, Clone, Copy)]
pub struct IssueBatch<'a> {
    /// Scope id the issues belong to.
    pub scope: &'a str,
    pub run_id: &'a str,
    /// New and updated issues to apply.
    pub issues: &'a [NormalizedIssue],
    /// Every key the page returned. Recorded as seen by `run_id` so a full
    /// run can tell which stored keys disappeared remotely.
    pub observed: &'a [String],
}

#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Stored `updated` and tombstone flag for the given keys. Keys that are
    /// not stored are absent from the map.
    async fn local_states(&self, keys: &[String])
        -> Result<HashMap<String, LocalState>, StoreError>;

    /// Apply a batch atomically. Returns how many issues were written; issues
    /// older than the stored copy are not counted.
    async fn upsert_batch(&self, batch: &IssueBatch<'_>) -> Result<usize, StoreError>;

    /// Mark issues deleted without removing them. Returns how many live
    /// issues were tombstoned.
    async fn tombstone(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Recompute the search entry of one issue from its stored record.
    /// Returns `false` when the key is unknown.
    async fn rebuild_search_entry(&self, key: &str) -> Result<bool, StoreError>;

    /// Live (non-tombstoned) keys belonging to `scope`.
    async fn scope_keys(&self, scope: &str) -> Result<HashSet<String>, StoreError>;

    /// Keys of `scope` observed by sync run `run_id`.
    async fn seen_keys(&self, scope: &str, run_id: &str) -> Result<HashSet<String>, StoreError>;

    /// Fetch one issue by key, tombstoned or not.
    async fn get_issue(&self, key: &str) -> Result<Option<Issue>, StoreError>;

    /// Run a compiled query. Read-only.
    async fn execute(
        &self,
        query: &CompiledQuery,
        opts: &ExecOptions,
    ) -> Result<ResultPage, QueryError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, scope: &str) -> Result<Option<SyncCheckpoint>, StoreError>;

    /// Persist resume state. Callers only do this after the batch it
    /// describes has been committed.
    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError>;

    /// Insert or update a run history row.
    async fn record_run(&self, run: &SyncRunRecord) -> Result<(), StoreError>;

    async fn last_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StoreError>;

    /// Take the single writer lease. Returns `false` while another holder's
    /// lease is still within its `ttl`.
    async fn try_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn release_lease(&self, holder: &str) -> Result<(), StoreError>;
}
