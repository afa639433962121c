//! Error types surfaced at the application boundary.
//!
//! Library layers return their own typed errors ([`SourceError`],
//! [`StoreError`], [`QueryError`]); the sync orchestrator and the HTTP
//! server fold them into [`MirrorError`] so callers can branch on the kind.

use std::time::Duration;

use jira_mirror_core::query::QueryError;
use jira_mirror_core::store::StoreError;
use thiserror::Error;

use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Retries exhausted. The checkpoint still points at `cursor`, so the
    /// next run resumes there.
    #[error("remote source unavailable at cursor {cursor:?} after {attempts} attempts: {reason}")]
    SourceUnavailable {
        cursor: Option<u64>,
        attempts: u32,
        reason: String,
    },

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("store read failed: {0}")]
    StoreRead(String),

    #[error("syntax error at position {position}: {reason}")]
    QuerySyntax { position: usize, reason: String },

    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("a sync is already running")]
    SyncAlreadyRunning,

    #[error("sync cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for MirrorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Write(m) => MirrorError::StoreWrite(m),
            StoreError::Read(m) => MirrorError::StoreRead(m),
        }
    }
}

impl From<QueryError> for MirrorError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Syntax { position, reason } => MirrorError::QuerySyntax { position, reason },
            QueryError::Timeout { elapsed } => MirrorError::QueryTimeout(elapsed),
            QueryError::Store(s) => s.into(),
        }
    }
}

impl MirrorError {
    /// Fold a source failure into the boundary error, recording the cursor
    /// the run was trying to fetch.
    pub(crate) fn from_source(e: SourceError, cursor: Option<u64>) -> Self {
        match e {
            SourceError::Auth(m) => MirrorError::Authentication(m),
            SourceError::Exhausted { attempts, reason } => MirrorError::SourceUnavailable {
                cursor,
                attempts,
                reason,
            },
            other => MirrorError::SourceUnavailable {
                cursor,
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }
}
