//! Sync orchestrator.
//!
//! Drives one run through `Idle → Fetching → Reconciling → Committing` per
//! page and back to `Idle` (or `Failed`). The order of writes is what makes
//! resume safe:
//!
//! 1. the page's batch is committed with [`MirrorStore::upsert_batch`];
//! 2. only then is the checkpoint cursor advanced past that page.
//!
//! A crash between the two re-delivers at most one page, and upserts are
//! idempotent. Deletion reconciliation runs only after a full enumeration,
//! and every key it would tombstone is first looked up on the remote.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jira_mirror_core::models::{
    ChangeCounts, QueryScope, RawIssue, RunState, SyncCheckpoint, SyncRunRecord, SyncType,
};
use jira_mirror_core::reconcile::{deleted_keys, Anomaly, Reconciler};
use jira_mirror_core::store::{CheckpointStore, IssueBatch, MirrorStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::MirrorError;
use crate::source::{GuardedSource, IssueSource};

/// A run that stops refreshing its lease for this long is presumed dead.
const LEASE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Reconciling,
    Committing,
    Failed,
}

impl SyncPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SyncPhase::Fetching,
            2 => SyncPhase::Reconciling,
            3 => SyncPhase::Committing,
            4 => SyncPhase::Failed,
            _ => SyncPhase::Idle,
        }
    }
}

/// Process-wide sync state: the single-active-run flag, the current phase
/// and the cancellation request. Shared by handle, never global.
#[derive(Debug, Default)]
pub struct SyncCoordinator {
    active: AtomicBool,
    phase: AtomicU8,
    cancel: AtomicBool,
}

/// Clears the active flag when the run ends, however it ends.
pub struct RunGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.active.store(false, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single run slot, or fail with `SyncAlreadyRunning`.
    pub fn try_begin(&self) -> Result<RunGuard<'_>, MirrorError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MirrorError::SyncAlreadyRunning);
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Idle);
        Ok(RunGuard { coordinator: self })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Ask the active run to stop before its next page.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub scope: String,
    pub sync_type: SyncType,
    pub resumed: bool,
    pub pages: u64,
    pub counts: ChangeCounts,
    pub watermark: Option<DateTime<Utc>>,
}

/// What a dry run would enumerate.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub scope: String,
    pub sync_type: SyncType,
    pub jql: String,
    pub total: Option<u64>,
}

pub struct SyncOrchestrator<S, St> {
    source: GuardedSource<S>,
    store: Arc<St>,
    settings: SyncSettings,
    coordinator: Arc<SyncCoordinator>,
    holder: String,
}

/// Mutable bookkeeping for the run in progress.
struct RunContext {
    scope: QueryScope,
    checkpoint: SyncCheckpoint,
    record: SyncRunRecord,
    pages: u64,
}

impl<S, St> SyncOrchestrator<S, St>
where
    S: IssueSource,
    St: MirrorStore + CheckpointStore,
{
    pub fn new(
        source: GuardedSource<S>,
        store: Arc<St>,
        settings: SyncSettings,
        coordinator: Arc<SyncCoordinator>,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            coordinator,
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    fn base_scope(&self) -> QueryScope {
        QueryScope::new(self.settings.scope.clone())
    }

    /// Decide the run type and scope from the stored checkpoint.
    async fn plan(&self, full: bool) -> Result<(SyncType, QueryScope, SyncCheckpoint), MirrorError> {
        let base = self.base_scope();
        let scope_id = base.id();
        let checkpoint = self
            .store
            .load_checkpoint(&scope_id)
            .await?
            .unwrap_or_else(|| SyncCheckpoint::empty(&scope_id));
        Ok(match (full, checkpoint.last_successful) {
            (false, Some(watermark)) => (
                SyncType::Incremental,
                base.with_watermark(watermark),
                checkpoint,
            ),
            _ => (SyncType::Full, base, checkpoint),
        })
    }

    /// Count what a run would fetch without writing anything.
    pub async fn dry_run(&self, full: bool) -> Result<DryRunReport, MirrorError> {
        let (sync_type, scope, _) = self.plan(full).await?;
        let page = self
            .source
            .fetch_page(&scope, None, 1)
            .await
            .map_err(|e| MirrorError::from_source(e, None))?;
        Ok(DryRunReport {
            scope: scope.id(),
            sync_type,
            jql: scope.to_jql(),
            total: page.total,
        })
    }

    /// Run one sync. Incremental unless `full` is set or no run of this
    /// scope has ever succeeded.
    pub async fn run(&self, full: bool) -> Result<SyncReport, MirrorError> {
        let _guard = self.coordinator.try_begin()?;
        if !self.store.try_lease(&self.holder, LEASE_TTL).await? {
            return Err(MirrorError::SyncAlreadyRunning);
        }

        let result = self.run_leased(full).await;

        if let Err(e) = self.store.release_lease(&self.holder).await {
            warn!(error = %e, "failed to release sync lease");
        }
        match &result {
            Ok(_) => self.coordinator.set_phase(SyncPhase::Idle),
            Err(_) => self.coordinator.set_phase(SyncPhase::Failed),
        }
        result
    }

    async fn run_leased(&self, full: bool) -> Result<SyncReport, MirrorError> {
        let (sync_type, scope, previous) = self.plan(full).await?;
        let scope_id = scope.id();

        // An interrupted run of the same type continues where it stopped,
        // with its original run id, start time and watermark.
        let resume = match (&previous.run_id, previous.run_started_at) {
            (Some(id), Some(started)) if previous.in_progress && previous.sync_type == sync_type => {
                Some((id.clone(), started, previous.cursor))
            }
            _ => None,
        };
        let resumed = resume.is_some();
        let (run_id, started_at, cursor) =
            resume.unwrap_or_else(|| (uuid::Uuid::new_v4().to_string(), Utc::now(), None));

        let checkpoint = SyncCheckpoint {
            scope: scope_id.clone(),
            last_successful: previous.last_successful,
            cursor,
            sync_type,
            run_id: Some(run_id.clone()),
            run_started_at: Some(started_at),
            in_progress: true,
        };
        self.store.save_checkpoint(&checkpoint).await?;

        let record = SyncRunRecord {
            id: run_id.clone(),
            scope: scope_id.clone(),
            sync_type,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Running,
            counts: ChangeCounts::default(),
            error: None,
        };
        self.store.record_run(&record).await?;

        info!(
            scope = %scope_id,
            run_id = %run_id,
            sync_type = sync_type.as_str(),
            resumed,
            cursor = ?cursor,
            "sync started"
        );

        let mut ctx = RunContext {
            scope,
            checkpoint,
            record,
            pages: 0,
        };
        let outcome = self.drive(&mut ctx).await;

        ctx.record.finished_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                ctx.record.state = RunState::Succeeded;
            }
            Err(MirrorError::Cancelled) => {
                ctx.record.state = RunState::Cancelled;
                ctx.record.error = Some("cancelled".to_string());
            }
            Err(e) => {
                ctx.record.state = RunState::Failed;
                ctx.record.error = Some(e.to_string());
            }
        }
        if let Err(e) = self.store.record_run(&ctx.record).await {
            warn!(error = %e, run_id = %run_id, "failed to record sync run");
        }

        match outcome {
            Ok(()) => {
                info!(
                    scope = %scope_id,
                    run_id = %run_id,
                    pages = ctx.pages,
                    fetched = ctx.record.counts.fetched,
                    new = ctx.record.counts.new,
                    updated = ctx.record.counts.updated,
                    unchanged = ctx.record.counts.unchanged,
                    skipped = ctx.record.counts.skipped,
                    deleted = ctx.record.counts.deleted,
                    "sync finished"
                );
                Ok(SyncReport {
                    run_id,
                    scope: scope_id,
                    sync_type,
                    resumed,
                    pages: ctx.pages,
                    counts: ctx.record.counts,
                    watermark: ctx.checkpoint.last_successful,
                })
            }
            Err(e) => {
                warn!(
                    scope = %scope_id,
                    run_id = %run_id,
                    cursor = ?ctx.checkpoint.cursor,
                    error = %e,
                    "sync failed; checkpoint kept at last committed page"
                );
                Err(e)
            }
        }
    }

    /// The page loop plus end-of-run bookkeeping.
    async fn drive(&self, ctx: &mut RunContext) -> Result<(), MirrorError> {
        let reconciler = Reconciler::new(self.settings.catalog.clone());
        let scope_id = ctx.checkpoint.scope.clone();
        let run_id = ctx.record.id.clone();

        // Total reported by the previous page of this run, to spot
        // deletions that shift later issues below the cursor.
        let mut last_total: Option<u64> = None;
        loop {
            if self.coordinator.cancel_requested() {
                info!(scope = %scope_id, cursor = ?ctx.checkpoint.cursor, "sync cancelled between pages");
                return Err(MirrorError::Cancelled);
            }

            self.coordinator.set_phase(SyncPhase::Fetching);
            let cursor = ctx.checkpoint.cursor;
            let page = self
                .source
                .fetch_page(&ctx.scope, cursor, self.settings.batch_size)
                .await
                .map_err(|e| MirrorError::from_source(e, cursor))?;

            let (applied, counts) = self.apply(&reconciler, &page.issues, &scope_id, &run_id).await?;

            // Committed: the cursor may now move past this page.
            ctx.record.counts.absorb(&counts);
            ctx.pages += 1;
            let shrunk_by = match (last_total, page.total) {
                (Some(before), Some(now)) if now < before => before - now,
                _ => 0,
            };
            last_total = page.total.or(last_total);
            let next_cursor = match cursor {
                // Issues before this page were removed after the previous
                // page was served: step back so none slips under the cursor.
                Some(start) if shrunk_by > 0 => {
                    let rewound = start.saturating_sub(shrunk_by);
                    debug!(shrunk_by, from = start, to = rewound, "remote scope shrank, rewinding cursor");
                    Some(rewound)
                }
                _ => page.next_cursor,
            };
            ctx.checkpoint.cursor = next_cursor;
            self.store.save_checkpoint(&ctx.checkpoint).await?;
            debug!(
                page = ctx.pages,
                fetched = counts.fetched,
                applied,
                next_cursor = ?next_cursor,
                "page committed"
            );

            if next_cursor.is_none() {
                break;
            }
            if !self.store.try_lease(&self.holder, LEASE_TTL).await? {
                return Err(MirrorError::SyncAlreadyRunning);
            }
        }

        if ctx.record.sync_type == SyncType::Full {
            let stored = self.store.scope_keys(&scope_id).await?;
            let seen = self.store.seen_keys(&scope_id, &run_id).await?;
            let candidates = deleted_keys(&stored, &seen);
            let gone = self.confirm_missing(ctx, &reconciler, candidates).await?;
            if !gone.is_empty() {
                let n = self.store.tombstone(&gone).await?;
                info!(scope = %scope_id, tombstoned = n, "issues missing from full sync tombstoned");
                ctx.record.counts.deleted += n as u64;
            }
        }

        // Run start, not completion: changes made during the run are
        // picked up by the next incremental run.
        ctx.checkpoint.last_successful = ctx.checkpoint.run_started_at;
        ctx.checkpoint.cursor = None;
        ctx.checkpoint.in_progress = false;
        self.store.save_checkpoint(&ctx.checkpoint).await?;
        Ok(())
    }

    /// Reconcile and commit one set of remote records. Returns the number of
    /// rows written and the page's counters.
    async fn apply(
        &self,
        reconciler: &Reconciler,
        raws: &[RawIssue],
        scope_id: &str,
        run_id: &str,
    ) -> Result<(usize, ChangeCounts), MirrorError> {
        self.coordinator.set_phase(SyncPhase::Reconciling);
        let keys: Vec<String> = raws
            .iter()
            .filter_map(|r| r.key().map(str::to_string))
            .collect();
        let local = self.store.local_states(&keys).await?;
        let changes = reconciler.reconcile_page(raws, &local);
        log_anomalies(&changes.anomalies);

        self.coordinator.set_phase(SyncPhase::Committing);
        let batch = IssueBatch {
            scope: scope_id,
            run_id,
            issues: &changes.upserts,
            observed: &changes.observed,
        };
        let applied = self.commit(&batch).await?;
        if applied != changes.upserts.len() {
            debug!(
                applied,
                planned = changes.upserts.len(),
                "store kept newer copies of some issues"
            );
        }
        Ok((applied, changes.counts))
    }

    /// Ask the remote about each key a full enumeration did not return.
    ///
    /// Paging is by offset, so an issue can be missed when the remote
    /// changes under a run. Anything the remote still returns is applied
    /// and kept; only keys it no longer knows in this scope are returned.
    async fn confirm_missing(
        &self,
        ctx: &mut RunContext,
        reconciler: &Reconciler,
        candidates: Vec<String>,
    ) -> Result<Vec<String>, MirrorError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let scope_id = ctx.checkpoint.scope.clone();
        let run_id = ctx.record.id.clone();
        let base = self.base_scope();
        let mut gone = Vec::new();
        for chunk in candidates.chunks(self.settings.batch_size.max(1)) {
            self.coordinator.set_phase(SyncPhase::Fetching);
            let found = self
                .source
                .fetch_keys(&base, chunk)
                .await
                .map_err(|e| MirrorError::from_source(e, ctx.checkpoint.cursor))?;
            let present: HashSet<&str> = found.iter().filter_map(RawIssue::key).collect();
            if !present.is_empty() {
                info!(
                    scope = %scope_id,
                    recovered = present.len(),
                    "issues missed while paging are still present remotely"
                );
            }
            gone.extend(chunk.iter().filter(|k| !present.contains(k.as_str())).cloned());
            if !found.is_empty() {
                let (_, counts) = self.apply(reconciler, &found, &scope_id, &run_id).await?;
                ctx.record.counts.absorb(&counts);
            }
        }
        Ok(gone)
    }

    /// Commit one batch, retrying failed writes at batch granularity.
    async fn commit(&self, batch: &IssueBatch<'_>) -> Result<usize, MirrorError> {
        let policy = &self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.upsert_batch(batch).await {
                Ok(n) => return Ok(n),
                Err(StoreError::Write(reason)) if attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "batch commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn log_anomalies(anomalies: &[Anomaly]) {
    for anomaly in anomalies {
        match anomaly {
            Anomaly::Stale {
                key,
                stored,
                remote,
            } => warn!(
                key = %key,
                stored = %stored,
                remote = %remote,
                "remote issue older than mirrored copy, skipped"
            ),
            Anomaly::Malformed { key, error } => warn!(
                key = key.as_deref().unwrap_or("<none>"),
                error = %error,
                "malformed remote issue, skipped"
            ),
        }
    }
}
