//! Sync orchestrator against a temp SQLite store and a scripted source.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jira_mirror::error::MirrorError;
use jira_mirror::source::{GuardedSource, IssueSource, SourceError, SourceIdentity, SourcePage};
use jira_mirror::sqlite_store::SqliteStore;
use jira_mirror::sync::{SyncCoordinator, SyncOrchestrator, SyncPhase};
use jira_mirror_core::fields::FieldCatalog;
use jira_mirror_core::models::{QueryScope, RawIssue, RunState, SyncType};
use jira_mirror_core::query::engine::SearchRequest;
use jira_mirror_core::query::{EngineSettings, Query, QueryEngine, QueryMode};
use jira_mirror_core::normalize::normalize;
use jira_mirror_core::store::{CheckpointStore, IssueBatch, MirrorStore};
use serde_json::json;

use common::{at, later, raw, settings, temp_store, with, ScriptedSource};

const SCOPE: &str = "project:PROJ";

fn orchestrator<S: IssueSource>(
    source: S,
    store: &Arc<SqliteStore>,
    batch_size: usize,
) -> SyncOrchestrator<S, SqliteStore> {
    let settings = settings(batch_size);
    let guarded = GuardedSource::new(source, settings.rate_limit_per_minute, settings.retry.clone());
    SyncOrchestrator::new(
        guarded,
        store.clone(),
        settings,
        Arc::new(SyncCoordinator::new()),
    )
}

fn engine(store: &Arc<SqliteStore>) -> QueryEngine<SqliteStore> {
    QueryEngine::new(store.clone(), FieldCatalog::default(), EngineSettings::default())
}

/// Five issues with strictly increasing `updated`, so page order is fixed.
fn five() -> Vec<RawIssue> {
    (1..=5)
        .map(|n| {
            raw(
                &format!("PROJ-{}", n),
                &format!("Issue number {}", n),
                at(&format!("2024-03-0{}T10:00:00Z", n)),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_first_sync_is_full_and_sets_watermark() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source.clone(), &store, 2);

    let before = chrono::Utc::now();
    let report = orch.run(false).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(report.counts.new, 5);
    assert_eq!(report.pages, 3);
    assert_eq!(source.cursors(), vec![None, Some(2), Some(4)]);

    let cp = store.load_checkpoint(SCOPE).await.unwrap().unwrap();
    assert!(!cp.in_progress);
    assert_eq!(cp.cursor, None);
    let watermark = cp.last_successful.unwrap();
    assert!(watermark >= before - chrono::Duration::seconds(1));
    assert!(watermark <= chrono::Utc::now());

    // Next run without --full is incremental from that watermark.
    let report = orch.run(false).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Incremental);
    assert_eq!(source.watermarks().last().copied().flatten(), Some(watermark));
    assert_eq!(orch.coordinator().phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn test_incremental_update_then_nothing_new() {
    let (_tmp, store) = temp_store().await;
    let t1 = at("2024-03-01T10:00:00Z");
    let source = ScriptedSource::new(vec![raw("PROJ-1", "Original", t1)]);
    let orch = orchestrator(source.clone(), &store, 10);
    orch.run(true).await.unwrap();

    let t2 = later(1);
    source.put(raw("PROJ-1", "Edited remotely", t2));
    let report = orch.run(false).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Incremental);
    assert_eq!(report.counts.updated, 1);

    let issue = store.get_issue("PROJ-1").await.unwrap().unwrap();
    assert_eq!(issue.data.summary, "Edited remotely");
    assert_eq!(issue.data.updated.timestamp(), t2.timestamp());

    // Same incremental again: whatever is re-fetched is unchanged.
    let report = orch.run(false).await.unwrap();
    assert_eq!(report.counts.new + report.counts.updated, 0);
}

#[tokio::test]
async fn test_full_sync_tombstones_missing_issues() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(vec![
        raw("PROJ-1", "Alpha", at("2024-03-01T10:00:00Z")),
        raw("PROJ-2", "Bravo", at("2024-03-02T10:00:00Z")),
        raw("PROJ-3", "Charlie", at("2024-03-03T10:00:00Z")),
    ]);
    let orch = orchestrator(source.clone(), &store, 10);
    orch.run(true).await.unwrap();

    source.remove("PROJ-3");
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.deleted, 1);
    assert_eq!(store.issue_counts().await.unwrap(), (2, 1));

    let engine = engine(&store);
    let page = engine
        .search(&SearchRequest::new(Query::new(QueryMode::Natural, "PROJ-3")))
        .await
        .unwrap();
    assert!(page.items.iter().all(|i| i.key != "PROJ-3"));

    let gone = engine.issue("proj-3").await.unwrap().unwrap();
    assert!(gone.deleted);
    assert!(gone.deleted_at.is_some());
    assert_eq!(gone.data.summary, "Charlie");

    let with_deleted = engine
        .search(&SearchRequest {
            include_deleted: true,
            ..SearchRequest::new(Query::new(QueryMode::Natural, "charlie"))
        })
        .await
        .unwrap();
    assert_eq!(with_deleted.items.len(), 1);
    assert!(with_deleted.items[0].deleted);
}

#[tokio::test]
async fn test_incremental_sync_never_tombstones() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source.clone(), &store, 10);
    orch.run(true).await.unwrap();

    source.remove("PROJ-2");
    let report = orch.run(false).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Incremental);
    assert_eq!(report.counts.deleted, 0);
    assert!(!store.get_issue("PROJ-2").await.unwrap().unwrap().deleted);
}

#[tokio::test]
async fn test_reappearing_issue_clears_tombstone() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source.clone(), &store, 10);
    orch.run(true).await.unwrap();

    source.remove("PROJ-4");
    orch.run(true).await.unwrap();
    assert!(store.get_issue("PROJ-4").await.unwrap().unwrap().deleted);

    source.put(raw("PROJ-4", "Issue number 4", at("2024-03-04T10:00:00Z")));
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.updated, 1);
    let back = store.get_issue("PROJ-4").await.unwrap().unwrap();
    assert!(!back.deleted);
    assert!(back.deleted_at.is_none());
}

#[tokio::test]
async fn test_repeated_full_sync_is_idempotent() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source, &store, 2);
    orch.run(true).await.unwrap();
    let first = store.get_issue("PROJ-3").await.unwrap().unwrap();

    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.new, 0);
    assert_eq!(report.counts.updated, 0);
    assert_eq!(report.counts.unchanged, 5);
    assert_eq!(report.counts.deleted, 0);
    assert_eq!(store.issue_counts().await.unwrap(), (5, 0));

    let again = store.get_issue("PROJ-3").await.unwrap().unwrap();
    assert_eq!(first.data, again.data);
}

#[tokio::test]
async fn test_older_remote_copy_is_skipped() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(vec![raw("PROJ-1", "Newer", at("2024-05-01T00:00:00Z"))]);
    let orch = orchestrator(source.clone(), &store, 10);
    orch.run(true).await.unwrap();

    source.put(raw("PROJ-1", "Older", at("2024-04-01T00:00:00Z")));
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(report.counts.updated, 0);

    let issue = store.get_issue("PROJ-1").await.unwrap().unwrap();
    assert_eq!(issue.data.summary, "Newer");
    // Skipped, not missing: still observed, so not tombstoned.
    assert!(!issue.deleted);
}

#[tokio::test]
async fn test_malformed_record_does_not_abort_page() {
    let (_tmp, store) = temp_store().await;
    let mut issues = five();
    issues.push(with(
        raw("PROJ-6", "Broken", at("2024-03-06T10:00:00Z")),
        "updated",
        json!("not a date"),
    ));
    let orch = orchestrator(ScriptedSource::new(issues), &store, 10);
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.new, 5);
    assert_eq!(report.counts.skipped, 1);
    assert!(store.get_issue("PROJ-6").await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_full_sync_resumes_and_tombstones() {
    let (_tmp, store) = temp_store().await;
    let mut issues = five();
    issues.push(raw("PROJ-9", "Doomed", at("2024-03-09T10:00:00Z")));
    let source = ScriptedSource::new(issues);
    let orch = orchestrator(source.clone(), &store, 2);
    orch.run(true).await.unwrap();

    source.remove("PROJ-9");
    source.fail_at(
        2,
        SourceError::Rejected {
            status: 400,
            body: "bad".into(),
        },
        1,
    );
    let err = orch.run(true).await.unwrap_err();
    match err {
        MirrorError::SourceUnavailable { cursor, .. } => assert_eq!(cursor, Some(2)),
        other => panic!("unexpected error: {other:?}"),
    }
    let cp = store.load_checkpoint(SCOPE).await.unwrap().unwrap();
    assert!(cp.in_progress);
    assert_eq!(cp.cursor, Some(2));
    assert_eq!(orch.coordinator().phase(), SyncPhase::Failed);

    let calls_before = source.calls();
    let report = orch.run(true).await.unwrap();
    assert!(report.resumed);
    assert_eq!(source.cursors()[calls_before], Some(2));
    assert_eq!(report.counts.fetched, 3);
    // PROJ-1 and PROJ-2 were observed before the interruption.
    assert_eq!(report.counts.deleted, 1);
    assert!(store.get_issue("PROJ-9").await.unwrap().unwrap().deleted);
    assert!(!store.get_issue("PROJ-1").await.unwrap().unwrap().deleted);

    let runs = store.last_runs(5).await.unwrap();
    assert_eq!(runs[0].id, report.run_id);
    assert_eq!(runs[0].state, RunState::Succeeded);
}

#[tokio::test]
async fn test_failed_run_keeps_previous_watermark() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source.clone(), &store, 10);
    orch.run(true).await.unwrap();
    let watermark = store
        .load_checkpoint(SCOPE)
        .await
        .unwrap()
        .unwrap()
        .last_successful;

    source.fail_at(
        0,
        SourceError::Transient {
            reason: "HTTP 503".into(),
            retry_after: None,
        },
        10,
    );
    let err = orch.run(false).await.unwrap_err();
    match err {
        MirrorError::SourceUnavailable {
            cursor, attempts, ..
        } => {
            assert_eq!(cursor, None);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let cp = store.load_checkpoint(SCOPE).await.unwrap().unwrap();
    assert_eq!(cp.last_successful, watermark);

    let runs = store.last_runs(1).await.unwrap();
    assert_eq!(runs[0].state, RunState::Failed);
    assert!(runs[0].error.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    source.fail_at(
        0,
        SourceError::Transient {
            reason: "connection reset".into(),
            retry_after: None,
        },
        2,
    );
    let orch = orchestrator(source.clone(), &store, 10);
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.new, 5);
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    source.fail_at(0, SourceError::Auth("HTTP 401".into()), 5);
    let orch = orchestrator(source.clone(), &store, 10);
    let err = orch.run(true).await.unwrap_err();
    assert!(matches!(err, MirrorError::Authentication(_)));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_edit_during_full_sync_tombstones_nothing() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source.clone(), &store, 2);
    orch.run(true).await.unwrap();

    // PROJ-1 is edited right after the first page has been served.
    let calls = source.calls();
    source.edit_after_call(calls + 1, |remote| {
        let edited = raw("PROJ-1", "Edited mid-run", later(5));
        remote.retain(|r| r.key() != Some("PROJ-1"));
        remote.push(edited);
    });
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.deleted, 0);
    assert_eq!(store.issue_counts().await.unwrap(), (5, 0));
    for n in 1..=5 {
        let key = format!("PROJ-{}", n);
        assert!(!store.get_issue(&key).await.unwrap().unwrap().deleted, "{key} tombstoned");
    }
    // Key order is stable under edits, so nothing needed a second look.
    assert!(source.key_lookups().is_empty());
}

#[tokio::test]
async fn test_deletion_during_full_sync_keeps_shifted_issues() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let orch = orchestrator(source.clone(), &store, 2);
    orch.run(true).await.unwrap();

    // PROJ-1 disappears after the first page, so PROJ-3 slides from
    // offset 2 to offset 1, below the next cursor.
    let calls = source.calls();
    source.edit_after_call(calls + 1, |remote| {
        remote.retain(|r| r.key() != Some("PROJ-1"));
    });
    let report = orch.run(true).await.unwrap();
    // PROJ-1 was observed on the first page, so this run keeps it.
    assert_eq!(report.counts.deleted, 0);
    assert_eq!(store.issue_counts().await.unwrap(), (5, 0));
    // The shrink was noticed and the cursor stepped back over PROJ-3.
    assert!(source.cursors()[calls..].contains(&Some(1)));
    assert!(source.key_lookups().is_empty());

    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.deleted, 1);
    assert!(store.get_issue("PROJ-1").await.unwrap().unwrap().deleted);
    assert!(!store.get_issue("PROJ-3").await.unwrap().unwrap().deleted);
    assert_eq!(store.issue_counts().await.unwrap(), (4, 1));
    assert_eq!(source.key_lookups(), vec![vec!["PROJ-1".to_string()]]);
}

/// Never pages PROJ-3, the way offset paging can drop an issue when the
/// remote shifts under it.
struct SkippingSource {
    inner: ScriptedSource,
}

#[async_trait]
impl IssueSource for SkippingSource {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<u64>,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        let mut page = self.inner.fetch_page(scope, cursor, page_size).await?;
        page.issues.retain(|r| r.key() != Some("PROJ-3"));
        Ok(page)
    }

    async fn fetch_keys(
        &self,
        scope: &QueryScope,
        keys: &[String],
    ) -> Result<Vec<RawIssue>, SourceError> {
        self.inner.fetch_keys(scope, keys).await
    }

    async fn whoami(&self) -> Result<SourceIdentity, SourceError> {
        self.inner.whoami().await
    }
}

#[tokio::test]
async fn test_issue_missed_by_paging_is_confirmed_before_tombstoning() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    orchestrator(source.clone(), &store, 2).run(true).await.unwrap();

    // Paging never shows PROJ-3, but the remote still has it.
    let orch = orchestrator(SkippingSource { inner: source.clone() }, &store, 2);
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.deleted, 0);
    assert!(!store.get_issue("PROJ-3").await.unwrap().unwrap().deleted);
    assert_eq!(source.key_lookups(), vec![vec!["PROJ-3".to_string()]]);

    // Once it is really gone, the same check lets the tombstone through.
    source.remove("PROJ-3");
    let report = orch.run(true).await.unwrap();
    assert_eq!(report.counts.deleted, 1);
    assert!(store.get_issue("PROJ-3").await.unwrap().unwrap().deleted);
}

#[tokio::test]
async fn test_second_sync_rejected_while_one_is_active() {
    let (_tmp, store) = temp_store().await;
    let orch = orchestrator(ScriptedSource::new(five()), &store, 10);

    let guard = orch.coordinator().try_begin().unwrap();
    let err = orch.run(true).await.unwrap_err();
    assert!(matches!(err, MirrorError::SyncAlreadyRunning));
    drop(guard);

    // Another process holding the lease blocks this one too.
    assert!(store
        .try_lease("other-process", Duration::from_secs(600))
        .await
        .unwrap());
    let err = orch.run(true).await.unwrap_err();
    assert!(matches!(err, MirrorError::SyncAlreadyRunning));
    store.release_lease("other-process").await.unwrap();

    assert!(orch.run(true).await.is_ok());
    assert!(!orch.coordinator().is_active());
}

/// Requests cancellation as soon as the first page has been served.
struct CancelAfterFirstPage {
    inner: ScriptedSource,
    coordinator: Arc<SyncCoordinator>,
}

#[async_trait]
impl IssueSource for CancelAfterFirstPage {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<u64>,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        let page = self.inner.fetch_page(scope, cursor, page_size).await;
        self.coordinator.cancel();
        page
    }

    async fn fetch_keys(
        &self,
        scope: &QueryScope,
        keys: &[String],
    ) -> Result<Vec<RawIssue>, SourceError> {
        self.inner.fetch_keys(scope, keys).await
    }

    async fn whoami(&self) -> Result<SourceIdentity, SourceError> {
        self.inner.whoami().await
    }
}

#[tokio::test]
async fn test_cancelled_run_stops_between_pages_and_resumes() {
    let (_tmp, store) = temp_store().await;
    let source = ScriptedSource::new(five());
    let coordinator = Arc::new(SyncCoordinator::new());
    let settings = settings(2);
    let guarded = GuardedSource::new(
        CancelAfterFirstPage {
            inner: source.clone(),
            coordinator: coordinator.clone(),
        },
        settings.rate_limit_per_minute,
        settings.retry.clone(),
    );
    let orch = SyncOrchestrator::new(guarded, store.clone(), settings, coordinator);

    let err = orch.run(true).await.unwrap_err();
    assert!(matches!(err, MirrorError::Cancelled));
    assert_eq!(store.issue_counts().await.unwrap(), (2, 0));
    let cp = store.load_checkpoint(SCOPE).await.unwrap().unwrap();
    assert_eq!(cp.cursor, Some(2));
    assert_eq!(store.last_runs(1).await.unwrap()[0].state, RunState::Cancelled);

    // Resume with a plain source: picks up at the saved cursor.
    let orch = orchestrator(source.clone(), &store, 2);
    let report = orch.run(true).await.unwrap();
    assert!(report.resumed);
    assert_eq!(report.counts.new, 3);
    assert_eq!(store.issue_counts().await.unwrap(), (5, 0));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let (_tmp, store) = temp_store().await;
    let orch = orchestrator(ScriptedSource::new(five()), &store, 10);
    let report = orch.dry_run(false).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(report.total, Some(5));
    assert!(report.jql.contains("project = \"PROJ\""));
    assert_eq!(store.issue_counts().await.unwrap(), (0, 0));
    assert!(store.load_checkpoint(SCOPE).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_searches_never_see_a_partial_batch() {
    const ISSUES: usize = 40;
    const GENERATIONS: u32 = 30;
    let (_tmp, store) = temp_store().await;

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for generation in 1..=GENERATIONS {
                let issues: Vec<_> = (1..=ISSUES)
                    .map(|n| {
                        let r = raw(
                            &format!("PROJ-{}", n),
                            &format!("widget gen{}", generation),
                            later(generation as i64),
                        );
                        normalize(&r, &FieldCatalog::default()).unwrap()
                    })
                    .collect();
                let keys: Vec<String> = issues.iter().map(|i| i.key.clone()).collect();
                let applied = store
                    .upsert_batch(&IssueBatch {
                        scope: SCOPE,
                        run_id: "writer",
                        issues: &issues,
                        observed: &keys,
                    })
                    .await
                    .unwrap();
                assert_eq!(applied, ISSUES);
                tokio::task::yield_now().await;
            }
        })
    };

    let engine = engine(&store);
    let mut reads = 0;
    while !writer.is_finished() || reads == 0 {
        for mode in [QueryMode::Natural, QueryMode::Jql] {
            let q = if mode == QueryMode::Natural { "widget" } else { "project = PROJ" };
            let page = engine
                .search(&SearchRequest {
                    limit: Some(ISSUES),
                    ..SearchRequest::new(Query::new(mode, q))
                })
                .await
                .unwrap();
            assert!(
                page.total_matched == 0 || page.total_matched == ISSUES,
                "saw {} of {} issues",
                page.total_matched,
                ISSUES
            );
            assert_eq!(page.items.len(), page.total_matched);
            let first = page.items.first().map(|i| i.summary.clone());
            assert!(
                page.items.iter().all(|i| Some(&i.summary) == first.as_ref()),
                "page mixes generations: {:?}",
                page.items.iter().map(|i| &i.summary).collect::<Vec<_>>()
            );
        }
        reads += 1;
    }
    writer.await.unwrap();
    assert!(reads > 0);
}
