//! Query engine over the SQLite store: all three modes, tombstone
//! visibility, paging, the refine ceiling and deadlines.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use jira_mirror::sqlite_store::SqliteStore;
use jira_mirror::{db, migrate};
use jira_mirror_core::fields::{CustomFieldDef, FieldCatalog, FieldType};
use jira_mirror_core::models::RawIssue;
use jira_mirror_core::normalize::normalize;
use jira_mirror_core::query::engine::SearchRequest;
use jira_mirror_core::query::{
    EngineSettings, Query, QueryEngine, QueryError, QueryMode, ResultPage,
};
use jira_mirror_core::store::{IssueBatch, MirrorStore};
use serde_json::json;

use common::{at, raw, temp_store, with};

fn catalog() -> FieldCatalog {
    FieldCatalog::new(vec![CustomFieldDef {
        id: "customfield_10010".into(),
        name: "Story Points".into(),
        field_type: FieldType::Number,
    }])
}

async fn load(store: &Arc<SqliteStore>, raws: &[RawIssue]) {
    let issues: Vec<_> = raws
        .iter()
        .map(|r| normalize(r, &catalog()).unwrap())
        .collect();
    let observed: Vec<String> = issues.iter().map(|i| i.key.clone()).collect();
    store
        .upsert_batch(&IssueBatch {
            scope: "project:PROJ",
            run_id: "seed",
            issues: &issues,
            observed: &observed,
        })
        .await
        .unwrap();
}

fn engine(store: &Arc<SqliteStore>) -> QueryEngine<SqliteStore> {
    QueryEngine::new(store.clone(), catalog(), EngineSettings::default())
}

async fn search(engine: &QueryEngine<SqliteStore>, mode: QueryMode, q: &str) -> ResultPage {
    engine
        .search(&SearchRequest::new(Query::new(mode, q)))
        .await
        .unwrap()
}

fn keys(page: &ResultPage) -> Vec<&str> {
    page.items.iter().map(|i| i.key.as_str()).collect()
}

fn issue(key: &str, summary: &str, day: u32, status: &str, priority: &str) -> RawIssue {
    let r = raw(key, summary, at(&format!("2024-04-{:02}T09:00:00Z", day)));
    let r = with(r, "status", json!({ "name": status }));
    with(r, "priority", json!({ "name": priority }))
}

#[tokio::test]
async fn test_pattern_matches_key_shape() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[
            issue("PROJ-100", "first", 1, "Open", "High"),
            issue("PROJ-99", "second", 2, "Open", "High"),
            with(
                issue("ABC-1", "third", 3, "Open", "High"),
                "project",
                json!({ "key": "ABC" }),
            ),
        ],
    )
    .await;

    let page = search(&engine(&store), QueryMode::Regex, r"PROJ-\d{3}").await;
    assert_eq!(keys(&page), vec!["PROJ-100"]);
    assert_eq!(page.total_matched, 1);
    assert!(page.items[0].score.is_none());
}

#[tokio::test]
async fn test_invalid_pattern_is_rejected_before_execution() {
    let (_tmp, store) = temp_store().await;
    let err = engine(&store)
        .search(&SearchRequest::new(Query::new(QueryMode::Regex, "fix(")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Syntax { .. }));
}

#[tokio::test]
async fn test_structured_enum_codes_and_unknown_field() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[
            issue("PROJ-1", "both", 1, "Open", "High"),
            issue("PROJ-2", "open low", 2, "Open", "Low"),
            issue("PROJ-3", "closed high", 3, "Closed", "High"),
            issue("PROJ-4", "lowercase labels", 4, "open", "HIGH"),
        ],
    )
    .await;
    let engine = engine(&store);

    let page = search(&engine, QueryMode::Jql, r#"status = "Open" AND priority = "High""#).await;
    assert_eq!(keys(&page), vec!["PROJ-4", "PROJ-1"]);

    let err = engine
        .search(&SearchRequest::new(Query::new(QueryMode::Jql, "foo = 1")))
        .await
        .unwrap_err();
    match err {
        QueryError::Syntax { position, .. } => assert_eq!(position, 0),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_structured_order_in_and_multivalue_fields() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[
            with(issue("PROJ-1", "a", 1, "Open", "High"), "labels", json!(["backend", "db"])),
            with(issue("PROJ-2", "b", 2, "Closed", "Low"), "labels", json!(["frontend"])),
            with(
                issue("PROJ-3", "c", 3, "In Progress", "Medium"),
                "customfield_10010",
                json!(8),
            ),
        ],
    )
    .await;
    let engine = engine(&store);

    let page = search(&engine, QueryMode::Jql, "labels = backend").await;
    assert_eq!(keys(&page), vec!["PROJ-1"]);

    let page = search(
        &engine,
        QueryMode::Jql,
        r#"status IN (Open, "In Progress") ORDER BY updated ASC"#,
    )
    .await;
    assert_eq!(keys(&page), vec!["PROJ-1", "PROJ-3"]);

    let page = search(&engine, QueryMode::Jql, "story_points >= 5").await;
    assert_eq!(keys(&page), vec!["PROJ-3"]);

    // Missing values never satisfy a comparison, negated or not.
    let page = search(&engine, QueryMode::Jql, "customfield_10010 != 8").await;
    assert!(page.items.is_empty());
    let page = search(&engine, QueryMode::Jql, "customfield_10010 IS EMPTY ORDER BY key ASC").await;
    assert_eq!(keys(&page), vec!["PROJ-1", "PROJ-2"]);

    let page = search(&engine, QueryMode::Jql, r#"updated >= "2024-04-02""#).await;
    assert_eq!(page.total_matched, 2);
}

#[tokio::test]
async fn test_free_text_ranks_by_relevance_and_key_first() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[
            with(
                issue("PROJ-1", "Login timeout", 1, "Open", "High"),
                "description",
                json!("The login page hits a timeout. Timeout again on retry."),
            ),
            issue("PROJ-2", "Dashboard timeout once", 2, "Open", "High"),
            issue("PROJ-3", "Unrelated work", 3, "Open", "High"),
            issue("PROJ-4", "Mentions PROJ-3 in passing", 4, "Open", "High"),
            issue("PROJ-5", "Release notes", 5, "Open", "High"),
            issue("PROJ-6", "Onboarding docs", 6, "Open", "High"),
        ],
    )
    .await;
    let engine = engine(&store);

    let page = search(&engine, QueryMode::Natural, "timeout").await;
    assert_eq!(keys(&page), vec!["PROJ-1", "PROJ-2"]);
    assert!(page.items[0].score.unwrap() > page.items[1].score.unwrap());
    assert!(page.items[0].snippet.as_deref().unwrap().contains(">>>"));

    // All terms must match.
    let page = search(&engine, QueryMode::Natural, "login timeout").await;
    assert_eq!(keys(&page), vec!["PROJ-1"]);

    // The named issue itself comes first, then text mentions.
    let page = search(&engine, QueryMode::Natural, "proj-3").await;
    assert_eq!(keys(&page), vec!["PROJ-3", "PROJ-4"]);

    let page = search(&engine, QueryMode::Natural, "   ").await;
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_tombstones_hidden_unless_requested() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[
            issue("PROJ-1", "keep me", 1, "Open", "High"),
            issue("PROJ-2", "drop me", 2, "Open", "High"),
        ],
    )
    .await;
    store.tombstone(&["PROJ-2".to_string()]).await.unwrap();
    let engine = engine(&store);

    for (mode, q) in [
        (QueryMode::Natural, "me"),
        (QueryMode::Jql, "priority = High"),
        (QueryMode::Regex, "me$"),
    ] {
        let page = search(&engine, mode, q).await;
        assert_eq!(keys(&page), vec!["PROJ-1"], "mode {:?}", mode);

        let all = engine
            .search(&SearchRequest {
                include_deleted: true,
                ..SearchRequest::new(Query::new(mode, q))
            })
            .await
            .unwrap();
        assert_eq!(all.total_matched, 2, "mode {:?}", mode);
    }

    let dropped = engine.issue("PROJ-2").await.unwrap().unwrap();
    assert!(dropped.deleted);
}

#[tokio::test]
async fn test_paging_and_refine_ceiling() {
    let (_tmp, store) = temp_store().await;
    let raws: Vec<RawIssue> = (1..=5)
        .map(|n| issue(&format!("PROJ-{}", n), "paged issue", n, "Open", "High"))
        .collect();
    load(&store, &raws).await;

    let engine = QueryEngine::new(
        store.clone(),
        catalog(),
        EngineSettings {
            ceiling: 3,
            default_limit: 2,
            ..EngineSettings::default()
        },
    );
    let page = search(&engine, QueryMode::Jql, "project = PROJ").await;
    assert_eq!(keys(&page), vec!["PROJ-5", "PROJ-4"]);
    assert_eq!(page.total_matched, 5);
    assert!(page.refine_suggested);

    // The ceiling bounds how deep paging can go.
    let page = engine
        .search(&SearchRequest {
            offset: 2,
            ..SearchRequest::new(Query::new(QueryMode::Jql, "project = PROJ"))
        })
        .await
        .unwrap();
    assert_eq!(keys(&page), vec!["PROJ-3"]);
}

#[tokio::test]
async fn test_expired_deadline_times_out() {
    let (_tmp, store) = temp_store().await;
    load(&store, &[issue("PROJ-1", "anything", 1, "Open", "High")]).await;
    let err = engine(&store)
        .search(&SearchRequest {
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            ..SearchRequest::new(Query::new(QueryMode::Regex, "any.*"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Timeout { .. }));
}

#[tokio::test]
async fn test_suggest_prefers_key_and_summary_prefix() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[
            issue("PROJ-1", "Database migration", 1, "Open", "High"),
            issue("PROJ-2", "Fix the datepicker", 2, "Open", "High"),
        ],
    )
    .await;
    let engine = engine(&store);

    let s = engine.suggest("dat", QueryMode::Natural).await.unwrap();
    assert_eq!(s[0].key, "PROJ-1");
    assert_eq!(s.len(), 2);

    assert!(engine.suggest("d", QueryMode::Natural).await.unwrap().is_empty());
    // An incomplete structured query yields nothing instead of an error.
    assert!(engine
        .suggest("status = ", QueryMode::Jql)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_snippet_quotes_the_stored_text() {
    let (_tmp, store) = temp_store().await;
    load(
        &store,
        &[with(
            issue("PROJ-1", "Rendering bug", 1, "Open", "High"),
            "description",
            json!("Safari shows a Blank Page, then crashes."),
        )],
    )
    .await;
    let engine = engine(&store);

    let page = search(&engine, QueryMode::Natural, "blank").await;
    assert_eq!(
        page.items[0].snippet.as_deref(),
        Some("Safari shows a >>>Blank<<< Page, then crashes.")
    );

    // A key-only hit has no excerpt.
    let page = search(&engine, QueryMode::Natural, "proj-1").await;
    assert_eq!(keys(&page), vec!["PROJ-1"]);
    assert_eq!(page.items[0].snippet, None);
}

#[tokio::test]
async fn test_search_entry_follows_edits_and_purge() {
    let (_tmp, store) = temp_store().await;
    load(&store, &[issue("PROJ-1", "alpha widget", 1, "Open", "High")]).await;
    load(&store, &[issue("PROJ-1", "beta widget", 2, "Open", "High")]).await;
    let engine = engine(&store);

    assert!(search(&engine, QueryMode::Natural, "alpha").await.items.is_empty());
    assert_eq!(keys(&search(&engine, QueryMode::Natural, "beta").await), vec!["PROJ-1"]);
    assert_eq!(store.search_entry_count().await.unwrap(), 1);

    store.tombstone(&["PROJ-1".to_string()]).await.unwrap();
    assert_eq!(store.purge(&["PROJ-1".to_string()]).await.unwrap(), 1);
    assert_eq!(store.search_entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_text_keyed_search_index_is_migrated() {
    let tmp = tempfile::TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("old.sqlite")).await.unwrap();
    sqlx::query(
        "CREATE TABLE issues (
            key TEXT PRIMARY KEY, project_key TEXT NOT NULL, project_name TEXT,
            key_num INTEGER NOT NULL, issue_type TEXT, summary TEXT NOT NULL, description TEXT,
            status_code INTEGER NOT NULL DEFAULT 0, status_name TEXT,
            priority_code INTEGER NOT NULL DEFAULT 0, priority_name TEXT,
            assignee_id TEXT, assignee_name TEXT, reporter_id TEXT, reporter_name TEXT,
            created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL,
            labels_json TEXT NOT NULL DEFAULT '[]', components_json TEXT NOT NULL DEFAULT '[]',
            comments_text TEXT, comments_json TEXT NOT NULL DEFAULT '[]',
            custom_json TEXT NOT NULL DEFAULT '{}', raw_json TEXT, content_hash TEXT NOT NULL,
            scope TEXT, last_seen_run TEXT, deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER, synced_at INTEGER NOT NULL
        )",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("CREATE VIRTUAL TABLE issues_fts USING fts5(key UNINDEXED, terms)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO issues (key, project_key, key_num, summary, created_at, updated_at, content_hash, synced_at)
         VALUES ('PROJ-8', 'PROJ', 8, 'Printer on fire', 0, 0, 'h', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    migrate::migrate(&pool).await.unwrap();
    // A second pass finds nothing left to move.
    migrate::migrate(&pool).await.unwrap();

    let store = Arc::new(SqliteStore::new(pool));
    assert_eq!(store.search_entry_count().await.unwrap(), 1);
    let page = search(&engine(&store), QueryMode::Natural, "printer").await;
    assert_eq!(keys(&page), vec!["PROJ-8"]);
}
