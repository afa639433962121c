//! Shared fixtures: a scripted in-process issue source, a temp SQLite
//! store, and a fake Jira HTTP server for the binary tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use jira_mirror::config::SyncSettings;
use jira_mirror::source::retry::RetryPolicy;
use jira_mirror::source::{IssueSource, SourceError, SourceIdentity, SourcePage};
use jira_mirror::sqlite_store::SqliteStore;
use jira_mirror::{db, migrate};
use jira_mirror_core::fields::FieldCatalog;
use jira_mirror_core::models::{key_number, QueryScope, RawIssue, ScopeBase};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const PROJECT: &str = "PROJ";

/// A remote issue in Jira's search response shape.
pub fn raw(key: &str, summary: &str, updated: DateTime<Utc>) -> RawIssue {
    RawIssue(json!({
        "key": key,
        "fields": {
            "summary": summary,
            "description": null,
            "status": { "name": "Open" },
            "priority": { "name": "Medium" },
            "assignee": null,
            "reporter": { "name": "rep", "displayName": "Reporter" },
            "created": "2024-01-01T00:00:00.000+0000",
            "updated": updated.to_rfc3339(),
            "project": { "key": PROJECT, "name": "Project" },
            "issuetype": { "name": "Bug" },
            "labels": [],
            "components": [],
            "comment": { "comments": [] }
        }
    }))
}

/// Set one field of a raw issue.
pub fn with(mut issue: RawIssue, field: &str, value: Value) -> RawIssue {
    issue.0["fields"][field] = value;
    issue
}

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// A timestamp safely after any watermark taken so far.
pub fn later(minutes: i64) -> DateTime<Utc> {
    Utc::now() + Duration::minutes(minutes)
}

struct Failure {
    cursor: u64,
    error: SourceError,
    remaining: usize,
}

type Edit = Box<dyn FnOnce(&mut Vec<RawIssue>) + Send>;

#[derive(Default)]
struct Script {
    remote: Mutex<Vec<RawIssue>>,
    failures: Mutex<Vec<Failure>>,
    /// Remote edits applied right after the page call with that number.
    edits: Mutex<Vec<(usize, Edit)>>,
    calls: AtomicUsize,
    key_lookups: Mutex<Vec<Vec<String>>>,
    cursors: Mutex<Vec<Option<u64>>>,
    watermarks: Mutex<Vec<Option<DateTime<Utc>>>>,
}

/// An [`IssueSource`] over an in-memory remote. Pages are in key order,
/// filtered by the incremental watermark (floored to the minute like the
/// real remote), with `startAt`-style cursors. Clones share state, so a
/// test keeps one handle while the orchestrator owns another.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Script>,
}

impl ScriptedSource {
    pub fn new(issues: Vec<RawIssue>) -> Self {
        let s = Self::default();
        *s.script.remote.lock().unwrap() = issues;
        s
    }

    /// Replace or add a remote issue.
    pub fn put(&self, issue: RawIssue) {
        let mut remote = self.script.remote.lock().unwrap();
        let key = issue.key().unwrap().to_string();
        remote.retain(|r| r.key() != Some(key.as_str()));
        remote.push(issue);
    }

    pub fn remove(&self, key: &str) {
        self.script
            .remote
            .lock()
            .unwrap()
            .retain(|r| r.key() != Some(key));
    }

    /// Fail the next `times` fetches of `cursor` with `error`.
    pub fn fail_at(&self, cursor: u64, error: SourceError, times: usize) {
        self.script.failures.lock().unwrap().push(Failure {
            cursor,
            error,
            remaining: times,
        });
    }

    /// Change the remote once page call number `call` (1-based) has been
    /// served, as if someone edited Jira while the run was paging.
    pub fn edit_after_call(&self, call: usize, edit: impl FnOnce(&mut Vec<RawIssue>) + Send + 'static) {
        self.script.edits.lock().unwrap().push((call, Box::new(edit)));
    }

    /// Keys asked for through [`IssueSource::fetch_keys`], per request.
    pub fn key_lookups(&self) -> Vec<Vec<String>> {
        self.script.key_lookups.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn cursors(&self) -> Vec<Option<u64>> {
        self.script.cursors.lock().unwrap().clone()
    }

    pub fn watermarks(&self) -> Vec<Option<DateTime<Utc>>> {
        self.script.watermarks.lock().unwrap().clone()
    }
}

/// Jira's key order: project, then issue number.
fn key_order(r: &RawIssue) -> (String, i64) {
    let key = r.key().unwrap_or_default();
    let project = key.rsplit_once('-').map(|(p, _)| p).unwrap_or(key);
    (project.to_string(), key_number(key))
}

fn updated_of(r: &RawIssue) -> DateTime<Utc> {
    r.fields()
        .and_then(|f| f.get("updated"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

#[async_trait]
impl IssueSource for ScriptedSource {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<u64>,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        let script = &self.script;
        let call = script.calls.fetch_add(1, Ordering::SeqCst) + 1;
        script.cursors.lock().unwrap().push(cursor);
        script.watermarks.lock().unwrap().push(scope.updated_since);
        let start = cursor.unwrap_or(0);

        {
            let mut failures = script.failures.lock().unwrap();
            if let Some(f) = failures
                .iter_mut()
                .find(|f| f.cursor == start && f.remaining > 0)
            {
                f.remaining -= 1;
                return Err(f.error.clone());
            }
        }

        let mut matching: Vec<RawIssue> = script
            .remote
            .lock()
            .unwrap()
            .iter()
            .filter(|r| match scope.updated_since {
                Some(since) => {
                    let floor = since
                        .duration_trunc(Duration::minutes(1))
                        .unwrap_or(since);
                    updated_of(r) >= floor
                }
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by_key(key_order);

        let total = matching.len() as u64;
        let end = (start as usize + page_size).min(matching.len());
        let issues = matching
            .get(start as usize..end)
            .map(<[RawIssue]>::to_vec)
            .unwrap_or_default();
        let next_cursor = if (end as u64) < total && !issues.is_empty() {
            Some(end as u64)
        } else {
            None
        };

        {
            let mut edits = script.edits.lock().unwrap();
            let mut remote = script.remote.lock().unwrap();
            let mut i = 0;
            while i < edits.len() {
                if edits[i].0 == call {
                    let (_, edit) = edits.remove(i);
                    edit(&mut *remote);
                } else {
                    i += 1;
                }
            }
        }

        Ok(SourcePage {
            issues,
            next_cursor,
            total: Some(total),
        })
    }

    async fn fetch_keys(
        &self,
        _scope: &QueryScope,
        keys: &[String],
    ) -> Result<Vec<RawIssue>, SourceError> {
        self.script.key_lookups.lock().unwrap().push(keys.to_vec());
        Ok(self
            .script
            .remote
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.key().is_some_and(|k| keys.iter().any(|want| want == k)))
            .cloned()
            .collect())
    }

    async fn whoami(&self) -> Result<SourceIdentity, SourceError> {
        Ok(SourceIdentity {
            name: "tester".into(),
            display_name: Some("Test User".into()),
        })
    }
}

pub fn settings(batch_size: usize) -> SyncSettings {
    SyncSettings {
        scope: ScopeBase::Project(PROJECT.into()),
        batch_size,
        rate_limit_per_minute: 60_000,
        retry: RetryPolicy::immediate(3),
        catalog: FieldCatalog::default(),
    }
}

pub async fn temp_store() -> (TempDir, Arc<SqliteStore>) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("mirror.sqlite"))
        .await
        .unwrap();
    migrate::migrate(&pool).await.unwrap();
    (tmp, Arc::new(SqliteStore::new(pool)))
}

// ============ Fake Jira HTTP server ============

/// Serves `/rest/api/2/search`, `myself` and `field` from a fixed set of
/// issues, checking basic auth. Runs on its own thread and runtime so it
/// can back both async tests and the compiled binary.
pub struct FakeJira {
    pub url: String,
    pub requests: Arc<AtomicUsize>,
}

pub const FAKE_USER: &str = "bot";
pub const FAKE_TOKEN: &str = "s3cret";

pub fn spawn_fake_jira(issues: Vec<RawIssue>) -> FakeJira {
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};

    #[derive(Clone)]
    struct Fake {
        issues: Arc<Vec<Value>>,
        requests: Arc<AtomicUsize>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        // base64("bot:s3cret")
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Basic Ym90OnMzY3JldA==")
    }

    async fn search(
        State(fake): State<Fake>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, StatusCode> {
        fake.requests.fetch_add(1, Ordering::SeqCst);
        if !authorized(&headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let start: usize = params
            .get("startAt")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let max: usize = params
            .get("maxResults")
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);
        let jql = params.get("jql").map(String::as_str).unwrap_or_default();
        let matching: Vec<Value> = match requested_keys(jql) {
            Some(keys) => fake
                .issues
                .iter()
                .filter(|i| i["key"].as_str().is_some_and(|k| keys.iter().any(|w| w == k)))
                .cloned()
                .collect(),
            None => fake.issues.to_vec(),
        };
        let end = (start + max).min(matching.len());
        let page: Vec<Value> = matching.get(start..end).unwrap_or_default().to_vec();
        Ok(Json(json!({
            "startAt": start,
            "maxResults": max,
            "total": matching.len(),
            "issues": page,
        })))
    }

    /// Keys of a `key in ("A", "B")` restriction, if the query has one.
    fn requested_keys(jql: &str) -> Option<Vec<String>> {
        let (_, rest) = jql.split_once("key in (")?;
        let (list, _) = rest.split_once(')')?;
        Some(
            list.split(',')
                .map(|k| k.trim().trim_matches('"').to_string())
                .collect(),
        )
    }

    async fn myself(State(fake): State<Fake>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
        fake.requests.fetch_add(1, Ordering::SeqCst);
        if !authorized(&headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(Json(json!({ "name": FAKE_USER, "displayName": "Sync Bot" })))
    }

    async fn fields(State(fake): State<Fake>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
        fake.requests.fetch_add(1, Ordering::SeqCst);
        if !authorized(&headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(Json(json!([
            { "id": "summary", "name": "Summary", "custom": false, "schema": { "type": "string" } },
            { "id": "customfield_10020", "name": "Team", "custom": true, "schema": { "type": "option" } },
            { "id": "customfield_10010", "name": "Story Points", "custom": true, "schema": { "type": "number" } },
            { "id": "customfield_10030", "name": "Rank", "custom": true, "schema": { "type": "any" } },
            { "id": "customfield_10040", "name": "Target start", "custom": true, "schema": { "type": "date" } },
            { "id": "customfield_10050", "name": "Flagged", "custom": true }
        ])))
    }

    let requests = Arc::new(AtomicUsize::new(0));
    let state = Fake {
        issues: Arc::new(issues.into_iter().map(|r| r.0).collect()),
        requests: requests.clone(),
    };
    let app = Router::new()
        .route("/rest/api/2/search", get(search))
        .route("/rest/api/2/myself", get(myself))
        .route("/rest/api/2/field", get(fields))
        .with_state(state);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });

    FakeJira {
        url: format!("http://{}", addr),
        requests,
    }
}
