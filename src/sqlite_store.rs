//! SQLite-backed [`MirrorStore`] and [`CheckpointStore`].
//!
//! Every batch is one transaction: issue rows, their `issues_fts` entries
//! and the scope bookkeeping commit together, so readers in WAL mode see a
//! batch either entirely or not at all. Queries that need more than one
//! statement (page + total) run inside a single read transaction.
//!
//! An issue's search entry shares its `issues.id` as FTS rowid, so replacing
//! or dropping it is a rowid lookup.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jira_mirror_core::models::{
    ChangeCounts, CodedValue, Comment, Issue, IssueSummary, NormalizedIssue, Person, RunState,
    SyncCheckpoint, SyncRunRecord, SyncType,
};
use jira_mirror_core::query::eval::{sort_cmp, tie_break};
use jira_mirror_core::query::text::tokenize;
use jira_mirror_core::query::{
    CompiledQuery, ExecOptions, Predicate, QueryError, Ranking, ResultPage, SortSpec, TextQuery,
};
use jira_mirror_core::reconcile::LocalState;
use jira_mirror_core::store::{CheckpointStore, IssueBatch, MirrorStore, StoreError};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use crate::config::Config;
use crate::sql_translate::{order_by, translate, SqlFilter, SqlParam};
use crate::{db, migrate};

/// `IN (...)` lists are chunked to stay under SQLite's variable limit.
const KEY_CHUNK: usize = 500;

const SCAN_YIELD_EVERY: usize = 256;

const ISSUE_COLUMNS: &str = "i.key, i.project_key, i.project_name, i.issue_type, i.summary, \
     i.description, i.status_code, i.status_name, i.priority_code, i.priority_name, \
     i.assignee_id, i.assignee_name, i.reporter_id, i.reporter_name, i.created_at, \
     i.updated_at, i.labels_json, i.components_json, i.comments_json, i.custom_json, \
     i.raw_json, i.content_hash, i.deleted, i.deleted_at, i.synced_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn write_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Write(e.to_string())
}

fn read_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Read(e.to_string())
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn bind_params<'q>(
    mut q: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlParam],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for p in params {
        q = match p {
            SqlParam::Text(s) => q.bind(s.clone()),
            SqlParam::Int(n) => q.bind(*n),
            SqlParam::Real(f) => q.bind(*f),
        };
    }
    q
}

fn person(id: Option<String>, name: Option<String>) -> Option<Person> {
    if id.is_none() && name.is_none() {
        None
    } else {
        Some(Person {
            id,
            display_name: name,
        })
    }
}

fn row_to_issue(row: &SqliteRow) -> Result<Issue, StoreError> {
    let json = |col: &str| -> Result<String, StoreError> { row.try_get(col).map_err(read_err) };
    let labels: Vec<String> = serde_json::from_str(&json("labels_json")?).map_err(read_err)?;
    let components: Vec<String> =
        serde_json::from_str(&json("components_json")?).map_err(read_err)?;
    let comments: Vec<Comment> = serde_json::from_str(&json("comments_json")?).map_err(read_err)?;
    let custom_fields = serde_json::from_str(&json("custom_json")?).map_err(read_err)?;

    let data = NormalizedIssue {
        key: row.try_get("key").map_err(read_err)?,
        project_key: row.try_get("project_key").map_err(read_err)?,
        project_name: row.try_get("project_name").map_err(read_err)?,
        issue_type: row.try_get("issue_type").map_err(read_err)?,
        summary: row.try_get("summary").map_err(read_err)?,
        description: row.try_get("description").map_err(read_err)?,
        status: CodedValue {
            code: row.try_get("status_code").map_err(read_err)?,
            label: row.try_get("status_name").map_err(read_err)?,
        },
        priority: CodedValue {
            code: row.try_get("priority_code").map_err(read_err)?,
            label: row.try_get("priority_name").map_err(read_err)?,
        },
        assignee: person(
            row.try_get("assignee_id").map_err(read_err)?,
            row.try_get("assignee_name").map_err(read_err)?,
        ),
        reporter: person(
            row.try_get("reporter_id").map_err(read_err)?,
            row.try_get("reporter_name").map_err(read_err)?,
        ),
        created: from_millis(row.try_get("created_at").map_err(read_err)?),
        updated: from_millis(row.try_get("updated_at").map_err(read_err)?),
        labels,
        components,
        comments,
        custom_fields,
        content_hash: row.try_get("content_hash").map_err(read_err)?,
        raw_json: row.try_get("raw_json").map_err(read_err)?,
    };
    let deleted_at: Option<i64> = row.try_get("deleted_at").map_err(read_err)?;
    Ok(Issue {
        data,
        deleted: row.try_get::<i64, _>("deleted").map_err(read_err)? != 0,
        deleted_at: deleted_at.map(from_millis),
        synced_at: from_millis(row.try_get("synced_at").map_err(read_err)?),
    })
}

fn timed_out(started: Instant) -> QueryError {
    QueryError::Timeout {
        elapsed: started.elapsed(),
    }
}

/// Replace the search entry of issue row `id` with the tokens of `issue`.
async fn write_search_entry(
    conn: &mut SqliteConnection,
    id: i64,
    issue: &NormalizedIssue,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM issues_fts WHERE rowid = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO issues_fts (rowid, terms) VALUES (?, ?)")
        .bind(id)
        .bind(tokenize(&issue.search_text()).join(" "))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Connect to the configured database and bring its schema up to date.
pub async fn open(config: &Config) -> anyhow::Result<SqliteStore> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    Ok(SqliteStore::new(pool))
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply one issue. Returns whether the row was written; an older
    /// `updated` than the stored one leaves the row untouched.
    async fn upsert_one(
        conn: &mut SqliteConnection,
        issue: &NormalizedIssue,
        scope: &str,
        run_id: &str,
        now: i64,
    ) -> Result<bool, sqlx::Error> {
        let comments_json = serde_json::to_string(&issue.comments).unwrap_or_else(|_| "[]".into());
        let custom_json =
            serde_json::to_string(&issue.custom_fields).unwrap_or_else(|_| "{}".into());
        let labels_json = serde_json::to_string(&issue.labels).unwrap_or_else(|_| "[]".into());
        let components_json =
            serde_json::to_string(&issue.components).unwrap_or_else(|_| "[]".into());
        let comments_text = issue.comments_text();

        let written: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO issues (
                key, project_key, project_name, key_num, issue_type, summary, description,
                status_code, status_name, priority_code, priority_name,
                assignee_id, assignee_name, reporter_id, reporter_name,
                created_at, updated_at, labels_json, components_json,
                comments_text, comments_json, custom_json, raw_json, content_hash,
                scope, last_seen_run, deleted, deleted_at, synced_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)
            ON CONFLICT(key) DO UPDATE SET
                project_key = excluded.project_key,
                project_name = excluded.project_name,
                key_num = excluded.key_num,
                issue_type = excluded.issue_type,
                summary = excluded.summary,
                description = excluded.description,
                status_code = excluded.status_code,
                status_name = excluded.status_name,
                priority_code = excluded.priority_code,
                priority_name = excluded.priority_name,
                assignee_id = excluded.assignee_id,
                assignee_name = excluded.assignee_name,
                reporter_id = excluded.reporter_id,
                reporter_name = excluded.reporter_name,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                labels_json = excluded.labels_json,
                components_json = excluded.components_json,
                comments_text = excluded.comments_text,
                comments_json = excluded.comments_json,
                custom_json = excluded.custom_json,
                raw_json = excluded.raw_json,
                content_hash = excluded.content_hash,
                scope = excluded.scope,
                last_seen_run = excluded.last_seen_run,
                deleted = 0,
                deleted_at = NULL,
                synced_at = excluded.synced_at
            WHERE excluded.updated_at >= issues.updated_at
            RETURNING id
            "#,
        )
        .bind(&issue.key)
        .bind(&issue.project_key)
        .bind(&issue.project_name)
        .bind(issue.key_number())
        .bind(&issue.issue_type)
        .bind(&issue.summary)
        .bind(&issue.description)
        .bind(issue.status.code)
        .bind(&issue.status.label)
        .bind(issue.priority.code)
        .bind(&issue.priority.label)
        .bind(issue.assignee.as_ref().and_then(|p| p.id.clone()))
        .bind(issue.assignee.as_ref().and_then(|p| p.display_name.clone()))
        .bind(issue.reporter.as_ref().and_then(|p| p.id.clone()))
        .bind(issue.reporter.as_ref().and_then(|p| p.display_name.clone()))
        .bind(millis(issue.created))
        .bind(millis(issue.updated))
        .bind(labels_json)
        .bind(components_json)
        .bind(if comments_text.is_empty() {
            None
        } else {
            Some(comments_text)
        })
        .bind(comments_json)
        .bind(custom_json)
        .bind(&issue.raw_json)
        .bind(&issue.content_hash)
        .bind(scope)
        .bind(run_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        // No row back means the stored copy is newer.
        let Some(id) = written else {
            return Ok(false);
        };
        write_search_entry(conn, id, issue).await?;
        Ok(true)
    }

    /// Issues matching a SQL filter, in `order` order, plus the total.
    async fn query_sql(
        &self,
        filter: &SqlFilter,
        order: &str,
        opts: &ExecOptions,
    ) -> Result<(Vec<Issue>, usize), StoreError> {
        let deleted_clause = if opts.include_deleted {
            ""
        } else {
            " AND i.deleted = 0"
        };
        let mut tx = self.pool.begin().await.map_err(read_err)?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM issues i WHERE ({}){}",
            filter.sql, deleted_clause
        );
        let total: i64 = bind_params(sqlx::query(&count_sql), &filter.params)
            .fetch_one(&mut *tx)
            .await
            .map_err(read_err)?
            .try_get(0)
            .map_err(read_err)?;

        let page_sql = format!(
            "SELECT {} FROM issues i WHERE ({}){} ORDER BY {} LIMIT ? OFFSET ?",
            ISSUE_COLUMNS, filter.sql, deleted_clause, order
        );
        let rows = bind_params(sqlx::query(&page_sql), &filter.params)
            .bind(opts.capped_limit() as i64)
            .bind(opts.offset as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(read_err)?;
        tx.commit().await.map_err(read_err)?;

        let issues = rows
            .iter()
            .map(row_to_issue)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((issues, total.max(0) as usize))
    }

    /// Free-text search through FTS5 with `bm25()` ranking.
    async fn query_text(
        &self,
        text: &TextQuery,
        opts: &ExecOptions,
    ) -> Result<(Vec<(Issue, f64, Option<String>)>, usize), StoreError> {
        let deleted_clause = if opts.include_deleted {
            ""
        } else {
            " AND i.deleted = 0"
        };
        let hint = text.key_hint.clone().unwrap_or_default();
        let expr = text.fts_expression();
        // FTS5 rank is lower-is-better; a key hit sorts before any text hit.
        let base = format!(
            r#"
            WITH hits AS (
                SELECT rowid AS id, bm25(issues_fts) AS rank
                FROM issues_fts
                WHERE issues_fts MATCH ?
            )
            SELECT {cols}, h.rank AS rank, (i.key = ?) AS key_hit
            FROM issues i
            LEFT JOIN hits h ON h.id = i.id
            WHERE (h.id IS NOT NULL OR i.key = ?){deleted}
            "#,
            cols = ISSUE_COLUMNS,
            deleted = deleted_clause
        );

        let mut tx = self.pool.begin().await.map_err(read_err)?;
        let count_sql = format!("SELECT COUNT(*) FROM ({})", base);
        let total: i64 = sqlx::query(&count_sql)
            .bind(&expr)
            .bind(&hint)
            .bind(&hint)
            .fetch_one(&mut *tx)
            .await
            .map_err(read_err)?
            .try_get(0)
            .map_err(read_err)?;

        let page_sql = format!(
            "{} ORDER BY key_hit DESC, rank ASC, i.updated_at DESC, i.key ASC LIMIT ? OFFSET ?",
            base
        );
        let rows = sqlx::query(&page_sql)
            .bind(&expr)
            .bind(&hint)
            .bind(&hint)
            .bind(opts.capped_limit() as i64)
            .bind(opts.offset as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(read_err)?;
        tx.commit().await.map_err(read_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let issue = row_to_issue(row)?;
            let rank: Option<f64> = row.try_get("rank").map_err(read_err)?;
            // The index holds lowercased tokens; excerpts come from the stored text.
            let snip = text.snippet(&issue.data);
            out.push((issue, rank.map_or(0.0, |r| -r), snip));
        }
        Ok((out, total.max(0) as usize))
    }

    /// In-process evaluation for predicates without a SQL form (patterns).
    async fn query_scan(
        &self,
        query: &CompiledQuery,
        opts: &ExecOptions,
        started: Instant,
    ) -> Result<ResultPage, QueryError> {
        let sql = format!(
            "SELECT {} FROM issues i{} ORDER BY i.updated_at DESC, i.key ASC",
            ISSUE_COLUMNS,
            if opts.include_deleted {
                ""
            } else {
                " WHERE i.deleted = 0"
            }
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;

        let mut matched = Vec::new();
        for (n, row) in rows.iter().enumerate() {
            if opts.expired() {
                return Err(timed_out(started));
            }
            let issue = row_to_issue(row)?;
            if query.predicate.matches(&issue) {
                matched.push(issue);
            }
            // Regex evaluation is CPU-bound; let other tasks run.
            if n % SCAN_YIELD_EVERY == SCAN_YIELD_EVERY - 1 {
                tokio::task::yield_now().await;
            }
        }
        match &query.ranking {
            Ranking::Sort(spec) => matched.sort_by(|a, b| sort_cmp(spec, a, b)),
            Ranking::Relevance(_) => matched.sort_by(tie_break),
        }

        let total_matched = matched.len();
        let items = matched
            .iter()
            .skip(opts.offset)
            .take(opts.capped_limit())
            .map(|i| IssueSummary::from_issue(i, None, None))
            .collect();
        Ok(ResultPage {
            items,
            total_matched,
            elapsed: started.elapsed(),
            refine_suggested: total_matched > opts.ceiling,
        })
    }

    async fn execute_inner(
        &self,
        query: &CompiledQuery,
        opts: &ExecOptions,
        started: Instant,
    ) -> Result<ResultPage, QueryError> {
        // Free text with a plain text predicate goes through FTS ranking.
        if let (Ranking::Relevance(text), Predicate::Text(_)) = (&query.ranking, &query.predicate) {
            let (hits, total) = self.query_text(text, opts).await?;
            let items = hits
                .iter()
                .map(|(issue, score, snip)| IssueSummary::from_issue(issue, Some(*score), snip.clone()))
                .collect();
            return Ok(ResultPage {
                items,
                total_matched: total,
                elapsed: started.elapsed(),
                refine_suggested: total > opts.ceiling,
            });
        }

        let Some(filter) = translate(&query.predicate) else {
            return self.query_scan(query, opts, started).await;
        };
        let spec = match &query.ranking {
            Ranking::Sort(spec) => spec.clone(),
            Ranking::Relevance(_) => SortSpec::updated_desc(),
        };
        let (issues, total) = self.query_sql(&filter, &order_by(&spec), opts).await?;
        Ok(ResultPage {
            items: issues
                .iter()
                .map(|i| IssueSummary::from_issue(i, None, None))
                .collect(),
            total_matched: total,
            elapsed: started.elapsed(),
            refine_suggested: total > opts.ceiling,
        })
    }

    /// Every stored issue, most recently updated first.
    pub async fn all_issues(&self, include_deleted: bool) -> Result<Vec<Issue>, StoreError> {
        let sql = format!(
            "SELECT {} FROM issues i{} ORDER BY i.updated_at DESC, i.key ASC",
            ISSUE_COLUMNS,
            if include_deleted {
                ""
            } else {
                " WHERE i.deleted = 0"
            }
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;
        rows.iter().map(row_to_issue).collect()
    }

    /// Rebuild every search entry from the stored issues.
    pub async fn reindex(&self) -> Result<usize, StoreError> {
        let sql = format!("SELECT i.id, {} FROM issues i", ISSUE_COLUMNS);
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *tx)
            .await
            .map_err(read_err)?;
        sqlx::query("DELETE FROM issues_fts")
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(read_err)?;
            let issue = row_to_issue(row)?;
            write_search_entry(&mut *tx, id, &issue.data)
                .await
                .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(rows.len())
    }

    /// Rows in the search index.
    pub async fn search_entry_count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM issues_fts")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)
    }

    /// Live and tombstoned issue counts.
    pub async fn issue_counts(&self) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(deleted = 0), 0) AS live, COALESCE(SUM(deleted = 1), 0) AS gone FROM issues",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(read_err)?;
        Ok((
            row.try_get("live").map_err(read_err)?,
            row.try_get("gone").map_err(read_err)?,
        ))
    }

    /// Every scope's checkpoint, most recently touched first.
    pub async fn checkpoints(&self) -> Result<Vec<SyncCheckpoint>, StoreError> {
        let rows = sqlx::query("SELECT * FROM checkpoints ORDER BY updated_at DESC, scope")
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    /// Keys of tombstones deleted before `cutoff`.
    pub async fn tombstones_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar(
            "SELECT key FROM issues WHERE deleted = 1 AND deleted_at < ? ORDER BY key",
        )
        .bind(millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)
    }

    /// Physically remove tombstones. Only ever an explicit operator action.
    pub async fn purge(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let mut purged = 0usize;
        for key in keys {
            let id: Option<i64> =
                sqlx::query_scalar("DELETE FROM issues WHERE key = ? AND deleted = 1 RETURNING id")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(write_err)?;
            if let Some(id) = id {
                sqlx::query("DELETE FROM issues_fts WHERE rowid = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err)?;
                purged += 1;
            }
        }
        tx.commit().await.map_err(write_err)?;
        Ok(purged)
    }
}

#[async_trait]
impl MirrorStore for SqliteStore {
    async fn local_states(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, LocalState>, StoreError> {
        let mut out = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(KEY_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, updated_at, deleted FROM issues WHERE key IN ({})",
                placeholders
            );
            let mut q = sqlx::query(&sql);
            for key in chunk {
                q = q.bind(key);
            }
            for row in q.fetch_all(&self.pool).await.map_err(read_err)? {
                let key: String = row.try_get("key").map_err(read_err)?;
                let updated: i64 = row.try_get("updated_at").map_err(read_err)?;
                let deleted: i64 = row.try_get("deleted").map_err(read_err)?;
                out.insert(
                    key,
                    LocalState {
                        updated: from_millis(updated),
                        deleted: deleted != 0,
                    },
                );
            }
        }
        Ok(out)
    }

    async fn upsert_batch(&self, batch: &IssueBatch<'_>) -> Result<usize, StoreError> {
        let now = millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let mut applied = 0usize;
        for issue in batch.issues {
            if Self::upsert_one(&mut tx, issue, batch.scope, batch.run_id, now)
                .await
                .map_err(write_err)?
            {
                applied += 1;
            }
        }
        for key in batch.observed {
            sqlx::query("UPDATE issues SET scope = ?, last_seen_run = ? WHERE key = ?")
                .bind(batch.scope)
                .bind(batch.run_id)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(applied)
    }

    async fn tombstone(&self, keys: &[String]) -> Result<usize, StoreError> {
        let now = millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let mut count = 0usize;
        for key in keys {
            let r = sqlx::query(
                "UPDATE issues SET deleted = 1, deleted_at = ?, synced_at = ? WHERE key = ? AND deleted = 0",
            )
            .bind(now)
            .bind(now)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
            count += r.rows_affected() as usize;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(count)
    }

    async fn rebuild_search_entry(&self, key: &str) -> Result<bool, StoreError> {
        let sql = format!("SELECT i.id, {} FROM issues i WHERE i.key = ?", ISSUE_COLUMNS);
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let Some(row) = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(read_err)?
        else {
            return Ok(false);
        };
        let id: i64 = row.try_get("id").map_err(read_err)?;
        let issue = row_to_issue(&row)?;
        write_search_entry(&mut *tx, id, &issue.data)
            .await
            .map_err(write_err)?;
        tx.commit().await.map_err(write_err)?;
        Ok(true)
    }

    async fn scope_keys(&self, scope: &str) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM issues WHERE scope = ? AND deleted = 0")
                .bind(scope)
                .fetch_all(&self.pool)
                .await
                .map_err(read_err)?;
        Ok(keys.into_iter().collect())
    }

    async fn seen_keys(&self, scope: &str, run_id: &str) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM issues WHERE scope = ? AND last_seen_run = ?")
                .bind(scope)
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(read_err)?;
        Ok(keys.into_iter().collect())
    }

    async fn get_issue(&self, key: &str) -> Result<Option<Issue>, StoreError> {
        let sql = format!("SELECT {} FROM issues i WHERE i.key = ?", ISSUE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)?;
        row.as_ref().map(row_to_issue).transpose()
    }

    async fn execute(
        &self,
        query: &CompiledQuery,
        opts: &ExecOptions,
    ) -> Result<ResultPage, QueryError> {
        let started = Instant::now();
        if opts.expired() {
            return Err(timed_out(started));
        }
        match opts.deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                tokio::time::timeout_at(deadline, self.execute_inner(query, opts, started))
                    .await
                    .map_err(|_| timed_out(started))?
            }
            None => self.execute_inner(query, opts, started).await,
        }
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<SyncCheckpoint, StoreError> {
    let sync_type: String = row.try_get("sync_type").map_err(read_err)?;
    let last: Option<i64> = row.try_get("last_successful").map_err(read_err)?;
    let cursor: Option<i64> = row.try_get("cursor").map_err(read_err)?;
    let started: Option<i64> = row.try_get("run_started_at").map_err(read_err)?;
    Ok(SyncCheckpoint {
        scope: row.try_get("scope").map_err(read_err)?,
        last_successful: last.map(from_millis),
        cursor: cursor.map(|c| c.max(0) as u64),
        sync_type: SyncType::parse(&sync_type).unwrap_or(SyncType::Full),
        run_id: row.try_get("run_id").map_err(read_err)?,
        run_started_at: started.map(from_millis),
        in_progress: row.try_get::<i64, _>("in_progress").map_err(read_err)? != 0,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<SyncRunRecord, StoreError> {
    let sync_type: String = row.try_get("sync_type").map_err(read_err)?;
    let state: String = row.try_get("state").map_err(read_err)?;
    let finished: Option<i64> = row.try_get("finished_at").map_err(read_err)?;
    let count = |col: &str| -> Result<u64, StoreError> {
        Ok(row.try_get::<i64, _>(col).map_err(read_err)?.max(0) as u64)
    };
    Ok(SyncRunRecord {
        id: row.try_get("id").map_err(read_err)?,
        scope: row.try_get("scope").map_err(read_err)?,
        sync_type: SyncType::parse(&sync_type).unwrap_or(SyncType::Full),
        started_at: from_millis(row.try_get("started_at").map_err(read_err)?),
        finished_at: finished.map(from_millis),
        state: RunState::parse(&state),
        counts: ChangeCounts {
            fetched: count("fetched")?,
            new: count("new_count")?,
            updated: count("updated_count")?,
            unchanged: count("unchanged")?,
            skipped: count("skipped")?,
            deleted: count("deleted")?,
        },
        error: row.try_get("error").map_err(read_err)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load_checkpoint(&self, scope: &str) -> Result<Option<SyncCheckpoint>, StoreError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE scope = ?")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn save_checkpoint(&self, cp: &SyncCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (scope, last_successful, cursor, sync_type, run_id, run_started_at, in_progress, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope) DO UPDATE SET
                last_successful = excluded.last_successful,
                cursor = excluded.cursor,
                sync_type = excluded.sync_type,
                run_id = excluded.run_id,
                run_started_at = excluded.run_started_at,
                in_progress = excluded.in_progress,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&cp.scope)
        .bind(cp.last_successful.map(millis))
        .bind(cp.cursor.map(|c| c as i64))
        .bind(cp.sync_type.as_str())
        .bind(&cp.run_id)
        .bind(cp.run_started_at.map(millis))
        .bind(cp.in_progress as i64)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn record_run(&self, run: &SyncRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, scope, sync_type, started_at, finished_at, state,
                fetched, new_count, updated_count, unchanged, skipped, deleted, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                state = excluded.state,
                fetched = excluded.fetched,
                new_count = excluded.new_count,
                updated_count = excluded.updated_count,
                unchanged = excluded.unchanged,
                skipped = excluded.skipped,
                deleted = excluded.deleted,
                error = excluded.error
            "#,
        )
        .bind(&run.id)
        .bind(&run.scope)
        .bind(run.sync_type.as_str())
        .bind(millis(run.started_at))
        .bind(run.finished_at.map(millis))
        .bind(run.state.as_str())
        .bind(run.counts.fetched as i64)
        .bind(run.counts.new as i64)
        .bind(run.counts.updated as i64)
        .bind(run.counts.unchanged as i64)
        .bind(run.counts.skipped as i64)
        .bind(run.counts.deleted as i64)
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn last_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_runs ORDER BY started_at DESC, id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn try_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expired_before = millis(now) - ttl.as_millis() as i64;
        let r = sqlx::query(
            r#"
            INSERT INTO sync_lease (id, holder, acquired_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at
            WHERE sync_lease.holder = excluded.holder OR sync_lease.acquired_at < ?
            "#,
        )
        .bind(holder)
        .bind(millis(now))
        .bind(expired_before)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(r.rows_affected() > 0)
    }

    async fn release_lease(&self, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_lease WHERE holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(())
    }
}
