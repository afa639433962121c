use anyhow::Result;
use jira_mirror_core::normalize::{code_for, EnumKind, ENUM_TABLE_VERSION};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

const ENUM_VERSION_KEY: &str = "enum_table_version";

// Issues: one row per key, tombstoned rather than deleted. `id` doubles as
// the rowid of the issue's search entry.
const ISSUES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS issues (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        project_key TEXT NOT NULL,
        project_name TEXT,
        key_num INTEGER NOT NULL,
        issue_type TEXT,
        summary TEXT NOT NULL,
        description TEXT,
        status_code INTEGER NOT NULL DEFAULT 0,
        status_name TEXT,
        priority_code INTEGER NOT NULL DEFAULT 0,
        priority_name TEXT,
        assignee_id TEXT,
        assignee_name TEXT,
        reporter_id TEXT,
        reporter_name TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        labels_json TEXT NOT NULL DEFAULT '[]',
        components_json TEXT NOT NULL DEFAULT '[]',
        comments_text TEXT,
        comments_json TEXT NOT NULL DEFAULT '[]',
        custom_json TEXT NOT NULL DEFAULT '{}',
        raw_json TEXT,
        content_hash TEXT NOT NULL,
        scope TEXT,
        last_seen_run TEXT,
        deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at INTEGER,
        synced_at INTEGER NOT NULL
    )
"#;

const ISSUE_DATA_COLUMNS: &str = "key, project_key, project_name, key_num, issue_type, summary, \
     description, status_code, status_name, priority_code, priority_name, assignee_id, \
     assignee_name, reporter_id, reporter_name, created_at, updated_at, labels_json, \
     components_json, comments_text, comments_json, custom_json, raw_json, content_hash, scope, \
     last_seen_run, deleted, deleted_at, synced_at";

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema if needed and bring enum codes up to date. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(ISSUES_TABLE).execute(pool).await?;
    if !has_column(pool, "issues", "id").await? {
        rekey_issues(pool).await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_updated ON issues(updated_at DESC, key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_scope ON issues(scope, last_seen_run)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_deleted ON issues(deleted, deleted_at)")
        .execute(pool)
        .await?;

    // Resume state, one row per scope
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            scope TEXT PRIMARY KEY,
            last_successful INTEGER,
            cursor INTEGER,
            sync_type TEXT NOT NULL,
            run_id TEXT,
            run_started_at INTEGER,
            in_progress INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            sync_type TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            state TEXT NOT NULL,
            fetched INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            updated_count INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-writer lease shared by every process using this database
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_lease (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mirror_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search representation: pre-tokenized text, so SQLite and the query
    // front-end agree on token boundaries. The rowid is `issues.id`.
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='issues_fts'",
    )
    .fetch_one(pool)
    .await?;
    // Older databases keyed search entries by an unindexed `key` column.
    let fts_keyed_by_text = fts_exists && has_column(pool, "issues_fts", "key").await?;
    if fts_keyed_by_text {
        sqlx::query("DROP TABLE issues_fts").execute(pool).await?;
    }

    if !fts_exists || fts_keyed_by_text {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE issues_fts USING fts5(
                terms,
                tokenize = "unicode61 remove_diacritics 0 tokenchars '-'"
            )
            "#,
        )
        .execute(pool)
        .await?;
        let indexed = SqliteStore::new(pool.clone()).reindex().await?;
        if indexed > 0 {
            info!(issues = indexed, "rebuilt search index");
        }
    }

    refresh_enum_codes(pool).await?;

    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('{}') WHERE name = ?",
        table
    );
    Ok(sqlx::query_scalar(&sql).bind(column).fetch_one(pool).await?)
}

/// Copy an `issues` table keyed by text into one with an integer `id`. The
/// old search index goes with it and is rebuilt afterwards.
async fn rekey_issues(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("ALTER TABLE issues RENAME TO issues_by_key")
        .execute(&mut *tx)
        .await?;
    sqlx::query(ISSUES_TABLE).execute(&mut *tx).await?;
    let copy = format!(
        "INSERT INTO issues ({cols}) SELECT {cols} FROM issues_by_key ORDER BY key",
        cols = ISSUE_DATA_COLUMNS
    );
    let copied = sqlx::query(&copy).execute(&mut *tx).await?.rows_affected();
    sqlx::query("DROP TABLE issues_by_key").execute(&mut *tx).await?;
    sqlx::query("DROP TABLE IF EXISTS issues_fts")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(issues = copied, "moved issues to integer row ids");
    Ok(())
}

/// Re-derive stored enum codes from their labels when the code table changed.
async fn refresh_enum_codes(pool: &SqlitePool) -> Result<()> {
    let stored: Option<String> = sqlx::query_scalar("SELECT value FROM mirror_meta WHERE key = ?")
        .bind(ENUM_VERSION_KEY)
        .fetch_optional(pool)
        .await?;
    let current = ENUM_TABLE_VERSION.to_string();
    if stored.as_deref() == Some(current.as_str()) {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    let rows = sqlx::query("SELECT key, status_name, priority_name FROM issues")
        .fetch_all(&mut *tx)
        .await?;
    for row in &rows {
        let key: String = row.get("key");
        let status: Option<String> = row.get("status_name");
        let priority: Option<String> = row.get("priority_name");
        sqlx::query("UPDATE issues SET status_code = ?, priority_code = ? WHERE key = ?")
            .bind(status.map_or(0, |s| code_for(EnumKind::Status, &s)))
            .bind(priority.map_or(0, |p| code_for(EnumKind::Priority, &p)))
            .bind(&key)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        "INSERT INTO mirror_meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(ENUM_VERSION_KEY)
    .bind(&current)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    if !rows.is_empty() {
        info!(
            issues = rows.len(),
            from = stored.as_deref().unwrap_or("none"),
            to = %current,
            "re-derived enum codes"
        );
    }
    Ok(())
}
