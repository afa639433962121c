//! `jmirror search`, `suggest` and `validate`.

use std::sync::Arc;

use anyhow::{bail, Result};
use jira_mirror_core::query::engine::SearchRequest;
use jira_mirror_core::query::{Query, QueryEngine, QueryError, QueryMode, ResultPage};

use crate::config::Config;
use crate::sqlite_store::{self, SqliteStore};

pub fn parse_mode(mode: &str) -> Result<QueryMode> {
    match QueryMode::parse(mode) {
        Some(m) => Ok(m),
        None => bail!("Unknown search mode: {}. Use natural, jql, or regex.", mode),
    }
}

/// Open the store and wrap it in a query engine configured from `config`.
pub async fn open_engine(config: &Config) -> Result<(Arc<SqliteStore>, QueryEngine<SqliteStore>)> {
    let store = Arc::new(sqlite_store::open(config).await?);
    let engine = QueryEngine::new(store.clone(), config.catalog(), config.engine_settings());
    Ok((store, engine))
}

/// Print a syntax error with a caret under the offending position.
fn print_query_error(raw: &str, err: &QueryError) {
    if let QueryError::Syntax { position, reason } = err {
        eprintln!("Error: {}", reason);
        eprintln!("  {}", raw);
        let col = raw
            .char_indices()
            .take_while(|(i, _)| i < position)
            .count();
        eprintln!("  {}^", " ".repeat(col));
    } else {
        eprintln!("Error: {}", err);
    }
}

fn print_page(page: &ResultPage, offset: usize) {
    for (i, item) in page.items.iter().enumerate() {
        let score = item
            .score
            .map(|s| format!("[{:.2}] ", s))
            .unwrap_or_default();
        let tomb = if item.deleted { " (deleted)" } else { "" };
        println!("{}. {}{}{}  {}", offset + i + 1, score, item.key, tomb, item.summary);
        println!(
            "    status: {} | priority: {} | assignee: {}",
            item.status.as_deref().unwrap_or("-"),
            item.priority.as_deref().unwrap_or("-"),
            item.assignee.as_deref().unwrap_or("unassigned")
        );
        println!("    updated: {}", item.updated.format("%Y-%m-%d %H:%M"));
        if let Some(snippet) = &item.snippet {
            println!("    excerpt: \"{}\"", snippet.replace('\n', " ").trim());
        }
        println!();
    }
    println!(
        "{} of {} matches in {} ms",
        page.items.len(),
        page.total_matched,
        page.elapsed.as_millis()
    );
    if page.refine_suggested {
        println!("Too many matches; refine the query to see everything.");
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    limit: Option<usize>,
    offset: usize,
    include_deleted: bool,
    json: bool,
) -> Result<()> {
    let mode = parse_mode(mode)?;
    let (store, engine) = open_engine(config).await?;

    let request = SearchRequest {
        limit,
        offset,
        include_deleted,
        ..SearchRequest::new(Query::new(mode, query))
    };
    let page = match engine.search(&request).await {
        Ok(page) => page,
        Err(e) => {
            print_query_error(query, &e);
            store.pool().close().await;
            std::process::exit(1);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else if page.items.is_empty() {
        println!("No results.");
    } else {
        print_page(&page, offset);
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_suggest(config: &Config, prefix: &str, mode: &str) -> Result<()> {
    let mode = parse_mode(mode)?;
    let (store, engine) = open_engine(config).await?;
    let suggestions = engine.suggest(prefix, mode).await?;
    if suggestions.is_empty() {
        println!("No suggestions.");
    }
    for s in &suggestions {
        match &s.assignee {
            Some(who) => println!("{}  {}  ({})", s.key, s.summary, who),
            None => println!("{}  {}", s.key, s.summary),
        }
    }
    store.pool().close().await;
    Ok(())
}

pub async fn run_validate(config: &Config, query: &str, mode: &str) -> Result<()> {
    let mode = parse_mode(mode)?;
    let (store, engine) = open_engine(config).await?;
    let result = engine.validate(&Query::new(mode, query));
    store.pool().close().await;
    match result {
        Ok(()) => {
            println!("OK: valid {} query", mode.as_str());
            Ok(())
        }
        Err(e) => {
            print_query_error(query, &e);
            std::process::exit(1);
        }
    }
}
