//! # Jira Mirror
//!
//! A local, searchable mirror of Jira issues.
//!
//! A sync engine keeps a SQLite copy of one Jira scope up to date
//! (incremental by default, full on demand, resumable after a crash), and a
//! query engine answers free-text, JQL-style and regex searches against it
//! without touching the remote system.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ Jira REST   │──▶│ GuardedSource │──▶│ Orchestrator  │
//! │ (source/)   │   │ rate + retry  │   │ reconcile     │
//! └─────────────┘   └───────────────┘   └──────┬────────┘
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │ SQLite store  │
//!                                      │ issues + FTS5 │
//!                                      └──────┬────────┘
//!                           ┌─────────────────┤
//!                           ▼                 ▼
//!                      ┌──────────┐     ┌──────────┐
//!                      │   CLI    │     │   HTTP   │
//!                      │(jmirror) │     │  (axum)  │
//!                      └──────────┘     └──────────┘
//! ```
//!
//! Models, normalization, reconciliation and the query language live in the
//! runtime-independent `jira-mirror-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! jmirror init
//! jmirror test-connection
//! jmirror sync --full
//! jmirror search "login timeout"
//! jmirror search 'status = "In Progress" AND assignee = alice' --mode jql
//! jmirror serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and the per-run settings snapshot |
//! | [`source`] | Remote source trait, Jira adapter, rate limit and retry |
//! | [`sync`] | Sync orchestrator, coordinator and lease |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`sql_translate`] | Predicate to SQL translation |
//! | [`server`] | HTTP request layer |
//! | [`api_auth`] | API keys and per-client rate limits for `/api` |
//! | [`export`] | CSV and JSON export |
//! | [`backup`] | Backup, restore and reset of the database |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod api_auth;
pub mod backup;
pub mod cleanup;
pub mod config;
pub mod config_cmd;
pub mod db;
pub mod error;
pub mod export;
pub mod fields_cmd;
pub mod get;
pub mod migrate;
pub mod search;
pub mod server;
pub mod source;
pub mod sql_translate;
pub mod sqlite_store;
pub mod status;
pub mod sync;
pub mod sync_cmd;
