//! # Jira Mirror Core
//!
//! Runtime-independent logic for Jira Mirror: issue models, enum
//! normalization, change-set reconciliation, the query language, and the
//! store abstraction with an in-memory backend.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! The application crate supplies the remote source, the SQLite store, and
//! the sync orchestrator.

pub mod fields;
pub mod models;
pub mod normalize;
pub mod query;
pub mod reconcile;
pub mod store;
