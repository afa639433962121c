//! Change-set reconciliation.
//!
//! Classification compares only the remote `updated` timestamp with the
//! locally stored one, so each record costs a single map lookup. Deletion
//! detection is a separate step ([`deleted_keys`]) because it is only sound
//! after a complete enumeration of the scope.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::fields::FieldCatalog;
use crate::models::{ChangeCounts, NormalizedIssue, RawIssue};
use crate::normalize::{normalize, NormalizeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Updated,
    Unchanged,
    /// Remote `updated` is older than the stored one. Never applied.
    Stale,
}

/// What the reconciler needs to know about a stored issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalState {
    pub updated: DateTime<Utc>,
    pub deleted: bool,
}

/// Classify one remote record against local state.
///
/// A tombstoned issue that shows up again is `Updated` as long as its
/// timestamp has not gone backwards, which clears the tombstone.
pub fn classify(remote_updated: DateTime<Utc>, local: Option<&LocalState>) -> Classification {
    match local {
        None => Classification::New,
        Some(l) if remote_updated < l.updated => Classification::Stale,
        Some(l) if l.deleted => Classification::Updated,
        Some(l) if remote_updated == l.updated => Classification::Unchanged,
        Some(_) => Classification::Updated,
    }
}

/// A record that was observed but not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    Stale {
        key: String,
        stored: DateTime<Utc>,
        remote: DateTime<Utc>,
    },
    Malformed {
        key: Option<String>,
        error: NormalizeError,
    },
}

/// Reconciler output for one fetched page.
#[derive(Debug, Clone, Default)]
pub struct PageChanges {
    /// New and updated issues, in page order.
    pub upserts: Vec<NormalizedIssue>,
    /// Every key the remote returned on this page, applied or not.
    pub observed: Vec<String>,
    pub counts: ChangeCounts,
    pub anomalies: Vec<Anomaly>,
}

pub struct Reconciler {
    catalog: FieldCatalog,
}

impl Reconciler {
    pub fn new(catalog: FieldCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    /// Normalize and classify a page of remote records.
    ///
    /// `local` must hold the stored state of every key on the page that
    /// exists locally. A key repeated within the page is classified against
    /// the earlier occurrence, so the page is applied in order.
    pub fn reconcile_page(
        &self,
        raws: &[RawIssue],
        local: &HashMap<String, LocalState>,
    ) -> PageChanges {
        let mut changes = PageChanges::default();
        let mut seen: HashMap<String, LocalState> = HashMap::new();
        let mut upsert_index: HashMap<String, usize> = HashMap::new();

        for raw in raws {
            changes.counts.fetched += 1;
            if let Some(key) = raw.key() {
                changes.observed.push(key.to_string());
            }

            let issue = match normalize(raw, &self.catalog) {
                Ok(issue) => issue,
                Err(error) => {
                    changes.counts.skipped += 1;
                    changes.anomalies.push(Anomaly::Malformed {
                        key: raw.key().map(str::to_string),
                        error,
                    });
                    continue;
                }
            };

            let current = seen.get(&issue.key).or_else(|| local.get(&issue.key));
            match classify(issue.updated, current) {
                Classification::Stale => {
                    let stored = current.map(|l| l.updated).unwrap_or(issue.updated);
                    changes.counts.skipped += 1;
                    changes.anomalies.push(Anomaly::Stale {
                        key: issue.key,
                        stored,
                        remote: issue.updated,
                    });
                }
                Classification::Unchanged => changes.counts.unchanged += 1,
                class @ (Classification::New | Classification::Updated) => {
                    seen.insert(
                        issue.key.clone(),
                        LocalState {
                            updated: issue.updated,
                            deleted: false,
                        },
                    );
                    // A later copy of the same key replaces the earlier one
                    // and is counted once.
                    if let Some(&idx) = upsert_index.get(&issue.key) {
                        changes.upserts[idx] = issue;
                        continue;
                    }
                    if class == Classification::New {
                        changes.counts.new += 1;
                    } else {
                        changes.counts.updated += 1;
                    }
                    upsert_index.insert(issue.key.clone(), changes.upserts.len());
                    changes.upserts.push(issue);
                }
            }
        }
        changes
    }
}

/// Keys stored in the scope but not observed by a complete enumeration.
/// Only meaningful after a full sync.
pub fn deleted_keys(stored: &HashSet<String>, observed: &HashSet<String>) -> Vec<String> {
    let mut keys: Vec<String> = stored.difference(observed).cloned().collect();
    keys.sort();
    keys
}
