//! `jmirror cleanup`: physically remove old tombstones.
//!
//! Sync never deletes rows; this is the only path that does, and only for
//! issues that have been tombstoned for longer than the retention window.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use tracing::info;

use crate::config::Config;
use crate::sqlite_store;

pub async fn run_cleanup(config: &Config, days: i64, dry_run: bool) -> Result<()> {
    if days < 0 {
        bail!("--days must not be negative");
    }
    let store = sqlite_store::open(config).await?;
    let cutoff = Utc::now() - Duration::days(days);
    let keys = store.tombstones_before(cutoff).await?;

    if keys.is_empty() {
        println!("No tombstones older than {} days.", days);
        store.pool().close().await;
        return Ok(());
    }

    if dry_run {
        println!("Would purge {} tombstoned issues:", keys.len());
        for key in &keys {
            println!("  {}", key);
        }
        store.pool().close().await;
        return Ok(());
    }

    let purged = store.purge(&keys).await?;
    info!(purged, days, "purged tombstones");
    println!("Purged {} tombstoned issues.", purged);
    store.pool().close().await;
    Ok(())
}
