//! `jmirror backup`, `restore` and `reset-db`.
//!
//! A backup is a `VACUUM INTO` snapshot: one self-contained file that is
//! consistent even while a sync is writing. Restore checks the file is a
//! mirror database on a scratch copy before touching the live one, then
//! brings its schema up to date.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::Config;
use crate::{db, migrate, sqlite_store};

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// `path` with `suffix` appended to its file name (`mirror.sqlite-wal`).
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Delete a database file and its WAL sidecars. Missing files are fine.
fn remove_database_files(path: &Path) -> Result<()> {
    for file in [path.to_path_buf(), sibling(path, "-wal"), sibling(path, "-shm")] {
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", file.display()))
            }
        }
    }
    Ok(())
}

fn size_mb(path: &Path) -> f64 {
    std::fs::metadata(path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

fn require_database(config: &Config) -> Result<()> {
    if !config.db.path.exists() {
        bail!(
            "Database not found at {}. Run `jmirror init` first.",
            config.db.path.display()
        );
    }
    Ok(())
}

pub async fn run_backup(config: &Config, output: &Path) -> Result<()> {
    require_database(config)?;
    if output.exists() {
        bail!("{} already exists; choose a new backup path", output.display());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let pool = db::connect(config).await?;
    sqlx::query("VACUUM INTO ?")
        .bind(output.to_string_lossy().into_owned())
        .execute(&pool)
        .await
        .with_context(|| format!("Failed to write backup to {}", output.display()))?;
    pool.close().await;

    let size = size_mb(output);
    info!(path = %output.display(), size_mb = size, "database backed up");
    println!("Database backup created: {} ({:.1} MB)", output.display(), size);
    Ok(())
}

/// Whether `path` holds a SQLite database with an `issues` table.
async fn is_mirror_database(path: &Path) -> Result<bool> {
    let mut head = [0u8; 16];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if file.read_exact(&mut head).is_err() || &head[..] != SQLITE_MAGIC {
            return Ok(false);
        }
    }
    let pool = db::connect_path(path).await?;
    let found: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'issues'",
    )
    .fetch_one(&pool)
    .await?;
    pool.close().await;
    Ok(found)
}

pub async fn run_restore(config: &Config, input: &Path, force: bool) -> Result<()> {
    if !input.is_file() {
        bail!("Backup file not found: {}", input.display());
    }
    let target = &config.db.path;
    if target.exists() && !force {
        bail!(
            "Database already exists at {}; pass --force to replace it",
            target.display()
        );
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let scratch = sibling(target, ".restore");
    remove_database_files(&scratch)?;
    std::fs::copy(input, &scratch)
        .with_context(|| format!("Failed to copy {}", input.display()))?;
    if !is_mirror_database(&scratch).await? {
        remove_database_files(&scratch)?;
        bail!("{} is not a jmirror database", input.display());
    }

    remove_database_files(target)?;
    std::fs::rename(&scratch, target)
        .with_context(|| format!("Failed to move restored database to {}", target.display()))?;
    remove_database_files(&scratch)?;

    let store = sqlite_store::open(config).await?;
    let (live, deleted) = store.issue_counts().await?;
    store.pool().close().await;

    info!(from = %input.display(), live, deleted, "database restored");
    println!("Database restored from: {}", input.display());
    println!("  {} issues ({} deleted)", live, deleted);
    println!("  Database size: {:.1} MB", size_mb(target));
    Ok(())
}

pub async fn run_reset_db(config: &Config, force: bool) -> Result<()> {
    if !force {
        bail!("reset-db deletes every mirrored issue and sync checkpoint; pass --force to confirm");
    }
    remove_database_files(&config.db.path)?;
    migrate::run_migrations(config).await?;
    info!(path = %config.db.path.display(), "database reset");
    println!("Database reset: {}", config.db.path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_paths() {
        let p = Path::new("/data/mirror.sqlite");
        assert_eq!(sibling(p, "-wal"), PathBuf::from("/data/mirror.sqlite-wal"));
        assert_eq!(sibling(p, ".restore"), PathBuf::from("/data/mirror.sqlite.restore"));
    }

    #[test]
    fn test_remove_database_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("m.sqlite");
        std::fs::write(&db, b"x").unwrap();
        std::fs::write(sibling(&db, "-wal"), b"x").unwrap();
        remove_database_files(&db).unwrap();
        assert!(!db.exists());
        assert!(!sibling(&db, "-wal").exists());
        // Nothing left to remove is not an error.
        remove_database_files(&db).unwrap();
    }

    #[tokio::test]
    async fn test_plain_file_is_not_a_mirror_database() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, b"hello, this is not sqlite").unwrap();
        assert!(!is_mirror_database(&path).await.unwrap());
    }
}
