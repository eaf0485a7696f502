//! Backups: timestamp-named byte-identical copies with retention pruning
//! and an optional mirror directory.
//!
//! The WAL is checkpointed (TRUNCATE) and the live file copied while the
//! writer is held, so the copy is a complete, byte-identical snapshot.

use std::path::{Path, PathBuf};

use chrono::Local;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::storage::Store;

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub path: PathBuf,
    pub pruned: usize,
    pub mirrored_to: Option<PathBuf>,
}

/// Write a timestamped backup next to the store (or into `dir`), prune to
/// `backup.max_count`, and mirror when `backup.copy_to` is set.
pub fn run_backup(store: &Store, dir: Option<PathBuf>) -> Result<BackupReport> {
    let backup_dir = match dir {
        Some(d) => d,
        None => {
            let parent = store
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            parent.join("backups")
        }
    };
    std::fs::create_dir_all(&backup_dir)?;

    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let target = backup_dir.join(format!("exocortex-{}.db", stamp));

    // Holding the writer keeps the file stable between the checkpoint and
    // the copy.
    let source = store.path().to_path_buf();
    store.with_writer(|conn| {
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        std::fs::copy(&source, &target)?;
        Ok(())
    })?;

    let max_count = store.setting_i64("backup.max_count", 7).max(1) as usize;
    let pruned = prune_backups(&backup_dir, max_count)?;

    let mirrored_to = match store.setting("backup.copy_to")? {
        Some(copy_to) if !copy_to.trim().is_empty() => {
            let mirror_dir = PathBuf::from(copy_to.trim());
            std::fs::create_dir_all(&mirror_dir)?;
            let mirror = mirror_dir.join(target.file_name().unwrap_or_default());
            std::fs::copy(&target, &mirror)?;
            Some(mirror)
        }
        _ => None,
    };

    tracing::info!("backup written to {}", target.display());
    Ok(BackupReport {
        path: target,
        pruned,
        mirrored_to,
    })
}

/// Remove the oldest backups beyond `keep`. Timestamp-named files sort
/// chronologically.
fn prune_backups(dir: &Path, keep: usize) -> Result<usize> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension().map(|e| e == "db").unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("exocortex-"))
                    .unwrap_or(false)
        })
        .collect();
    backups.sort();

    let mut pruned = 0;
    while backups.len() > keep {
        let oldest = backups.remove(0);
        if let Err(e) = std::fs::remove_file(&oldest) {
            tracing::warn!("could not prune backup {}: {}", oldest.display(), e);
        } else {
            pruned += 1;
        }
    }
    Ok(pruned)
}

/// Restore check: open a backup file and count its memories.
pub fn verify_backup(path: &Path) -> Result<i64> {
    let conn = Connection::open(path)?;
    let count = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .map_err(|e| Error::SchemaCorrupt(format!("backup unreadable: {}", e)))?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateMemoryInput;

    #[test]
    fn test_backup_is_byte_identical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(dir.path().join("live.db"))).unwrap();
        for i in 0..3 {
            store
                .create_memory(CreateMemoryInput::new(format!("backup fixture {}", i)))
                .unwrap();
        }

        let report = run_backup(&store, Some(dir.path().join("backups"))).unwrap();
        assert!(report.path.exists());
        assert_eq!(verify_backup(&report.path).unwrap(), 3);

        let live = std::fs::read(dir.path().join("live.db")).unwrap();
        let copy = std::fs::read(&report.path).unwrap();
        assert_eq!(live, copy);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for stamp in ["20260101-010101", "20260102-010101", "20260103-010101"] {
            std::fs::write(dir.path().join(format!("exocortex-{}.db", stamp)), b"x").unwrap();
        }

        let pruned = prune_backups(dir.path(), 2).unwrap();
        assert_eq!(pruned, 1);
        assert!(!dir.path().join("exocortex-20260101-010101.db").exists());
        assert!(dir.path().join("exocortex-20260103-010101.db").exists());
    }

    #[test]
    fn test_mirror_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror");
        let store = Store::open(Some(dir.path().join("live.db"))).unwrap();
        store
            .set_setting("backup.copy_to", mirror.to_str().unwrap())
            .unwrap();
        store
            .create_memory(CreateMemoryInput::new("mirrored memory"))
            .unwrap();

        let report = run_backup(&store, Some(dir.path().join("backups"))).unwrap();
        let mirrored = report.mirrored_to.expect("mirror path");
        assert!(mirrored.exists());
        assert_eq!(verify_backup(&mirrored).unwrap(), 1);
    }
}
