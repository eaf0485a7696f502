//! Decay/archive and purge.
//!
//! Archiving flips `is_active` off for stale or abandoned memories and never
//! touches rows that are already inactive. Purge hard-deletes trash older
//! than the configured horizon, except rows shielded by an active supersede
//! chain.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{now_str, timestamp, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOptions {
    /// Age floor for the stale criterion
    pub stale_age_days: i64,
    /// Age floor for the abandoned criterion
    pub abandoned_age_days: i64,
    pub dry_run: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            stale_age_days: 90,
            abandoned_age_days: 365,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReport {
    pub stale: usize,
    pub abandoned: usize,
    pub archived: usize,
    pub dry_run: bool,
}

/// Archive stale (`importance < 0.3`, old, rarely accessed) and abandoned
/// (very old, never accessed) memories.
pub fn run_archive(store: &Store, options: &ArchiveOptions) -> Result<ArchiveReport> {
    let now = Utc::now();
    let stale_cutoff = timestamp(now - Duration::days(options.stale_age_days));
    let abandoned_cutoff = timestamp(now - Duration::days(options.abandoned_age_days));

    let stale_sql = "is_active = 1 AND importance < 0.3 AND created_at < ?1 AND access_count < 2";
    let abandoned_sql = "is_active = 1 AND created_at < ?2 AND access_count = 0";

    let (stale, abandoned) = store.with_reader(|conn| {
        let stale: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM memories WHERE {}", stale_sql),
            params![stale_cutoff],
            |row| row.get(0),
        )?;
        let abandoned: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM memories WHERE ({ab}) AND NOT ({st})",
                ab = abandoned_sql,
                st = stale_sql
            ),
            params![stale_cutoff, abandoned_cutoff],
            |row| row.get(0),
        )?;
        Ok((stale as usize, abandoned as usize))
    })?;

    let mut report = ArchiveReport {
        stale,
        abandoned,
        dry_run: options.dry_run,
        ..Default::default()
    };

    if options.dry_run {
        report.archived = stale + abandoned;
        return Ok(report);
    }

    let archived = store.with_writer_tx(|conn| {
        let changed = conn.execute(
            &format!(
                "UPDATE memories SET is_active = 0, updated_at = ?3
                 WHERE ({}) OR ({})",
                stale_sql, abandoned_sql
            ),
            params![stale_cutoff, abandoned_cutoff, now_str()],
        )?;
        Ok(changed)
    })?;

    report.archived = archived;
    if archived > 0 {
        tracing::info!("archive pass: {} memories archived", archived);
    }
    Ok(report)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeOptions {
    /// Override the `trash.auto_purge_days` setting
    pub purge_days: Option<i64>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub purged: usize,
    pub shielded: usize,
    /// True when the horizon setting is 0 and purge is disabled
    pub disabled: bool,
    pub dry_run: bool,
}

/// Hard-delete trash older than the horizon. Rows whose `superseded_by`
/// points at an active memory are shielded.
pub fn run_purge(store: &Store, options: &PurgeOptions) -> Result<PurgeReport> {
    let purge_days = options
        .purge_days
        .unwrap_or_else(|| store.setting_i64("trash.auto_purge_days", 30));

    let mut report = PurgeReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    if purge_days <= 0 {
        report.disabled = true;
        return Ok(report);
    }

    let cutoff = timestamp(Utc::now() - Duration::days(purge_days));

    let candidate_sql = "is_active = 0 AND updated_at < ?1";
    let shield_sql = "superseded_by IS NOT NULL AND EXISTS (
        SELECT 1 FROM memories s WHERE s.id = memories.superseded_by AND s.is_active = 1)";

    let (purgeable, shielded) = store.with_reader(|conn| {
        let shielded: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM memories WHERE {} AND {}",
                candidate_sql, shield_sql
            ),
            params![cutoff],
            |row| row.get(0),
        )?;
        let purgeable: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM memories WHERE {} AND NOT ({})",
                candidate_sql, shield_sql
            ),
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok((purgeable as usize, shielded as usize))
    })?;

    report.shielded = shielded;

    if options.dry_run {
        report.purged = purgeable;
        return Ok(report);
    }

    let purged = store.with_writer_tx(|conn| {
        let changed = conn.execute(
            &format!(
                "DELETE FROM memories WHERE {} AND NOT ({})",
                candidate_sql, shield_sql
            ),
            params![cutoff],
        )?;
        Ok(changed)
    })?;

    report.purged = purged;
    if purged > 0 {
        tracing::info!("purge pass: {} trash rows deleted", purged);
    }
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
