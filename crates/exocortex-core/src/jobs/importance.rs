//! Importance adjustment and recalibration.
//!
//! Adjustment boosts frequently accessed memories and decays untouched ones;
//! pinned memories (importance exactly 1.0) are never moved. Recalibration
//! percentile-normalizes the whole active distribution into [0.10, 0.90].

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{now_str, timestamp, Store};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustOptions {
    /// Extra boost for memories attached to high-centrality entities
    pub graph_aware: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustReport {
    pub boosted: usize,
    pub decayed: usize,
    pub graph_boosted: usize,
    /// True when `importance.auto_adjust` is off and nothing ran
    pub skipped: bool,
    pub dry_run: bool,
}

pub fn run_importance_adjust(store: &Store, options: &AdjustOptions) -> Result<AdjustReport> {
    let mut report = AdjustReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    if !store.setting_bool("importance.auto_adjust", true) {
        report.skipped = true;
        return Ok(report);
    }

    let boost_threshold = store.setting_i64("importance.boost_threshold", 5);
    let decay_age_days = store.setting_i64("importance.decay_age_days", 30);
    let decay_cutoff = timestamp(Utc::now() - Duration::days(decay_age_days));

    let boost_sql = "is_active = 1 AND access_count >= ?1 AND importance < 0.8 AND importance < 1.0";
    let decay_sql =
        "is_active = 1 AND access_count = 0 AND created_at < ?1 AND importance > 0.3 AND importance < 1.0";

    if options.dry_run {
        let (boosted, decayed) = store.with_reader(|conn| {
            let boosted: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM memories WHERE {}", boost_sql),
                params![boost_threshold],
                |row| row.get(0),
            )?;
            let decayed: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM memories WHERE {}", decay_sql),
                params![decay_cutoff],
                |row| row.get(0),
            )?;
            Ok((boosted as usize, decayed as usize))
        })?;
        report.boosted = boosted;
        report.decayed = decayed;
        return Ok(report);
    }

    let (boosted, decayed) = store.with_writer_tx(|conn| {
        let now = now_str();
        let boosted = conn.execute(
            &format!(
                "UPDATE memories SET importance = MIN(0.9, importance + 0.1), updated_at = ?2
                 WHERE {}",
                boost_sql
            ),
            params![boost_threshold, now],
        )?;
        let decayed = conn.execute(
            &format!(
                "UPDATE memories SET importance = MAX(0.1, importance - 0.05), updated_at = ?2
                 WHERE {}",
                decay_sql
            ),
            params![decay_cutoff, now],
        )?;
        Ok((boosted, decayed))
    })?;
    report.boosted = boosted;
    report.decayed = decayed;

    if options.graph_aware {
        report.graph_boosted = graph_aware_boost(store)?;
    }

    Ok(report)
}

/// Extra +0.05 for memories attached to the top-10%-centrality entities,
/// centrality being the number of memory links an entity carries.
fn graph_aware_boost(store: &Store) -> Result<usize> {
    let top_entities = store.with_reader(|conn| {
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let keep = ((total as f64) * 0.10).ceil() as i64;
        let mut stmt = conn.prepare(
            "SELECT e.id FROM entities e
             JOIN memory_entities me ON me.entity_id = e.id
             GROUP BY e.id
             ORDER BY COUNT(me.memory_id) DESC
             LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![keep], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    })?;

    if top_entities.is_empty() {
        return Ok(0);
    }

    store.with_writer_tx(|conn| {
        let placeholders = vec!["?"; top_entities.len()].join(", ");
        let sql = format!(
            "UPDATE memories SET importance = MIN(0.9, importance + 0.05)
             WHERE is_active = 1 AND importance < 0.9 AND importance < 1.0
               AND id IN (SELECT memory_id FROM memory_entities WHERE entity_id IN ({}))",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let changed = stmt.execute(rusqlite::params_from_iter(top_entities.iter()))?;
        Ok(changed)
    })
}

// ============================================================================
// RECALIBRATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalibrateOptions {
    pub dry_run: bool,
}

/// Moments and quartiles of an importance distribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStats {
    pub mean: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
}

impl DistributionStats {
    fn from_sorted(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let quartile = |q: f64| -> f64 {
            let pos = q * (values.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            if lo == hi {
                values[lo]
            } else {
                values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)
            }
        };
        Self {
            mean,
            std_dev: variance.sqrt(),
            q1: quartile(0.25),
            median: quartile(0.5),
            q3: quartile(0.75),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalibrateReport {
    pub adjusted: usize,
    pub before: DistributionStats,
    pub after: DistributionStats,
    pub dry_run: bool,
}

/// Percentile-rank normalize active non-pinned importances into
/// [0.10, 0.90].
pub fn run_recalibrate(store: &Store, options: &RecalibrateOptions) -> Result<RecalibrateReport> {
    let rows = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, importance FROM memories
             WHERE is_active = 1 AND importance < 1.0
             ORDER BY importance ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut before: Vec<f64> = rows.iter().map(|(_, imp)| *imp).collect();
    before.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = rows.len();
    let targets: Vec<(String, f64)> = rows
        .iter()
        .enumerate()
        .map(|(rank, (id, _))| {
            let percentile = if n <= 1 {
                0.5
            } else {
                rank as f64 / (n - 1) as f64
            };
            (id.clone(), 0.10 + 0.80 * percentile)
        })
        .collect();

    let mut report = RecalibrateReport {
        before: DistributionStats::from_sorted(&before),
        dry_run: options.dry_run,
        ..Default::default()
    };

    let mut after: Vec<f64> = targets.iter().map(|(_, t)| *t).collect();
    after.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    report.after = DistributionStats::from_sorted(&after);

    if options.dry_run || targets.is_empty() {
        return Ok(report);
    }

    let adjusted = store.with_writer_tx(|conn| {
        let now = now_str();
        let mut stmt = conn.prepare(
            "UPDATE memories SET importance = ?1, updated_at = ?2 WHERE id = ?3",
        )?;
        let mut adjusted = 0usize;
        for (id, target) in &targets {
            adjusted += stmt.execute(params![target, now, id])?;
        }
        Ok(adjusted)
    })?;

    report.adjusted = adjusted;
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
