//! Weight tuning from retrieval usefulness feedback.
//!
//! Compares the population that was retrieved and marked useful against the
//! population retrieved but never marked useful. A clear difference in age,
//! access, or link count nudges the corresponding ranking weight by 0.02,
//! bounded to [0.02, 0.40]. Needs at least five samples on each side.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::Store;

/// Weight step per tuning pass.
const STEP: f64 = 0.02;
/// Weights never leave this band.
const WEIGHT_MIN: f64 = 0.02;
const WEIGHT_MAX: f64 = 0.40;
/// Relative group difference that counts as a signal.
const RELATIVE_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuneOptions {
    /// Minimum samples per group
    pub min_samples: usize,
    pub dry_run: bool,
}

impl Default for TuneOptions {
    fn default() -> Self {
        Self {
            min_samples: 5,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuneReport {
    pub tuned: bool,
    /// (setting key, old value, new value)
    pub changes: Vec<(String, f64, f64)>,
    pub useful_samples: usize,
    pub not_useful_samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupMeans {
    age_days: f64,
    access: f64,
    links: f64,
}

fn group_means(store: &Store, useful: bool) -> Result<(usize, GroupMeans)> {
    let predicate = if useful {
        "useful_count > 0"
    } else {
        "access_count > 0 AND useful_count = 0"
    };

    store.with_reader(|conn| {
        let sql = format!(
            "SELECT m.created_at, m.access_count,
                    (SELECT COUNT(*) FROM memory_links l
                     WHERE l.source_id = m.id OR l.target_id = m.id) AS links
             FROM memories m WHERE m.is_active = 1 AND {}",
            predicate
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let n = rows.len();
        if n == 0 {
            return Ok((0, GroupMeans::default()));
        }

        let now = Utc::now();
        let mut means = GroupMeans::default();
        for (created_at, access, links) in &rows {
            if let Ok(created) = chrono::DateTime::parse_from_rfc3339(created_at) {
                let age =
                    (now - created.with_timezone(&Utc)).num_seconds().max(0) as f64 / 86_400.0;
                means.age_days += age;
            }
            means.access += *access as f64;
            means.links += *links as f64;
        }
        means.age_days /= n as f64;
        means.access /= n as f64;
        means.links /= n as f64;
        Ok((n, means))
    })
}

/// Signed signal: +1 when the useful group is clearly higher, -1 when
/// clearly lower, 0 inside the noise band.
fn signal(useful: f64, not_useful: f64) -> i8 {
    let denom = useful.abs().max(not_useful.abs()).max(1e-9);
    let relative = (useful - not_useful) / denom;
    if relative > RELATIVE_THRESHOLD {
        1
    } else if relative < -RELATIVE_THRESHOLD {
        -1
    } else {
        0
    }
}

pub fn run_weight_tune(store: &Store, options: &TuneOptions) -> Result<TuneReport> {
    let (useful_n, useful) = group_means(store, true)?;
    let (not_useful_n, not_useful) = group_means(store, false)?;

    let mut report = TuneReport {
        useful_samples: useful_n,
        not_useful_samples: not_useful_n,
        dry_run: options.dry_run,
        ..Default::default()
    };

    if useful_n < options.min_samples || not_useful_n < options.min_samples {
        report.skip_reason = Some(format!(
            "insufficient samples (useful {}, not useful {}, need {})",
            useful_n, not_useful_n, options.min_samples
        ));
        return Ok(report);
    }

    // Age runs opposite to recency: younger useful memories argue for a
    // stronger recency weight.
    let mut nudges: Vec<(&str, i8)> = Vec::new();
    nudges.push((
        "scoring.recency_weight",
        -signal(useful.age_days, not_useful.age_days),
    ));
    nudges.push((
        "scoring.frequency_weight",
        signal(useful.access, not_useful.access),
    ));
    nudges.push(("scoring.graph_weight", signal(useful.links, not_useful.links)));

    for (key, direction) in nudges {
        if direction == 0 {
            continue;
        }
        let current = store.setting_f64(key, 0.10);
        let proposed = (current + STEP * direction as f64).clamp(WEIGHT_MIN, WEIGHT_MAX);
        if (proposed - current).abs() < 1e-12 {
            continue;
        }
        if !options.dry_run {
            store.set_setting(key, &format!("{:.4}", proposed))?;
        }
        report.changes.push((key.to_string(), current, proposed));
    }

    report.tuned = !report.changes.is_empty();
    if report.tuned {
        tracing::info!("weight tune applied {} changes", report.changes.len());
    }
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateMemoryInput;
    use rusqlite::params;

    fn seed(store: &Store, content: &str, access: i64, useful: i64, age_days: i64) {
        let id = store
            .create_memory(CreateMemoryInput::new(content))
            .unwrap()
            .memory
            .id;
        let created =
            crate::storage::timestamp(Utc::now() - chrono::Duration::days(age_days));
        store
            .with_writer(|conn| {
                conn.execute(
                    "UPDATE memories SET access_count = ?1, useful_count = ?2, created_at = ?3
                     WHERE id = ?4",
                    params![access, useful, created, id],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_insufficient_samples_skips() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "lonely useful memory", 3, 2, 5);

        let report = run_weight_tune(&store, &TuneOptions::default()).unwrap();
        assert!(!report.tuned);
        assert!(report.skip_reason.is_some());
    }

    #[test]
    fn test_tune_nudges_frequency_weight() {
        let store = Store::open_in_memory().unwrap();
        // Useful group: heavily accessed, same age profile.
        for i in 0..5 {
            seed(&store, &format!("useful sample number {}", i), 20, 3, 10);
        }
        // Retrieved-but-not-useful group: barely accessed.
        for i in 0..5 {
            seed(&store, &format!("noise sample number {}", i), 1, 0, 10);
        }

        let before = store.setting_f64("scoring.frequency_weight", 0.10);
        let report = run_weight_tune(&store, &TuneOptions::default()).unwrap();
        assert!(report.tuned);
        let after = store.setting_f64("scoring.frequency_weight", 0.10);
        assert!((after - (before + STEP)).abs() < 1e-9);
    }

    #[test]
    fn test_tune_respects_bounds() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("scoring.frequency_weight", "0.40").unwrap();
        for i in 0..5 {
            seed(&store, &format!("useful capped {}", i), 20, 3, 10);
        }
        for i in 0..5 {
            seed(&store, &format!("noise capped {}", i), 1, 0, 10);
        }

        run_weight_tune(&store, &TuneOptions::default()).unwrap();
        assert!(store.setting_f64("scoring.frequency_weight", 0.0) <= WEIGHT_MAX + 1e-9);
    }

    #[test]
    fn test_dry_run_reports_without_writing() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            seed(&store, &format!("useful dry {}", i), 20, 3, 10);
        }
        for i in 0..5 {
            seed(&store, &format!("noise dry {}", i), 1, 0, 10);
        }

        let before = store.setting_f64("scoring.frequency_weight", 0.10);
        let report = run_weight_tune(
            &store,
            &TuneOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(report.tuned);
        assert_eq!(store.setting_f64("scoring.frequency_weight", 0.10), before);
    }
}
