//! Retrieval-regression: golden queries, baseline snapshots, and drift
//! metrics.
//!
//! Golden queries persist in settings (`retrieval_regression.golden_queries`)
//! as either bare strings or `{query, tags?, contentType?, includeMetadata?}`
//! objects. Each run re-executes every golden query, compares the top-k ids
//! against the stored baseline, and records per-query drift. The first run
//! of a query initializes its baseline without alerting.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::extract::query_fingerprint;
use crate::storage::{now_str, Store};
use crate::types::{ContentType, CreateMemoryInput, SearchQuery};

/// A golden query as persisted: a bare string or a configured object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GoldenQuery {
    Bare(String),
    Configured {
        query: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default, rename = "contentType")]
        content_type: Option<String>,
        #[serde(default, rename = "includeMetadata")]
        include_metadata: bool,
    },
}

impl GoldenQuery {
    pub fn query_text(&self) -> &str {
        match self {
            GoldenQuery::Bare(q) => q,
            GoldenQuery::Configured { query, .. } => query,
        }
    }

    /// Stable identity for baseline storage.
    pub fn key(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        query_fingerprint(&canonical)
    }

    fn to_search(&self, limit: usize) -> SearchQuery {
        match self {
            GoldenQuery::Bare(query) => SearchQuery {
                query: query.clone(),
                limit,
                ..Default::default()
            },
            GoldenQuery::Configured {
                query,
                tags,
                content_type,
                include_metadata,
            } => SearchQuery {
                query: query.clone(),
                limit,
                tags: tags.clone(),
                content_type: content_type.as_deref().map(ContentType::parse_name),
                include_metadata: *include_metadata,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionOptions {
    /// Override the configured per-query result depth
    pub limit: Option<usize>,
    /// Replace baselines with this run's results after comparing
    pub update_baselines: bool,
    /// Emit an alert memory when breaches occur (also requires the
    /// `retrieval_regression.create_alert_memory` setting)
    pub create_alert_memory: bool,
    /// Override the persisted golden queries
    pub queries: Option<Vec<GoldenQuery>>,
}

impl Default for RegressionOptions {
    fn default() -> Self {
        Self {
            limit: None,
            update_baselines: false,
            create_alert_memory: true,
            queries: None,
        }
    }
}

/// Drift metrics for one golden query in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRegression {
    pub query: String,
    pub query_key: String,
    pub current_ids: Vec<String>,
    pub baseline_ids: Vec<String>,
    /// `|baseline ∩ current| / k`
    pub overlap: f64,
    /// Mean absolute index shift of shared ids; k when nothing overlaps
    pub avg_rank_shift: f64,
    pub exact_order: bool,
    pub alert: bool,
    /// True when this run created the baseline
    pub initialized: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionReport {
    pub run_id: String,
    pub results: Vec<QueryRegression>,
    pub alerts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_memory_id: Option<String>,
}

/// Compare a current ranking against its baseline. The denominator is the
/// effective depth: the configured k capped to the larger of the two result
/// sets, so a store with fewer results than k does not alert forever.
fn drift_metrics(baseline: &[String], current: &[String], k: usize) -> (f64, f64, bool) {
    let k = k.min(baseline.len().max(current.len())).max(1);
    let shared: Vec<&String> = baseline.iter().filter(|id| current.contains(id)).collect();
    let overlap = shared.len() as f64 / k as f64;

    let avg_shift = if shared.is_empty() {
        k as f64
    } else {
        let total: usize = shared
            .iter()
            .map(|id| {
                let b = baseline.iter().position(|x| &x == id).unwrap_or(0);
                let c = current.iter().position(|x| &x == id).unwrap_or(0);
                b.abs_diff(c)
            })
            .sum();
        total as f64 / shared.len() as f64
    };

    let exact_order = baseline == current;
    (overlap, avg_shift, exact_order)
}

/// Load the persisted golden queries.
pub fn golden_queries(store: &Store) -> Result<Vec<GoldenQuery>> {
    let raw = store
        .setting("retrieval_regression.golden_queries")?
        .unwrap_or_else(|| "[]".to_string());
    let queries: Vec<GoldenQuery> = serde_json::from_str(&raw)
        .map_err(|e| Error::InvalidInput(format!("golden queries malformed: {}", e)))?;
    Ok(queries)
}

/// Persist a golden query set.
pub fn set_golden_queries(store: &Store, queries: &[GoldenQuery]) -> Result<()> {
    store.set_setting(
        "retrieval_regression.golden_queries",
        &serde_json::to_string(queries)?,
    )
}

/// Execute every golden query and compare against baselines.
pub fn run_regression(store: &Store, options: &RegressionOptions) -> Result<RegressionReport> {
    let queries = match &options.queries {
        Some(queries) => queries.clone(),
        None => golden_queries(store)?,
    };
    let limit = options
        .limit
        .unwrap_or_else(|| store.setting_i64("retrieval_regression.limit", 10).max(1) as usize);
    let min_overlap = store.setting_f64("retrieval_regression.min_overlap", 0.5);
    let max_avg_shift = store.setting_f64("retrieval_regression.max_avg_shift", 3.0);

    let run_id = Ulid::new().to_string();
    let mut report = RegressionReport {
        run_id: run_id.clone(),
        ..Default::default()
    };

    for golden in &queries {
        let key = golden.key();
        let search = golden.to_search(limit);
        let current_ids: Vec<String> = store
            .search(&search)?
            .into_iter()
            .map(|r| r.memory.id)
            .collect();

        let baseline: Option<Vec<String>> = store.with_reader(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT result_ids FROM regression_baselines WHERE query_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
        })?;

        let result = match baseline {
            None => {
                // First run initializes the baseline; perfect by construction.
                store.with_writer(|conn| {
                    conn.execute(
                        "INSERT INTO regression_baselines (query_key, query, config, result_ids, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(query_key) DO UPDATE SET
                             result_ids = excluded.result_ids, updated_at = excluded.updated_at",
                        params![
                            key,
                            golden.query_text(),
                            serde_json::to_string(golden)?,
                            serde_json::to_string(&current_ids)?,
                            now_str()
                        ],
                    )?;
                    Ok(())
                })?;
                QueryRegression {
                    query: golden.query_text().to_string(),
                    query_key: key.clone(),
                    baseline_ids: current_ids.clone(),
                    current_ids: current_ids.clone(),
                    overlap: 1.0,
                    avg_rank_shift: 0.0,
                    exact_order: true,
                    alert: false,
                    initialized: true,
                }
            }
            Some(baseline_ids) => {
                let (overlap, avg_rank_shift, exact_order) =
                    drift_metrics(&baseline_ids, &current_ids, limit);
                let alert = overlap < min_overlap || avg_rank_shift > max_avg_shift;
                QueryRegression {
                    query: golden.query_text().to_string(),
                    query_key: key.clone(),
                    baseline_ids,
                    current_ids: current_ids.clone(),
                    overlap,
                    avg_rank_shift,
                    exact_order,
                    alert,
                    initialized: false,
                }
            }
        };

        store.with_writer(|conn| {
            conn.execute(
                "INSERT INTO regression_runs (run_id, query_key, query, current_ids, overlap,
                                              avg_rank_shift, exact_order, alert, initialized, ran_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    result.query_key,
                    result.query,
                    serde_json::to_string(&result.current_ids)?,
                    result.overlap,
                    result.avg_rank_shift,
                    result.exact_order as i64,
                    result.alert as i64,
                    result.initialized as i64,
                    now_str()
                ],
            )?;
            Ok(())
        })?;

        if result.alert {
            report.alerts += 1;
        }
        report.results.push(result);
    }

    if options.update_baselines {
        update_baselines(store, None)?;
    }

    // Both the run option and the setting must be truthy to emit.
    let setting_allows = store.setting_bool("retrieval_regression.create_alert_memory", true);
    if report.alerts > 0 && options.create_alert_memory && setting_allows {
        report.alert_memory_id = Some(emit_alert_memory(store, &report)?);
    }

    Ok(report)
}

/// Replace baselines with the latest run's current ids. Scoped to specific
/// query keys when given.
pub fn update_baselines(store: &Store, query_keys: Option<&[String]>) -> Result<usize> {
    store.with_writer_tx(|conn| {
        let mut stmt = conn.prepare(
            "SELECT query_key, current_ids FROM regression_runs
             WHERE id IN (SELECT MAX(id) FROM regression_runs GROUP BY query_key)",
        )?;
        let latest = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut updated = 0usize;
        for (key, current_ids) in latest {
            if let Some(keys) = query_keys {
                if !keys.contains(&key) {
                    continue;
                }
            }
            updated += conn.execute(
                "UPDATE regression_baselines SET result_ids = ?1, updated_at = ?2
                 WHERE query_key = ?3",
                params![current_ids, now_str(), key],
            )?;
        }
        Ok(updated)
    })
}

/// Promote a named run's current ids to baselines.
pub fn promote_from_run(store: &Store, run_id: &str) -> Result<usize> {
    store.with_writer_tx(|conn| {
        let mut stmt = conn.prepare(
            "SELECT query_key, current_ids FROM regression_runs WHERE run_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Err(Error::NotFound(format!("regression run {}", run_id)));
        }

        let mut promoted = 0usize;
        for (key, current_ids) in rows {
            promoted += conn.execute(
                "UPDATE regression_baselines SET result_ids = ?1, updated_at = ?2
                 WHERE query_key = ?3",
                params![current_ids, now_str(), key],
            )?;
        }
        Ok(promoted)
    })
}

/// Delete baselines, optionally scoped to query keys.
pub fn reset_baselines(store: &Store, query_keys: Option<&[String]>) -> Result<usize> {
    store.with_writer(|conn| {
        let deleted = match query_keys {
            Some(keys) if !keys.is_empty() => {
                let placeholders = vec!["?"; keys.len()].join(", ");
                let sql = format!(
                    "DELETE FROM regression_baselines WHERE query_key IN ({})",
                    placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.execute(rusqlite::params_from_iter(keys.iter()))?
            }
            _ => conn.execute("DELETE FROM regression_baselines", [])?,
        };
        Ok(deleted)
    })
}

/// Emit a benchmark-tagged summary memory describing the breaches.
fn emit_alert_memory(store: &Store, report: &RegressionReport) -> Result<String> {
    let mut lines = vec![format!(
        "Retrieval regression run {} detected {} alert(s):",
        report.run_id, report.alerts
    )];
    for result in report.results.iter().filter(|r| r.alert) {
        lines.push(format!(
            "- '{}': overlap {:.2}, avg rank shift {:.2}",
            result.query, result.overlap, result.avg_rank_shift
        ));
    }

    let created = store.create_memory(CreateMemoryInput {
        content: lines.join("\n"),
        content_type: ContentType::Summary,
        benchmark: true,
        tags: vec!["retrieval-regression".to_string()],
        metadata: Some(serde_json::json!({ "run_id": report.run_id })),
        ..Default::default()
    })?;
    Ok(created.memory.id)
}

// ============================================================================
// TESTS
// ============================================================================
