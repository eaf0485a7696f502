//! Typed key-value settings.
//!
//! Every tunable in the engine is a string row in the `settings` table,
//! parsed on read. Values are never cached across mutations: snapshot
//! structs like [`ScoringSettings`] load once per operation.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::Store;

/// Default settings inserted with insert-if-absent semantics at bootstrap.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("scoring.vector_weight", "0.45"),
    ("scoring.fts_weight", "0.25"),
    ("scoring.recency_weight", "0.20"),
    ("scoring.frequency_weight", "0.10"),
    ("scoring.recency_decay", "0.05"),
    ("scoring.graph_weight", "0.10"),
    ("scoring.usefulness_weight", "0.05"),
    ("scoring.tag_boost", "0.10"),
    ("scoring.use_rrf", "true"),
    ("scoring.rrf_k", "60"),
    ("scoring.min_score", "0.15"),
    ("scoring.rrf_min_score", "0.001"),
    ("dedup.enabled", "true"),
    ("dedup.similarity_threshold", "0.85"),
    ("dedup.candidate_pool", "200"),
    ("dedup.hash_enabled", "true"),
    ("dedup.skip_insert_on_match", "true"),
    ("chunking.enabled", "true"),
    ("chunking.max_length", "1500"),
    ("chunking.target_size", "500"),
    ("importance.auto_adjust", "true"),
    ("importance.boost_threshold", "5"),
    ("importance.decay_age_days", "30"),
    ("trash.auto_purge_days", "30"),
    ("search.query_expansion", "false"),
    ("search.metadata_mode", "exclude"),
    ("search.metadata_tags", ""),
    ("retrieval_regression.golden_queries", "[]"),
    ("retrieval_regression.limit", "10"),
    ("retrieval_regression.min_overlap", "0.5"),
    ("retrieval_regression.max_avg_shift", "3"),
    ("retrieval_regression.create_alert_memory", "true"),
    ("retrieval_regression.schedule", "06:00"),
    ("backup.max_count", "7"),
    ("backup.copy_to", ""),
    ("embedding.model", ""),
    ("embedding.dimensions", "0"),
];

/// Insert all defaults that are not yet present.
pub fn insert_defaults(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)")?;
    for (key, value) in DEFAULT_SETTINGS {
        stmt.execute(params![key, value])?;
    }
    Ok(())
}

pub(crate) fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn get_f64(conn: &Connection, key: &str, default: f64) -> f64 {
    get(conn, key)
        .ok()
        .flatten()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

pub(crate) fn get_i64(conn: &Connection, key: &str, default: i64) -> i64 {
    get(conn, key)
        .ok()
        .flatten()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

pub(crate) fn get_bool(conn: &Connection, key: &str, default: bool) -> bool {
    match get(conn, key).ok().flatten() {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        None => default,
    }
}

impl Store {
    /// Read a setting value verbatim.
    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        self.with_reader(|conn| get(conn, key))
    }

    /// Write a setting value (upsert).
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// All settings as a map.
    pub fn all_settings(&self) -> Result<HashMap<String, String>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let map = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<HashMap<String, String>, _>>()?;
            Ok(map)
        })
    }

    /// Typed convenience readers; fall back to the compiled default on parse
    /// failure.
    pub fn setting_f64(&self, key: &str, default: f64) -> f64 {
        self.with_reader(|conn| Ok(get_f64(conn, key, default)))
            .unwrap_or(default)
    }

    pub fn setting_i64(&self, key: &str, default: i64) -> i64 {
        self.with_reader(|conn| Ok(get_i64(conn, key, default)))
            .unwrap_or(default)
    }

    pub fn setting_bool(&self, key: &str, default: bool) -> bool {
        self.with_reader(|conn| Ok(get_bool(conn, key, default)))
            .unwrap_or(default)
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// One-shot snapshot of the ranking configuration, parsed per query.
#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub vector_weight: f64,
    pub fts_weight: f64,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub recency_decay: f64,
    pub graph_weight: f64,
    pub usefulness_weight: f64,
    pub tag_boost: f64,
    pub use_rrf: bool,
    pub rrf_k: f64,
    pub min_score: f64,
    pub rrf_min_score: f64,
    pub query_expansion: bool,
    pub metadata_mode: String,
    pub metadata_tags: Vec<String>,
}

impl ScoringSettings {
    pub fn load(conn: &Connection) -> Self {
        let metadata_tags = get(conn, "search.metadata_tags")
            .ok()
            .flatten()
            .unwrap_or_default()
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        Self {
            vector_weight: get_f64(conn, "scoring.vector_weight", 0.45),
            fts_weight: get_f64(conn, "scoring.fts_weight", 0.25),
            recency_weight: get_f64(conn, "scoring.recency_weight", 0.20),
            frequency_weight: get_f64(conn, "scoring.frequency_weight", 0.10),
            recency_decay: get_f64(conn, "scoring.recency_decay", 0.05),
            graph_weight: get_f64(conn, "scoring.graph_weight", 0.10),
            usefulness_weight: get_f64(conn, "scoring.usefulness_weight", 0.05),
            tag_boost: get_f64(conn, "scoring.tag_boost", 0.10),
            use_rrf: get_bool(conn, "scoring.use_rrf", true),
            rrf_k: get_f64(conn, "scoring.rrf_k", 60.0),
            min_score: get_f64(conn, "scoring.min_score", 0.15),
            rrf_min_score: get_f64(conn, "scoring.rrf_min_score", 0.001),
            query_expansion: get_bool(conn, "search.query_expansion", false),
            metadata_mode: get(conn, "search.metadata_mode")
                .ok()
                .flatten()
                .unwrap_or_else(|| "exclude".to_string()),
            metadata_tags,
        }
    }
}

/// Snapshot of the write-path dedup and chunking configuration.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub dedup_enabled: bool,
    pub dedup_threshold: f64,
    pub dedup_candidate_pool: i64,
    pub hash_dedup_enabled: bool,
    pub skip_insert_on_match: bool,
    pub chunking_enabled: bool,
    pub chunking_max_length: usize,
    pub chunking_target_size: usize,
}

impl IngestSettings {
    pub fn load(conn: &Connection) -> Self {
        Self {
            dedup_enabled: get_bool(conn, "dedup.enabled", true),
            dedup_threshold: get_f64(conn, "dedup.similarity_threshold", 0.85),
            dedup_candidate_pool: get_i64(conn, "dedup.candidate_pool", 200),
            hash_dedup_enabled: get_bool(conn, "dedup.hash_enabled", true),
            skip_insert_on_match: get_bool(conn, "dedup.skip_insert_on_match", true),
            chunking_enabled: get_bool(conn, "chunking.enabled", true),
            chunking_max_length: get_i64(conn, "chunking.max_length", 1500).max(0) as usize,
            chunking_target_size: get_i64(conn, "chunking.target_size", 500).max(100) as usize,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    #[test]
    fn test_defaults_present_after_bootstrap() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            store.setting("scoring.vector_weight").unwrap().as_deref(),
            Some("0.45")
        );
        assert_eq!(
            store.setting("trash.auto_purge_days").unwrap().as_deref(),
            Some("30")
        );
        assert!(store.setting("no.such.key").unwrap().is_none());
    }

    #[test]
    fn test_read_returns_last_write() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("scoring.rrf_k", "90").unwrap();
        assert_eq!(store.setting("scoring.rrf_k").unwrap().as_deref(), Some("90"));
        store.set_setting("scoring.rrf_k", "45").unwrap();
        assert_eq!(store.setting("scoring.rrf_k").unwrap().as_deref(), Some("45"));
        assert_eq!(store.setting_f64("scoring.rrf_k", 60.0), 45.0);
    }

    #[test]
    fn test_typed_parse_falls_back_on_garbage() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("scoring.min_score", "not-a-number").unwrap();
        assert_eq!(store.setting_f64("scoring.min_score", 0.15), 0.15);

        store.set_setting("dedup.enabled", "off").unwrap();
        assert!(!store.setting_bool("dedup.enabled", true));
        store.set_setting("dedup.enabled", "yes").unwrap();
        assert!(store.setting_bool("dedup.enabled", false));
    }

    #[test]
    fn test_all_settings_contains_defaults() {
        let store = Store::open_in_memory().unwrap();
        let all = store.all_settings().unwrap();
        assert!(all.len() >= super::DEFAULT_SETTINGS.len());
        assert_eq!(all.get("scoring.use_rrf").map(String::as_str), Some("true"));
    }
}
