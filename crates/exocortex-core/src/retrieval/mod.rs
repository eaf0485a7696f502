//! Hybrid retrieval pipeline.
//!
//! Candidate assembly unions the lexical matches with a recent-creation
//! window, so older keyword-only memories still compete. Per-candidate
//! component scores (vector, lexical, recency, frequency, usefulness, graph
//! proximity) are fused with weighted Reciprocal Rank Fusion, boosted,
//! thresholded, and paged. Every stage degrades rather than failing: a dead
//! provider zeroes the vector signal, a lexical error falls back to the
//! recent window, and with no signal at all results rank by recency.

pub mod expansion;

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::Connection;

use crate::error::Result;
use crate::extract::query_fingerprint;
use crate::scoring::{self, RankedList};
use crate::storage::{now_str, ScoringSettings, Store};
use crate::types::{Memory, ScoreBreakdown, SearchQuery, SearchResult};

/// Cap on the lexical arm of the candidate pool.
const LEXICAL_POOL_LIMIT: usize = 200;

/// Seeds taken into graph-proximity expansion.
const GRAPH_SEED_COUNT: usize = 20;

/// Ids recorded per co-retrieval event.
const CO_RETRIEVAL_TOP: usize = 10;

/// Content length returned in compact mode.
const COMPACT_CONTENT_LEN: usize = 200;

struct Candidate {
    memory: Memory,
    order: usize,
    fts: f64,
    vector: f64,
    recency: f64,
    frequency: f64,
    usefulness: f64,
    graph: f64,
}

/// Strip FTS meta-characters, wrap each term as a phrase, join with OR.
pub fn sanitize_fts_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .map(|term| format!("\"{}\"", term))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Lowercased query words of length >= 3, used for tag boost and graph
/// seeding.
fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_string())
        .collect()
}

impl Store {
    /// Execute a ranked hybrid search.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let cfg = self.with_reader(|conn| Ok(ScoringSettings::load(conn)))?;

        let mut fts_query = sanitize_fts_query(&query.query);
        let mut embed_source = query.query.clone();

        if cfg.query_expansion {
            match expansion::expand_query(self, &query.query) {
                Ok(Some(expanded)) => {
                    if !expanded.extra_terms.is_empty() {
                        let extras: Vec<String> = expanded
                            .extra_terms
                            .iter()
                            .map(|t| format!("\"{}\"", t.replace('"', "")))
                            .collect();
                        if fts_query.is_empty() {
                            fts_query = extras.join(" OR ");
                        } else {
                            fts_query = format!("{} OR {}", fts_query, extras.join(" OR "));
                        }
                        embed_source =
                            format!("{} {}", embed_source, expanded.extra_terms.join(" "));
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("query expansion skipped: {}", e),
            }
        }

        // Query embedding, LRU-cached. A dead provider zeroes the vector arm.
        let query_vec = self.query_embedding(&embed_source);

        let terms = query_terms(&query.query);
        let pool_cap = (10 * (query.offset + query.limit)).clamp(100, 1000);

        let (mut candidates, lexical_unavailable) = self.with_reader(|conn| {
            collect_candidates(conn, query, &cfg, &fts_query, pool_cap)
        })?;

        // Component scores.
        let now = Utc::now();
        let freq_max = self.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(access_count), 0) FROM memories WHERE is_active = 1",
                [],
                |row| row.get::<_, i64>(0),
            )?)
        })?;

        for candidate in candidates.iter_mut() {
            if let (Some(qv), Some(mv)) = (query_vec.as_ref(), candidate.memory.embedding.as_ref())
            {
                candidate.vector = (scoring::cosine(qv, mv) as f64).max(0.0);
            }
            candidate.recency = scoring::recency(
                candidate.memory.created_at,
                cfg.recency_decay,
                Some(candidate.memory.importance),
                now,
            );
            candidate.frequency = scoring::frequency(candidate.memory.access_count, freq_max);
            candidate.usefulness = scoring::usefulness(candidate.memory.useful_count);
        }

        // Graph proximity over the strongest vector+lexical seeds.
        if cfg.graph_weight > 0.0 {
            let graph_scores = self.with_reader(|conn| {
                graph_proximity(conn, &candidates, &terms)
            })?;
            for candidate in candidates.iter_mut() {
                if let Some(score) = graph_scores.get(&candidate.memory.id) {
                    candidate.graph = *score;
                }
            }
        }

        // With neither a vector nor a lexical arm the pipeline has no signal
        // left; degrade to rank-by-recency instead of failing.
        let recency_fallback = query_vec.is_none() && lexical_unavailable;
        let scored = fuse(&candidates, &cfg, &terms, query.min_score, recency_fallback);

        let mut admitted: Vec<(usize, f64)> = scored
            .iter()
            .filter(|s| s.admitted)
            .map(|s| (s.order, s.score))
            .collect();
        admitted.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let page: Vec<(usize, f64)> = admitted
            .iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();

        let mut results = Vec::with_capacity(page.len());
        for (order, score) in &page {
            let candidate = candidates.iter().find(|c| c.order == *order).expect("order");
            let mut memory = candidate.memory.clone();
            if query.compact {
                memory.content = truncate_chars(&memory.content, COMPACT_CONTENT_LEN);
            }
            results.push(SearchResult {
                memory,
                score: *score,
                components: ScoreBreakdown {
                    vector: candidate.vector,
                    fts: candidate.fts,
                    recency: candidate.recency,
                    frequency: candidate.frequency,
                    usefulness: candidate.usefulness,
                    graph: candidate.graph,
                },
            });
        }

        let best_unthresholded = scored
            .iter()
            .map(|s| s.raw)
            .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a| a.max(s))));

        // Side effects: at-most-once, never fatal.
        self.log_search_side_effects(query, &results, best_unthresholded);

        Ok(results)
    }

    fn query_embedding(&self, text: &str) -> Option<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(text) {
                return Some(hit.clone());
            }
        }
        match self.embed_text(text) {
            Ok(vec) => {
                let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.put(text.to_string(), vec.clone());
                Some(vec)
            }
            Err(e) => {
                tracing::debug!("query embedding unavailable: {}", e);
                None
            }
        }
    }

    fn log_search_side_effects(
        &self,
        query: &SearchQuery,
        results: &[SearchResult],
        best_unthresholded: Option<f64>,
    ) {
        for result in results {
            if let Err(e) = self.record_access(&result.memory.id, Some(&query.query)) {
                tracing::warn!("access log failed for {}: {}", result.memory.id, e);
            }
        }

        if results.len() >= 2 {
            let ids: Vec<&str> = results
                .iter()
                .take(CO_RETRIEVAL_TOP)
                .map(|r| r.memory.id.as_str())
                .collect();
            let outcome = self.with_writer(|conn| {
                conn.execute(
                    "INSERT INTO co_retrievals (query_hash, memory_ids, retrieved_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![
                        query_fingerprint(&query.query),
                        serde_json::to_string(&ids)?,
                        now_str()
                    ],
                )?;
                Ok(())
            });
            if let Err(e) = outcome {
                tracing::warn!("co-retrieval log failed: {}", e);
            }
        } else if results.is_empty() {
            let best = best_unthresholded;
            let filters = serde_json::json!({
                "contentType": query.content_type.map(|c| c.as_str()),
                "source": query.source.map(|s| s.as_str()),
                "tags": query.tags,
                "minImportance": query.min_importance,
            });
            let outcome = self.with_writer(|conn| {
                conn.execute(
                    "INSERT INTO search_misses (query, filters, best_score, occurred_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        query.query,
                        serde_json::to_string(&filters)?,
                        best,
                        now_str()
                    ],
                )?;
                Ok(())
            });
            if let Err(e) = outcome {
                tracing::warn!("search-miss log failed: {}", e);
            }
        }
    }
}

/// Assemble the candidate pool: lexical matches unioned with the most recent
/// creations, both passing the query filters. The boolean is true when the
/// lexical arm produced no usable signal (empty sanitized query or an FTS
/// error).
fn collect_candidates(
    conn: &Connection,
    query: &SearchQuery,
    cfg: &ScoringSettings,
    fts_query: &str,
    pool_cap: usize,
) -> Result<(Vec<Candidate>, bool)> {
    let (filter_sql, filter_values) = build_filters(conn, query, cfg)?;

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut lexical_unavailable = fts_query.is_empty();

    // Lexical pass first. Rank normalization: best hit scores 1, the rest
    // fall off linearly with position.
    if !fts_query.is_empty() {
        let sql = format!(
            "SELECT m.* FROM memories_fts
             JOIN memories m ON m.id = memories_fts.id
             WHERE memories_fts MATCH ?1 {filters}
             ORDER BY memories_fts.rank LIMIT {limit}",
            filters = filter_sql,
            limit = LEXICAL_POOL_LIMIT
        );
        let lexical: std::result::Result<Vec<Memory>, _> = (|| {
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<rusqlite::types::Value> =
                vec![rusqlite::types::Value::from(fts_query.to_string())];
            values.extend(filter_values.iter().cloned());
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values), Store::row_to_memory)?
                .collect();
            rows
        })();

        match lexical {
            Ok(rows) => {
                let total = rows.len().max(1);
                for (position, mut memory) in rows.into_iter().enumerate() {
                    memory.tags = Store::load_tags(conn, &memory.id)?;
                    let fts = (total - position) as f64 / total as f64;
                    let order = candidates.len();
                    seen.insert(memory.id.clone(), order);
                    candidates.push(Candidate {
                        memory,
                        order,
                        fts,
                        vector: 0.0,
                        recency: 0.0,
                        frequency: 0.0,
                        usefulness: 0.0,
                        graph: 0.0,
                    });
                }
            }
            Err(e) => {
                // Sanitization failure or FTS syntax problem: continue on
                // vector + recency alone.
                tracing::warn!("lexical pass failed, degrading: {}", e);
                lexical_unavailable = true;
            }
        }
    }

    // Recent-creation window, capped so the pool stays bounded.
    let sql = format!(
        "SELECT m.* FROM memories m
         WHERE 1 = 1 {filters}
         ORDER BY m.created_at DESC LIMIT {limit}",
        filters = filter_sql,
        limit = pool_cap
    );
    let mut stmt = conn.prepare(&sql)?;
    let recent = stmt
        .query_map(
            rusqlite::params_from_iter(filter_values.iter().cloned()),
            Store::row_to_memory,
        )?
        .collect::<std::result::Result<Vec<Memory>, _>>()?;

    for mut memory in recent {
        if candidates.len() >= pool_cap {
            break;
        }
        if seen.contains_key(&memory.id) {
            continue;
        }
        memory.tags = Store::load_tags(conn, &memory.id)?;
        let order = candidates.len();
        seen.insert(memory.id.clone(), order);
        candidates.push(Candidate {
            memory,
            order,
            fts: 0.0,
            vector: 0.0,
            recency: 0.0,
            frequency: 0.0,
            usefulness: 0.0,
            graph: 0.0,
        });
    }

    Ok((candidates, lexical_unavailable))
}

/// Base filter predicates shared by both candidate arms. `is_active = 1`
/// always; metadata gating by setting unless the caller opts in.
fn build_filters(
    conn: &Connection,
    query: &SearchQuery,
    cfg: &ScoringSettings,
) -> Result<(String, Vec<rusqlite::types::Value>)> {
    let mut sql = String::from(" AND m.is_active = 1");
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    let include_metadata = query.include_metadata || cfg.metadata_mode == "include";
    if !include_metadata {
        if cfg.metadata_mode == "tags" && !cfg.metadata_tags.is_empty() {
            let placeholders = vec!["?"; cfg.metadata_tags.len()].join(", ");
            sql.push_str(&format!(
                " AND (m.is_metadata = 0 OR EXISTS (
                     SELECT 1 FROM memory_tags mt
                     WHERE mt.memory_id = m.id AND mt.tag IN ({})))",
                placeholders
            ));
            for tag in &cfg.metadata_tags {
                values.push(rusqlite::types::Value::from(tag.clone()));
            }
        } else {
            sql.push_str(" AND m.is_metadata = 0");
        }
    }

    if let Some(content_type) = query.content_type {
        sql.push_str(" AND m.content_type = ?");
        values.push(rusqlite::types::Value::from(
            content_type.as_str().to_string(),
        ));
    }
    if let Some(source) = query.source {
        sql.push_str(" AND m.source = ?");
        values.push(rusqlite::types::Value::from(source.as_str().to_string()));
    }
    if let Some(after) = query.after {
        sql.push_str(" AND m.created_at >= ?");
        values.push(rusqlite::types::Value::from(crate::storage::timestamp(after)));
    }
    if let Some(before) = query.before {
        sql.push_str(" AND m.created_at <= ?");
        values.push(rusqlite::types::Value::from(crate::storage::timestamp(
            before,
        )));
    }
    if let Some(min_importance) = query.min_importance {
        sql.push_str(" AND m.importance >= ?");
        values.push(rusqlite::types::Value::from(min_importance));
    }

    if !query.tags.is_empty() {
        let tags = Store::normalize_tags(conn, &query.tags)?;
        if !tags.is_empty() {
            let placeholders = vec!["?"; tags.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM memory_tags qt
                              WHERE qt.memory_id = m.id AND qt.tag IN ({}))",
                placeholders
            ));
            for tag in tags {
                values.push(rusqlite::types::Value::from(tag));
            }
        }
    }

    Ok((sql, values))
}

/// Graph proximity signal. Entities matching query words light up their
/// directly linked memories at 1.0 and 2-hop memories at 0.5; memory links
/// from the fusion seeds contribute `0.3 + 0.5 * strength`. Signals
/// max-aggregate.
fn graph_proximity(
    conn: &Connection,
    candidates: &[Candidate],
    terms: &[String],
) -> Result<HashMap<String, f64>> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let candidate_ids: std::collections::HashSet<&str> =
        candidates.iter().map(|c| c.memory.id.as_str()).collect();

    // (a) Entity matches from query words.
    for term in terms {
        let entity_ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM entities
                 WHERE name = ?1 COLLATE NOCASE
                    OR LOWER(aliases) LIKE '%\"' || LOWER(?1) || '\"%'",
            )?;
            let rows = stmt
                .query_map([term], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };

        for entity_id in entity_ids {
            let direct: Vec<String> = {
                let mut stmt = conn
                    .prepare("SELECT memory_id FROM memory_entities WHERE entity_id = ?1")?;
                let rows = stmt
                    .query_map([&entity_id], |row| row.get(0))?
                    .collect::<std::result::Result<_, _>>()?;
                rows
            };
            for id in direct {
                if candidate_ids.contains(id.as_str()) {
                    let entry = scores.entry(id).or_insert(0.0);
                    *entry = entry.max(1.0);
                }
            }

            // 2-hop through the entity graph; never deeper.
            let related: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT CASE WHEN source_id = ?1 THEN target_id ELSE source_id END
                     FROM entity_relationships
                     WHERE source_id = ?1 OR target_id = ?1
                     LIMIT 10",
                )?;
                let rows = stmt
                    .query_map([&entity_id], |row| row.get(0))?
                    .collect::<std::result::Result<_, _>>()?;
                rows
            };
            for related_id in related {
                let hop2: Vec<String> = {
                    let mut stmt = conn
                        .prepare("SELECT memory_id FROM memory_entities WHERE entity_id = ?1")?;
                    let rows = stmt
                        .query_map([&related_id], |row| row.get(0))?
                        .collect::<std::result::Result<_, _>>()?;
                    rows
                };
                for id in hop2 {
                    if candidate_ids.contains(id.as_str()) {
                        let entry = scores.entry(id).or_insert(0.0);
                        *entry = entry.max(0.5);
                    }
                }
            }
        }
    }

    // (b) Memory links from the strongest vector+lexical seeds.
    let mut by_signal: Vec<&Candidate> = candidates.iter().collect();
    by_signal.sort_by(|a, b| {
        (b.vector + b.fts)
            .partial_cmp(&(a.vector + a.fts))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let seeds: Vec<&str> = by_signal
        .iter()
        .take(GRAPH_SEED_COUNT)
        .map(|c| c.memory.id.as_str())
        .collect();

    if !seeds.is_empty() {
        let placeholders = vec!["?"; seeds.len()].join(", ");
        let sql = format!(
            "SELECT source_id, target_id, strength FROM memory_links
             WHERE source_id IN ({ph}) OR target_id IN ({ph})",
            ph = placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for id in &seeds {
            values.push(rusqlite::types::Value::from(id.to_string()));
        }
        for id in &seeds {
            values.push(rusqlite::types::Value::from(id.to_string()));
        }

        let links = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (source, target, strength) in links {
            for neighbor in [source, target] {
                if seeds.contains(&neighbor.as_str()) {
                    continue;
                }
                if candidate_ids.contains(neighbor.as_str()) {
                    let score = 0.3 + 0.5 * strength;
                    let entry = scores.entry(neighbor).or_insert(0.0);
                    *entry = entry.max(score);
                }
            }
        }
    }

    Ok(scores)
}

struct FusedScore {
    order: usize,
    score: f64,
    /// Score before the admission threshold; feeds search-miss logging.
    raw: f64,
    admitted: bool,
}

/// Fuse component scores into final scores plus admission decisions.
fn fuse(
    candidates: &[Candidate],
    cfg: &ScoringSettings,
    terms: &[String],
    min_score_override: Option<f64>,
    recency_fallback: bool,
) -> Vec<FusedScore> {
    if candidates.is_empty() {
        return Vec::new();
    }

    if recency_fallback {
        return candidates
            .iter()
            .map(|c| FusedScore {
                order: c.order,
                score: c.recency,
                raw: c.recency,
                admitted: true,
            })
            .collect();
    }

    let tag_matches = |c: &Candidate| -> bool {
        terms
            .iter()
            .any(|term| c.memory.tags.iter().any(|tag| tag.contains(term.as_str())))
    };

    if cfg.use_rrf {
        let ranked = |key: fn(&Candidate) -> f64, weight: f64| -> RankedList {
            let mut nonzero: Vec<&Candidate> =
                candidates.iter().filter(|c| key(c) > 0.0).collect();
            nonzero.sort_by(|a, b| {
                key(b).partial_cmp(&key(a)).unwrap_or(std::cmp::Ordering::Equal)
            });
            RankedList::new(weight, nonzero.iter().map(|c| c.memory.id.clone()).collect())
        };

        let lists = vec![
            ranked(|c| c.vector, cfg.vector_weight),
            ranked(|c| c.fts, cfg.fts_weight),
            ranked(|c| c.graph, cfg.graph_weight),
        ];
        let rrf = scoring::reciprocal_rank_fusion(&lists, cfg.rrf_k);
        let max_rrf = rrf.values().cloned().fold(0.0_f64, f64::max);

        let threshold = min_score_override.unwrap_or(cfg.rrf_min_score);
        candidates
            .iter()
            .map(|candidate| {
                let base = rrf.get(&candidate.memory.id).copied().unwrap_or(0.0);
                let boost = 1.0
                    + cfg.recency_weight * candidate.recency
                    + cfg.frequency_weight * candidate.frequency
                    + cfg.usefulness_weight * candidate.usefulness;
                let mut score = base * boost;
                if tag_matches(candidate) {
                    score += cfg.tag_boost * max_rrf;
                }
                FusedScore {
                    order: candidate.order,
                    score,
                    raw: score,
                    admitted: score >= threshold,
                }
            })
            .collect()
    } else {
        // Legacy weighted sum with additive usefulness.
        let threshold = min_score_override.unwrap_or(cfg.min_score);
        candidates
            .iter()
            .map(|candidate| {
                let mut score = cfg.vector_weight * candidate.vector
                    + cfg.fts_weight * candidate.fts
                    + cfg.recency_weight * candidate.recency
                    + cfg.frequency_weight * candidate.frequency
                    + cfg.usefulness_weight * candidate.usefulness;
                if tag_matches(candidate) {
                    score += cfg.tag_boost;
                }
                FusedScore {
                    order: candidate.order,
                    score,
                    raw: score,
                    admitted: score >= threshold,
                }
            })
            .collect()
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingProvider;
    use crate::types::{ContentType, CreateMemoryInput};
    use std::sync::Arc;

    fn store_with_provider() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.set_embedding_provider(Arc::new(HashingProvider::new(128)));
        store
    }

    fn create(store: &Store, content: &str, tags: &[&str]) -> String {
        store
            .create_memory(CreateMemoryInput {
                content: content.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            })
            .unwrap()
            .memory
            .id
    }

    #[test]
    fn test_sanitize_strips_meta_characters() {
        assert_eq!(
            sanitize_fts_query("database AND (evil:query)*"),
            "\"database\" OR \"AND\" OR \"evil\" OR \"query\""
        );
        assert_eq!(sanitize_fts_query("   "), "");
    }

    #[test]
    fn test_search_finds_lexical_match() {
        let store = store_with_provider();
        let id = create(&store, "The staging cluster runs PostgreSQL fifteen", &[]);
        create(&store, "Bought a new espresso grinder", &[]);

        let results = store
            .search(&SearchQuery::new("postgresql staging"))
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].memory.id, id);
        assert!(results[0].score > 0.0);
        assert!(results[0].components.fts > 0.0);
    }

    #[test]
    fn test_search_records_access_and_co_retrieval() {
        let store = store_with_provider();
        create(&store, "Alpha topic memory about espresso machines", &[]);
        create(&store, "Second espresso memory for the co-retrieval log", &[]);

        let results = store.search(&SearchQuery::new("espresso")).unwrap();
        assert!(results.len() >= 2);

        for result in &results {
            let m = store.get_by_id(&result.memory.id).unwrap().unwrap();
            assert_eq!(m.access_count, 1);
        }

        let co: i64 = store
            .with_reader(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM co_retrievals", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(co, 1);
    }

    #[test]
    fn test_empty_result_logs_miss() {
        let store = store_with_provider();
        create(&store, "Completely unrelated content", &[]);

        let results = store
            .search(&SearchQuery {
                query: "xylophone zeppelin quux".to_string(),
                min_score: Some(0.99),
                ..Default::default()
            })
            .unwrap();
        assert!(results.is_empty());

        let misses: i64 = store
            .with_reader(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM search_misses", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(misses, 1);
    }

    #[test]
    fn test_metadata_memories_hidden_by_default() {
        let store = store_with_provider();
        store
            .create_memory(CreateMemoryInput {
                content: "system artifact about volcanoes".to_string(),
                is_metadata: true,
                ..Default::default()
            })
            .unwrap();
        create(&store, "A real memory about volcanoes erupting", &[]);

        let results = store.search(&SearchQuery::new("volcanoes")).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].memory.is_metadata);

        let with_meta = store
            .search(&SearchQuery {
                query: "volcanoes".to_string(),
                include_metadata: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(with_meta.len(), 2);
    }

    #[test]
    fn test_benchmark_artifacts_invisible_even_when_requested_by_content() {
        // Benchmark rows are unindexed and unembedded, so content search
        // cannot surface them even with includeMetadata.
        let store = store_with_provider();
        store
            .create_memory(CreateMemoryInput {
                content: "benchmark probe phrase zebrawood".to_string(),
                benchmark: true,
                ..Default::default()
            })
            .unwrap();
        create(&store, "ordinary note mentioning zebrawood veneer", &[]);

        let results = store
            .search(&SearchQuery {
                query: "zebrawood".to_string(),
                include_metadata: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].memory.is_metadata);
    }

    #[test]
    fn test_tag_filter_restricts_results() {
        let store = store_with_provider();
        create(&store, "Tagged memory about sailing knots", &["sailing"]);
        create(&store, "Untagged memory about sailing charts", &[]);

        let results = store
            .search(&SearchQuery {
                query: "sailing".to_string(),
                tags: vec!["sailing".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].memory.tags.contains(&"sailing".to_string()));
    }

    #[test]
    fn test_tag_boost_lifts_tagged_memory() {
        let store = store_with_provider();
        // Same content shape; only the tag differs.
        let tagged = create(&store, "Notes from the retro meeting one", &["kubernetes"]);
        let untagged = create(&store, "Notes from the retro meeting two", &[]);

        let results = store.search(&SearchQuery::new("kubernetes retro")).unwrap();
        let pos =
            |id: &str| results.iter().position(|r| r.memory.id == id).unwrap_or(usize::MAX);
        assert!(pos(&tagged) < pos(&untagged));
    }

    #[test]
    fn test_content_type_filter() {
        let store = store_with_provider();
        store
            .create_memory(CreateMemoryInput {
                content: "meeting summary about roadmap".to_string(),
                content_type: ContentType::Summary,
                ..Default::default()
            })
            .unwrap();
        create(&store, "meeting text about roadmap", &[]);

        let results = store
            .search(&SearchQuery {
                query: "roadmap meeting".to_string(),
                content_type: Some(ContentType::Summary),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content_type, ContentType::Summary);
    }

    #[test]
    fn test_search_without_provider_degrades_to_lexical() {
        let _guard = crate::embeddings::registry_test_lock();
        let store = Store::open_in_memory().unwrap(); // no provider at all
        let id = store
            .create_memory(CreateMemoryInput::new("lexical only memory about quasars"))
            .unwrap()
            .memory
            .id;

        let results = store.search(&SearchQuery::new("quasars")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, id);
        assert_eq!(results[0].components.vector, 0.0);
    }

    #[test]
    fn test_total_signal_loss_ranks_by_recency() {
        // No provider (vector arm dead) and a punctuation-only query (no
        // lexical arm): the pipeline degrades to rank-by-recency.
        let _guard = crate::embeddings::registry_test_lock();
        let store = Store::open_in_memory().unwrap();
        store
            .create_memory(CreateMemoryInput::new("older degraded-path memory"))
            .unwrap();
        store
            .create_memory(CreateMemoryInput::new("newer degraded-path memory"))
            .unwrap();

        let results = store.search(&SearchQuery::new("?!*")).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].memory.content.starts_with("newer"));
        assert!(results[0].components.recency >= results[1].components.recency);
    }

    #[test]
    fn test_unmatched_query_returns_empty_not_fallback() {
        let store = store_with_provider();
        store
            .create_memory(CreateMemoryInput::new("completely unrelated topic"))
            .unwrap();

        // Lexical and vector arms both ran and legitimately found nothing.
        let results = store.search(&SearchQuery::new("xylophone zeppelin")).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_offset_paging() {
        let store = store_with_provider();
        for i in 0..5 {
            create(&store, &format!("pagination fixture number {}", i), &[]);
        }

        let page1 = store
            .search(&SearchQuery {
                query: "pagination fixture".to_string(),
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        let page2 = store
            .search(&SearchQuery {
                query: "pagination fixture".to_string(),
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        for r in &page1 {
            assert!(!page2.iter().any(|r2| r2.memory.id == r.memory.id));
        }
    }

    #[test]
    fn test_compact_truncates_content() {
        let store = store_with_provider();
        let long = format!("compaction target {}", "x".repeat(500));
        create(&store, &long, &[]);

        let results = store
            .search(&SearchQuery {
                query: "compaction target".to_string(),
                compact: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results[0].memory.content.chars().count(), 200);
    }

    #[test]
    fn test_legacy_weighted_sum_mode() {
        let store = store_with_provider();
        store.set_setting("scoring.use_rrf", "false").unwrap();
        let id = create(&store, "legacy scoring memory about falconry", &[]);

        let results = store.search(&SearchQuery::new("falconry")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, id);
        // Weighted sum with a fresh memory: recency near 1 keeps it over the
        // 0.15 floor even without a strong lexical field.
        assert!(results[0].score >= 0.15);
    }

    #[test]
    fn test_graph_proximity_boosts_linked_candidate() {
        let store = store_with_provider();
        let seed = create(&store, "orchard planning for apple trees", &[]);
        let neighbor = create(&store, "soil preparation notes for the orchard", &[]);
        let _stranger = create(&store, "orchard shed paint colors", &[]);
        store
            .upsert_memory_link(&seed, &neighbor, crate::types::LinkType::Related, 0.8)
            .unwrap();

        let results = store.search(&SearchQuery::new("orchard apple")).unwrap();
        let neighbor_result = results.iter().find(|r| r.memory.id == neighbor);
        assert!(neighbor_result.is_some());
        assert!(neighbor_result.unwrap().components.graph >= 0.3);
    }
}
