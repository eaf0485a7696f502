//! Graph maintenance: entity-relationship densification, co-retrieval link
//! building, entity backfill, and co-retrieval log cleanup.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::Result;
use crate::storage::{memories::attach_entities, now_str, timestamp, Store};

// ============================================================================
// DENSIFY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DensifyOptions {
    /// Shared-memory count below which a pair is noise
    pub min_cooccurrence: i64,
    pub max_proposals: usize,
    pub dry_run: bool,
}

impl Default for DensifyOptions {
    fn default() -> Self {
        Self {
            min_cooccurrence: 3,
            max_proposals: 50,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DensifyReport {
    pub pairs_considered: usize,
    pub proposed: usize,
    pub dry_run: bool,
}

const DENSIFY_LABEL: &str = "related_to";

/// Propose `related_to` relationships for entity pairs that co-occur in
/// enough memories and are not yet related.
pub fn run_densify(store: &Store, options: &DensifyOptions) -> Result<DensifyReport> {
    let pairs = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT a.entity_id, b.entity_id, COUNT(*) AS co
             FROM memory_entities a
             JOIN memory_entities b
               ON a.memory_id = b.memory_id AND a.entity_id < b.entity_id
             GROUP BY a.entity_id, b.entity_id
             HAVING co >= ?1
             ORDER BY co DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![options.min_cooccurrence, options.max_proposals as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut report = DensifyReport {
        pairs_considered: pairs.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    if pairs.is_empty() {
        return Ok(report);
    }

    let proposed = store.with_writer_tx(|conn| {
        let mut proposed = 0usize;
        for (a, b, co) in &pairs {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entity_relationships
                 WHERE (source_id = ?1 AND target_id = ?2)
                    OR (source_id = ?2 AND target_id = ?1)",
                params![a, b],
                |row| row.get(0),
            )?;
            if exists > 0 {
                continue;
            }
            proposed += 1;
            if options.dry_run {
                continue;
            }
            let confidence = (0.3 + 0.1 * (*co as f64)).min(0.9);
            conn.execute(
                "INSERT OR IGNORE INTO entity_relationships
                    (id, source_id, target_id, relationship, confidence, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Ulid::new().to_string(),
                    a,
                    b,
                    DENSIFY_LABEL,
                    confidence,
                    format!("co-occurred in {} memories", co),
                    now_str()
                ],
            )?;
        }
        Ok(proposed)
    })?;

    report.proposed = proposed;
    Ok(report)
}

// ============================================================================
// CO-RETRIEVAL LINK BUILDING
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoRetrievalLinkOptions {
    pub lookback_days: i64,
    /// Pair count floor
    pub min_co_retrievals: i64,
    /// Most links touched per run
    pub max_links: usize,
    pub dry_run: bool,
}

impl Default for CoRetrievalLinkOptions {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            min_co_retrievals: 3,
            max_links: 200,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoRetrievalLinkReport {
    pub events_scanned: usize,
    pub qualifying_pairs: usize,
    pub links_created: usize,
    pub links_strengthened: usize,
    pub dry_run: bool,
}

/// Turn repeated co-retrieval into `related` memory links. New links start
/// at `min(0.9, 0.3 + 0.03 * count)`; existing links strengthen by 0.05 up
/// to 0.9.
pub fn run_co_retrieval_links(
    store: &Store,
    options: &CoRetrievalLinkOptions,
) -> Result<CoRetrievalLinkReport> {
    let cutoff = timestamp(Utc::now() - Duration::days(options.lookback_days));

    let events = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT memory_ids FROM co_retrievals WHERE retrieved_at >= ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut report = CoRetrievalLinkReport {
        events_scanned: events.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    // Unordered pair counts across all events in the window.
    let mut counts: HashMap<(String, String), i64> = HashMap::new();
    for event in &events {
        let ids: Vec<String> = serde_json::from_str(event).unwrap_or_default();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let key = if ids[i] < ids[j] {
                    (ids[i].clone(), ids[j].clone())
                } else {
                    (ids[j].clone(), ids[i].clone())
                };
                *counts.entry(key).or_default() += 1;
            }
        }
    }

    let mut qualifying: Vec<((String, String), i64)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= options.min_co_retrievals)
        .collect();
    qualifying.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    qualifying.truncate(options.max_links);
    report.qualifying_pairs = qualifying.len();

    if options.dry_run || qualifying.is_empty() {
        return Ok(report);
    }

    let (created, strengthened) = store.with_writer_tx(|conn| {
        let mut created = 0usize;
        let mut strengthened = 0usize;
        for ((a, b), count) in &qualifying {
            // Rows may have been purged since the event was logged.
            let both_exist: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE id IN (?1, ?2)",
                params![a, b],
                |row| row.get(0),
            )?;
            if both_exist < 2 {
                continue;
            }

            let existing: Option<f64> = conn
                .query_row(
                    "SELECT strength FROM memory_links WHERE source_id = ?1 AND target_id = ?2",
                    params![a, b],
                    |row| row.get(0),
                )
                .ok();

            match existing {
                Some(strength) => {
                    conn.execute(
                        "UPDATE memory_links SET strength = MIN(0.9, ?1)
                         WHERE source_id = ?2 AND target_id = ?3",
                        params![strength + 0.05, a, b],
                    )?;
                    strengthened += 1;
                }
                None => {
                    let strength = (0.3 + 0.03 * (*count as f64)).min(0.9);
                    conn.execute(
                        "INSERT INTO memory_links (source_id, target_id, link_type, strength, created_at)
                         VALUES (?1, ?2, 'related', ?3, ?4)
                         ON CONFLICT(source_id, target_id) DO NOTHING",
                        params![a, b, strength, now_str()],
                    )?;
                    created += 1;
                }
            }
        }
        Ok((created, strengthened))
    })?;

    report.links_created = created;
    report.links_strengthened = strengthened;
    Ok(report)
}

/// Delete co-retrieval rows older than the horizon.
pub fn cleanup_co_retrievals(store: &Store, older_than_days: i64) -> Result<usize> {
    let cutoff = timestamp(Utc::now() - Duration::days(older_than_days));
    store.with_writer(|conn| {
        let deleted = conn.execute(
            "DELETE FROM co_retrievals WHERE retrieved_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    })
}

// ============================================================================
// ENTITY BACKFILL
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityBackfillOptions {
    /// Memories processed per run
    pub batch_size: usize,
    pub dry_run: bool,
}

impl Default for EntityBackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 200,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityBackfillReport {
    pub memories_scanned: usize,
    pub memories_linked: usize,
    pub dry_run: bool,
}

/// Re-run rule-based extraction over active memories that carry no entity
/// links yet.
pub fn run_entity_backfill(
    store: &Store,
    options: &EntityBackfillOptions,
) -> Result<EntityBackfillReport> {
    let pending = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, content FROM memories m
             WHERE m.is_active = 1 AND m.is_metadata = 0
               AND NOT EXISTS (SELECT 1 FROM memory_entities me WHERE me.memory_id = m.id)
             ORDER BY m.created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![options.batch_size as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut report = EntityBackfillReport {
        memories_scanned: pending.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    if options.dry_run || pending.is_empty() {
        return Ok(report);
    }

    let linked = store.with_writer_tx(|conn| {
        let now = now_str();
        let mut linked = 0usize;
        for (id, content) in &pending {
            match attach_entities(conn, id, content, &now) {
                Ok(count) if count > 0 => linked += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!("backfill extraction failed for {}: {}", id, e),
            }
        }
        Ok(linked)
    })?;

    report.memories_linked = linked;
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateMemoryInput, EntityType, LinkType};

    fn create(store: &Store, content: &str) -> String {
        store
            .create_memory(CreateMemoryInput::new(content))
            .unwrap()
            .memory
            .id
    }

    fn log_co_retrieval(store: &Store, ids: &[&str], times: usize) {
        for _ in 0..times {
            store
                .with_writer(|conn| {
                    conn.execute(
                        "INSERT INTO co_retrievals (query_hash, memory_ids, retrieved_at)
                         VALUES ('abcd1234abcd1234', ?1, ?2)",
                        params![serde_json::to_string(ids).unwrap(), now_str()],
                    )?;
                    Ok(())
                })
                .unwrap();
        }
    }

    #[test]
    fn test_co_retrieval_links_created_with_scaled_strength() {
        let store = Store::open_in_memory().unwrap();
        let a = create(&store, "co-retrieved memory alpha");
        let b = create(&store, "co-retrieved memory beta");
        log_co_retrieval(&store, &[&a, &b], 4);

        let report =
            run_co_retrieval_links(&store, &CoRetrievalLinkOptions::default()).unwrap();
        assert_eq!(report.qualifying_pairs, 1);
        assert_eq!(report.links_created, 1);

        let links = store.links_for_memory(&a).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, LinkType::Related);
        // 0.3 + 0.03 * 4
        assert!((links[0].strength - 0.42).abs() < 1e-9);
    }

    #[test]
    fn test_existing_link_strengthens_by_five_points() {
        let store = Store::open_in_memory().unwrap();
        let a = create(&store, "strengthened pair alpha");
        let b = create(&store, "strengthened pair beta");
        let (first, second) = if a < b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        store
            .upsert_memory_link(&first, &second, LinkType::Related, 0.5)
            .unwrap();
        log_co_retrieval(&store, &[&first, &second], 3);

        let report =
            run_co_retrieval_links(&store, &CoRetrievalLinkOptions::default()).unwrap();
        assert_eq!(report.links_strengthened, 1);

        let links = store.links_for_memory(&first).unwrap();
        assert!((links[0].strength - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_pairs_ignored() {
        let store = Store::open_in_memory().unwrap();
        let a = create(&store, "rare pair alpha");
        let b = create(&store, "rare pair beta");
        log_co_retrieval(&store, &[&a, &b], 2);

        let report =
            run_co_retrieval_links(&store, &CoRetrievalLinkOptions::default()).unwrap();
        assert_eq!(report.qualifying_pairs, 0);
        assert!(store.links_for_memory(&a).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_drops_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let a = create(&store, "cleanup alpha");
        let b = create(&store, "cleanup beta");
        log_co_retrieval(&store, &[&a, &b], 1);
        store
            .with_writer(|conn| {
                conn.execute(
                    "UPDATE co_retrievals SET retrieved_at = ?1",
                    params![timestamp(Utc::now() - Duration::days(90))],
                )?;
                Ok(())
            })
            .unwrap();

        let deleted = cleanup_co_retrievals(&store, 60).unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_densify_proposes_related_to() {
        let store = Store::open_in_memory().unwrap();
        let rust = store.upsert_entity("Rust", EntityType::Technology, &[]).unwrap();
        let tokio = store.upsert_entity("Tokio", EntityType::Technology, &[]).unwrap();

        for i in 0..3 {
            let m = create(&store, &format!("densify co-occurrence fixture {}", i));
            store.link_memory_entity(&m, &rust.id, 0.8).unwrap();
            store.link_memory_entity(&m, &tokio.id, 0.8).unwrap();
        }

        let report = run_densify(&store, &DensifyOptions::default()).unwrap();
        assert_eq!(report.proposed, 1);

        let rels = store.relationships_for_entity(&rust.id).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].relationship, "related_to");

        // Second pass proposes nothing new
        let again = run_densify(&store, &DensifyOptions::default()).unwrap();
        assert_eq!(again.proposed, 0);
    }

    #[test]
    fn test_entity_backfill_links_unlinked_memories() {
        let store = Store::open_in_memory().unwrap();
        let id = create(
            &store,
            "Met with Grace Hopper to talk about compilers, and Grace Hopper approved",
        );
        // Strip whatever the create-path extraction attached.
        store
            .with_writer(|conn| {
                conn.execute("DELETE FROM memory_entities WHERE memory_id = ?1", params![id])?;
                Ok(())
            })
            .unwrap();

        let report =
            run_entity_backfill(&store, &EntityBackfillOptions::default()).unwrap();
        assert_eq!(report.memories_scanned, 1);
        assert_eq!(report.memories_linked, 1);

        let entity = store.find_entity_by_name("Grace Hopper").unwrap();
        assert!(entity.is_some());
    }
}
