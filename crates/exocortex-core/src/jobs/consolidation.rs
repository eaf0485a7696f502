//! Consolidation: greedy agglomerative clustering of similar memories into
//! template summaries.
//!
//! Clusters are seeded newest-first over active, un-chunked memories with
//! embeddings. A materialized cluster becomes a `summary` memory; members go
//! inactive with `parent_id` pointing at the summary, and an immutable
//! `consolidations` record is written.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::embeddings::{vector_from_bytes, vector_to_bytes};
use crate::error::Result;
use crate::extract::{content_hash, derive_keywords};
use crate::scoring::cosine;
use crate::storage::{now_str, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationOptions {
    /// Cosine floor for cluster membership
    pub min_similarity: f64,
    /// Smallest cluster worth materializing
    pub min_cluster_size: usize,
    /// Most recent memories considered
    pub max_memories: usize,
    pub dry_run: bool,
}

impl Default for ConsolidationOptions {
    fn default() -> Self {
        Self {
            min_similarity: 0.75,
            min_cluster_size: 3,
            max_memories: 500,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub memories_considered: usize,
    pub clusters_found: usize,
    pub memories_merged: usize,
    pub summary_ids: Vec<String>,
    pub dry_run: bool,
}

struct Member {
    id: String,
    content: String,
    embedding: Vec<f32>,
}

/// Importance assigned to consolidation summaries.
const SUMMARY_IMPORTANCE: f64 = 0.8;

const STRATEGY: &str = "semantic-cluster";

pub fn run_consolidation(
    store: &Store,
    options: &ConsolidationOptions,
) -> Result<ConsolidationReport> {
    // Candidate load, newest first.
    let members = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, content, embedding FROM memories
             WHERE is_active = 1 AND embedding IS NOT NULL AND chunk_index IS NULL
               AND is_metadata = 0 AND content_type != 'summary'
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![options.max_memories as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, content, blob)| {
                vector_from_bytes(&blob).map(|embedding| Member {
                    id,
                    content,
                    embedding,
                })
            })
            .collect::<Vec<Member>>())
    })?;

    let mut report = ConsolidationReport {
        memories_considered: members.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    // Greedy agglomeration: each unassigned seed absorbs every unassigned
    // candidate within the similarity floor.
    let mut assigned = vec![false; members.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for seed in 0..members.len() {
        if assigned[seed] {
            continue;
        }
        let mut cluster = vec![seed];
        for candidate in (seed + 1)..members.len() {
            if assigned[candidate] {
                continue;
            }
            let similarity =
                cosine(&members[seed].embedding, &members[candidate].embedding) as f64;
            if similarity >= options.min_similarity {
                cluster.push(candidate);
            }
        }
        if cluster.len() >= options.min_cluster_size {
            for &i in &cluster {
                assigned[i] = true;
            }
            clusters.push(cluster);
        }
    }

    report.clusters_found = clusters.len();
    if options.dry_run || clusters.is_empty() {
        report.memories_merged = clusters.iter().map(|c| c.len()).sum();
        return Ok(report);
    }

    // Materialize. Summary embeddings are computed before the write
    // transaction; a dead provider just leaves them null.
    let summaries: Vec<(Vec<usize>, String, Option<Vec<f32>>)> = clusters
        .into_iter()
        .map(|cluster| {
            let content = summary_content(&cluster, &members);
            let embedding = store.embed_text(&content).ok();
            (cluster, content, embedding)
        })
        .collect();

    let (summary_ids, merged) = store.with_writer_tx(|conn| {
        let mut summary_ids = Vec::new();
        let mut merged = 0usize;
        for (cluster, content, embedding) in &summaries {
            let summary_id = Ulid::new().to_string();
            let now = now_str();
            let source_ids: Vec<&str> =
                cluster.iter().map(|&i| members[i].id.as_str()).collect();

            let metadata = serde_json::json!({
                "strategy": STRATEGY,
                "source_count": cluster.len(),
                "source_ids": source_ids,
            });

            conn.execute(
                "INSERT INTO memories (
                    id, content, content_type, source, embedding, importance,
                    is_metadata, is_indexed, metadata, keywords, content_hash,
                    created_at, updated_at
                ) VALUES (?1, ?2, 'summary', 'consolidation', ?3, ?4, 0, 1, ?5, ?6, ?7, ?8, ?8)",
                params![
                    summary_id,
                    content,
                    embedding.as_deref().map(vector_to_bytes),
                    SUMMARY_IMPORTANCE,
                    serde_json::to_string(&metadata)?,
                    derive_keywords(content),
                    content_hash(content),
                    now,
                ],
            )?;

            // Tags: union of member tags, in member order.
            let mut union: Vec<String> = Vec::new();
            for &i in cluster {
                for tag in Store::load_tags(conn, &members[i].id)? {
                    if !union.contains(&tag) {
                        union.push(tag);
                    }
                }
            }
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO memory_tags (memory_id, tag, position) VALUES (?1, ?2, ?3)",
            )?;
            for (position, tag) in union.iter().enumerate() {
                stmt.execute(params![summary_id, tag, position as i64])?;
            }

            for &i in cluster {
                conn.execute(
                    "UPDATE memories SET is_active = 0, parent_id = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![summary_id, now, members[i].id],
                )?;
            }

            conn.execute(
                "INSERT INTO consolidations (id, summary_id, source_ids, strategy,
                                             memories_merged, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Ulid::new().to_string(),
                    summary_id,
                    serde_json::to_string(&source_ids)?,
                    STRATEGY,
                    cluster.len() as i64,
                    now,
                ],
            )?;

            summary_ids.push(summary_id);
            merged += cluster.len();
        }
        Ok((summary_ids, merged))
    })?;
    report.summary_ids = summary_ids;
    report.memories_merged = merged;

    tracing::info!(
        "consolidation: {} clusters, {} memories merged",
        report.clusters_found,
        report.memories_merged
    );
    Ok(report)
}

/// Structural summary only: a header plus clipped member lines. No language
/// generation.
fn summary_content(cluster: &[usize], members: &[Member]) -> String {
    let mut lines = vec![format!(
        "Consolidated summary of {} related memories:",
        cluster.len()
    )];
    for &i in cluster {
        let first_line = members[i].content.lines().next().unwrap_or("");
        let clipped: String = first_line.chars().take(120).collect();
        lines.push(format!("- {}", clipped));
    }
    lines.join("\n")
}

// ============================================================================
// TESTS
// ============================================================================
