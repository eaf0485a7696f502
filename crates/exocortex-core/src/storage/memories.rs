//! Memory CRUD: the create pipeline (hash dedup, chunking, embedding,
//! semantic dedup, extraction side-effects), reads, updates, deletes, and
//! access recording.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::embeddings::vector_to_bytes;
use crate::error::{Error, Result};
use crate::extract::{content_hash, derive_keywords, extract_entities, split_chunks};
use crate::scoring::cosine;
use crate::storage::{now_str, IngestSettings, Store};
use crate::types::{
    ContentType, CreateMemoryInput, CreateMemoryResult, Memory, MemorySource, UpdateMemoryInput,
};

/// Importance assigned to benchmark artifacts.
const BENCHMARK_IMPORTANCE: f64 = 0.15;

/// Tag stamped onto benchmark artifacts.
const BENCHMARK_TAG: &str = "benchmark-artifact";

struct NewRow<'a> {
    id: &'a str,
    content: &'a str,
    content_type: ContentType,
    source: MemorySource,
    source_uri: Option<&'a str>,
    embedding: Option<&'a [f32]>,
    importance: f64,
    parent_id: Option<&'a str>,
    is_metadata: bool,
    is_indexed: bool,
    chunk_index: Option<i64>,
    metadata: &'a serde_json::Value,
    content_hash: &'a str,
    now: &'a str,
}

fn insert_memory_row(conn: &Connection, row: &NewRow) -> Result<()> {
    conn.execute(
        "INSERT INTO memories (
            id, content, content_type, source, source_uri, embedding,
            importance, parent_id, is_metadata, is_indexed, chunk_index,
            metadata, keywords, content_hash, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            row.id,
            row.content,
            row.content_type.as_str(),
            row.source.as_str(),
            row.source_uri,
            row.embedding.map(vector_to_bytes),
            row.importance,
            row.parent_id,
            row.is_metadata as i64,
            row.is_indexed as i64,
            row.chunk_index,
            serde_json::to_string(row.metadata)?,
            derive_keywords(row.content),
            row.content_hash,
            row.now,
        ],
    )?;
    Ok(())
}

fn insert_tags(conn: &Connection, memory_id: &str, tags: &[String]) -> Result<()> {
    let start: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM memory_tags WHERE memory_id = ?1",
        params![memory_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO memory_tags (memory_id, tag, position) VALUES (?1, ?2, ?3)",
    )?;
    for (i, tag) in tags.iter().enumerate() {
        stmt.execute(params![memory_id, tag, start + i as i64])?;
    }
    Ok(())
}

fn is_constraint_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// One record yielded by an import parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Store {
    // ========================================================================
    // CREATE
    // ========================================================================

    /// Create a memory, running the full ingest pipeline: trim and hash,
    /// hash dedup, chunking, embedding, semantic dedup, entity extraction,
    /// and goal auto-linking. Extraction and goal-linking are side-effects
    /// that never abort the create.
    pub fn create_memory(&self, input: CreateMemoryInput) -> Result<CreateMemoryResult> {
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(Error::InvalidInput("memory content is empty".to_string()));
        }
        if let Some(importance) = input.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(Error::InvalidInput(format!(
                    "importance {} outside [0,1]",
                    importance
                )));
            }
        }

        let hash = content_hash(&content);
        let ingest = self.with_reader(|conn| Ok(IngestSettings::load(conn)))?;

        let benchmark = input.benchmark;
        let is_metadata = input.is_metadata || benchmark;
        let importance = input
            .importance
            .unwrap_or(if benchmark { BENCHMARK_IMPORTANCE } else { 0.5 });

        let mut tags = input.tags.clone();
        if benchmark && !tags.iter().any(|t| t.eq_ignore_ascii_case(BENCHMARK_TAG)) {
            tags.push(BENCHMARK_TAG.to_string());
        }

        // Chunk decision and embeddings happen before the transaction; the
        // provider call is a suspension point and must not hold the writer.
        let chunk_texts: Vec<String> =
            if ingest.chunking_enabled && content.len() > ingest.chunking_max_length {
                split_chunks(&content, ingest.chunking_target_size)
            } else {
                Vec::new()
            };

        let embedding = if benchmark {
            None
        } else {
            match self.embed_text(&content) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("embedding failed, storing without vector: {}", e);
                    None
                }
            }
        };

        let chunk_embeddings: Vec<Option<Vec<f32>>> = chunk_texts
            .iter()
            .map(|chunk| {
                if benchmark {
                    return None;
                }
                self.embed_text(chunk).ok()
            })
            .collect();

        let metadata = input
            .metadata
            .clone()
            .unwrap_or(serde_json::Value::Object(Default::default()));

        let result = self.with_writer_tx(|conn| {
            let now = now_str();
            let normalized_tags = Store::normalize_tags(conn, &tags)?;

            // Hash dedup: an active row with this hash wins, and absorbs the
            // new tags.
            if ingest.hash_dedup_enabled && ingest.skip_insert_on_match {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM memories
                         WHERE content_hash = ?1 AND is_active = 1 AND chunk_index IS NULL",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing_id) = existing {
                    insert_tags(conn, &existing_id, &normalized_tags)?;
                    let memory = Store::read_memory(conn, &existing_id)?
                        .ok_or_else(|| Error::NotFound(existing_id.clone()))?;
                    return Ok(CreateMemoryResult {
                        memory,
                        dedup_action: Some("skipped".to_string()),
                        superseded_id: None,
                        dedup_similarity: None,
                        chunk_count: None,
                    });
                }
            }

            if let Some(ref parent_id) = input.parent_id {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE id = ?1",
                    params![parent_id],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Err(Error::InvalidInput(format!(
                        "parent {} does not exist",
                        parent_id
                    )));
                }
            }

            let id = Ulid::new().to_string();

            // Semantic dedup against the most recent active peers of the same
            // content type, resolved before the new row exists so it cannot
            // match itself. The supersede write happens after the insert.
            let mut dedup_hit = None;
            if ingest.dedup_enabled && chunk_texts.is_empty() {
                if let Some(ref new_vec) = embedding {
                    dedup_hit = find_semantic_duplicate(
                        conn,
                        new_vec,
                        input.content_type,
                        &normalized_tags,
                        ingest.dedup_threshold,
                        ingest.dedup_candidate_pool,
                    )?;
                }
            }

            let chunked = !chunk_texts.is_empty();
            insert_memory_row(
                conn,
                &NewRow {
                    id: &id,
                    content: &content,
                    content_type: input.content_type,
                    source: input.source,
                    source_uri: input.source_uri.as_deref(),
                    embedding: embedding.as_deref(),
                    importance,
                    parent_id: input.parent_id.as_deref(),
                    is_metadata,
                    // A chunked parent's text lives in its chunks; benchmark
                    // rows stay out of the lexical index entirely.
                    is_indexed: !benchmark && !chunked,
                    chunk_index: None,
                    metadata: &metadata,
                    content_hash: &hash,
                    now: &now,
                },
            )?;
            insert_tags(conn, &id, &normalized_tags)?;

            // The older near-duplicate is superseded by the row just written.
            let mut superseded_id = None;
            let mut dedup_similarity = None;
            if let Some((old_id, similarity)) = dedup_hit.clone() {
                conn.execute(
                    "UPDATE memories SET is_active = 0, superseded_by = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![id, now, old_id],
                )?;
                superseded_id = Some(old_id);
                dedup_similarity = Some(similarity);
            }

            for (i, chunk) in chunk_texts.iter().enumerate() {
                let chunk_id = Ulid::new().to_string();
                insert_memory_row(
                    conn,
                    &NewRow {
                        id: &chunk_id,
                        content: chunk,
                        content_type: input.content_type,
                        source: input.source,
                        source_uri: input.source_uri.as_deref(),
                        embedding: chunk_embeddings[i].as_deref(),
                        importance,
                        parent_id: Some(&id),
                        is_metadata,
                        is_indexed: !benchmark,
                        chunk_index: Some(i as i64),
                        metadata: &metadata,
                        content_hash: &content_hash(chunk),
                        now: &now,
                    },
                )?;
                insert_tags(conn, &chunk_id, &normalized_tags)?;
            }

            // Side-effects: must not abort the create.
            if !benchmark {
                if let Err(e) = attach_entities(conn, &id, &content, &now) {
                    tracing::warn!("entity extraction failed for {}: {}", id, e);
                }
                if let Err(e) =
                    crate::storage::goals::auto_link_progress(conn, &id, &content, embedding.as_deref())
                {
                    tracing::warn!("goal auto-link failed for {}: {}", id, e);
                }
            }

            let memory =
                Store::read_memory(conn, &id)?.ok_or_else(|| Error::NotFound(id.clone()))?;
            Ok(CreateMemoryResult {
                memory,
                dedup_action: None,
                superseded_id,
                dedup_similarity,
                chunk_count: if chunked { Some(chunk_texts.len()) } else { None },
            })
        });

        let result = match result {
            Ok(r) => Ok(r),
            // A concurrent writer won the hash race. Treat the uniqueness
            // violation as idempotent success and return the winner.
            Err(e) if is_constraint_violation(&e) => self.with_writer_tx(|conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM memories
                         WHERE content_hash = ?1 AND is_active = 1 AND chunk_index IS NULL",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                let existing_id = existing.ok_or(Error::Conflict(
                    "uniqueness violation without a surviving row".to_string(),
                ))?;
                let normalized_tags = Store::normalize_tags(conn, &tags)?;
                insert_tags(conn, &existing_id, &normalized_tags)?;
                let memory = Store::read_memory(conn, &existing_id)?
                    .ok_or_else(|| Error::NotFound(existing_id.clone()))?;
                Ok(CreateMemoryResult {
                    memory,
                    dedup_action: Some("skipped".to_string()),
                    superseded_id: None,
                    dedup_similarity: None,
                    chunk_count: None,
                })
            }),
            Err(e) => Err(e),
        }?;

        self.note_write();
        Ok(result)
    }

    // ========================================================================
    // READ
    // ========================================================================

    pub fn get_by_id(&self, id: &str) -> Result<Option<Memory>> {
        self.with_reader(|conn| Store::read_memory(conn, id))
    }

    /// Fetch several memories, preserving the input order. Unknown ids are
    /// silently dropped.
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Memory>> {
        self.with_reader(|conn| {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(m) = Store::read_memory(conn, id)? {
                    out.push(m);
                }
            }
            Ok(out)
        })
    }

    /// Most recently created active memories, optionally filtered to any of
    /// the given tags. Multiple tag filters deduplicate.
    pub fn get_recent(&self, limit: usize, offset: usize, tags: &[String]) -> Result<Vec<Memory>> {
        self.with_reader(|conn| {
            let tags = Store::normalize_tags(conn, tags)?;
            let mut memories = if tags.is_empty() {
                let mut stmt = conn.prepare(
                    "SELECT * FROM memories WHERE is_active = 1
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], Store::row_to_memory)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            } else {
                let placeholders = vec!["?"; tags.len()].join(", ");
                let sql = format!(
                    "SELECT DISTINCT m.* FROM memories m
                     JOIN memory_tags t ON t.memory_id = m.id AND t.tag IN ({})
                     WHERE m.is_active = 1
                     ORDER BY m.created_at DESC LIMIT ? OFFSET ?",
                    placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut values: Vec<&dyn rusqlite::ToSql> =
                    tags.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
                let limit = limit as i64;
                let offset = offset as i64;
                values.push(&limit);
                values.push(&offset);
                let rows = stmt
                    .query_map(values.as_slice(), Store::row_to_memory)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            for m in &mut memories {
                m.tags = Store::load_tags(conn, &m.id)?;
            }
            Ok(memories)
        })
    }

    /// Archived (inactive) memories, most recently updated first.
    pub fn get_archived(&self, limit: usize, offset: usize) -> Result<Vec<Memory>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM memories WHERE is_active = 0
                 ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut memories = stmt
                .query_map(params![limit as i64, offset as i64], Store::row_to_memory)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for m in &mut memories {
                m.tags = Store::load_tags(conn, &m.id)?;
            }
            Ok(memories)
        })
    }

    // ========================================================================
    // MUTATE
    // ========================================================================

    /// Reactivate an archived memory.
    pub fn restore(&self, id: &str) -> Result<Memory> {
        self.with_writer_tx(|conn| {
            let changed = conn.execute(
                "UPDATE memories SET is_active = 1, superseded_by = NULL, updated_at = ?1
                 WHERE id = ?2 AND is_active = 0",
                params![now_str(), id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            Store::read_memory(conn, id)?.ok_or_else(|| Error::NotFound(id.to_string()))
        })
    }

    /// Hard delete. Chunk children go with their parent; tags, entity links,
    /// and access rows cascade.
    pub fn delete_memory(&self, id: &str) -> Result<()> {
        self.with_writer_tx(|conn| {
            conn.execute(
                "DELETE FROM memories WHERE parent_id = ?1 AND chunk_index IS NOT NULL",
                params![id],
            )?;
            let deleted = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Apply a patch. Metadata merges key-by-key; the embedding is cleared
    /// (and recomputed) only when the content changes; shortening a chunked
    /// parent dechunks it.
    pub fn update_memory(&self, id: &str, patch: UpdateMemoryInput) -> Result<Memory> {
        if let Some(importance) = patch.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(Error::InvalidInput(format!(
                    "importance {} outside [0,1]",
                    importance
                )));
            }
        }

        let new_content = match patch.content {
            Some(ref c) => {
                let trimmed = c.trim().to_string();
                if trimmed.is_empty() {
                    return Err(Error::InvalidInput("memory content is empty".to_string()));
                }
                Some(trimmed)
            }
            None => None,
        };

        // Re-embed outside the transaction when content changes.
        let new_embedding = match new_content {
            Some(ref c) => self.embed_text(c).ok(),
            None => None,
        };

        let ingest = self.with_reader(|conn| Ok(IngestSettings::load(conn)))?;

        self.with_writer_tx(|conn| {
            let existing = Store::read_memory(conn, id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let now = now_str();

            if let Some(ref content) = new_content {
                let child_count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE parent_id = ?1 AND chunk_index IS NOT NULL",
                    params![id],
                    |row| row.get(0),
                )?;
                let dechunk = child_count > 0 && content.len() <= ingest.chunking_max_length;
                if dechunk {
                    conn.execute(
                        "DELETE FROM memories WHERE parent_id = ?1 AND chunk_index IS NOT NULL",
                        params![id],
                    )?;
                }

                conn.execute(
                    "UPDATE memories SET content = ?1, content_hash = ?2, keywords = ?3,
                        embedding = ?4, is_indexed = ?5, updated_at = ?6
                     WHERE id = ?7",
                    params![
                        content,
                        content_hash(content),
                        derive_keywords(content),
                        new_embedding.as_deref().map(vector_to_bytes),
                        (!existing.is_metadata && (dechunk || child_count == 0)) as i64,
                        now,
                        id
                    ],
                )?;
            }

            if let Some(importance) = patch.importance {
                conn.execute(
                    "UPDATE memories SET importance = ?1, updated_at = ?2 WHERE id = ?3",
                    params![importance, now, id],
                )?;
            }

            if let Some(ref metadata_patch) = patch.metadata {
                let mut merged = existing.metadata.clone();
                if let (Some(base), Some(patch_obj)) =
                    (merged.as_object_mut(), metadata_patch.as_object())
                {
                    for (k, v) in patch_obj {
                        base.insert(k.clone(), v.clone());
                    }
                }
                conn.execute(
                    "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&merged)?, now, id],
                )?;
            }

            if let Some(ref tags) = patch.tags {
                let normalized = Store::normalize_tags(conn, tags)?;
                conn.execute("DELETE FROM memory_tags WHERE memory_id = ?1", params![id])?;
                insert_tags(conn, id, &normalized)?;
                conn.execute(
                    "UPDATE memories SET updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
            }

            Store::read_memory(conn, id)?.ok_or_else(|| Error::NotFound(id.to_string()))
        })
    }

    // ========================================================================
    // ACCESS RECORDING
    // ========================================================================

    /// Record a retrieval of `id`. Serialized through the single writer, so
    /// N concurrent calls end with `access_count == N` and N log rows.
    pub fn record_access(&self, id: &str, query: Option<&str>) -> Result<()> {
        self.with_writer_tx(|conn| {
            let now = now_str();
            let changed = conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            conn.execute(
                "INSERT INTO access_log (memory_id, query, accessed_at) VALUES (?1, ?2, ?3)",
                params![id, query, now],
            )?;
            Ok(())
        })
    }

    /// Mark a memory as having been useful after retrieval.
    pub fn mark_useful(&self, id: &str) -> Result<()> {
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE memories SET useful_count = useful_count + 1, updated_at = ?1
                 WHERE id = ?2",
                params![now_str(), id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    // ========================================================================
    // IMPORT
    // ========================================================================

    /// Ingest parsed transcript/file records. Hash dedup turns repeats into
    /// skips; individual failures are logged and counted, never fatal.
    pub fn import_records<I>(&self, records: I) -> Result<ImportReport>
    where
        I: IntoIterator<Item = ImportRecord>,
    {
        let mut report = ImportReport::default();
        for record in records {
            let input = CreateMemoryInput {
                content: record.content,
                content_type: record.content_type.unwrap_or_default(),
                source: MemorySource::Import,
                source_uri: record.source_uri,
                tags: record.tags,
                metadata: record.metadata,
                ..Default::default()
            };
            match self.create_memory(input) {
                Ok(result) if result.dedup_action.is_some() => report.skipped += 1,
                Ok(_) => report.created += 1,
                Err(e) => {
                    tracing::warn!("import record failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Find the best semantic duplicate among recent active peers. Requires tag
/// overlap and similarity at or above the threshold.
fn find_semantic_duplicate(
    conn: &Connection,
    new_vec: &[f32],
    content_type: ContentType,
    new_tags: &[String],
    threshold: f64,
    candidate_pool: i64,
) -> Result<Option<(String, f32)>> {
    let mut stmt = conn.prepare(
        "SELECT id, embedding FROM memories
         WHERE is_active = 1 AND embedding IS NOT NULL AND content_type = ?1
           AND chunk_index IS NULL
         ORDER BY created_at DESC LIMIT ?2",
    )?;

    let candidates = stmt
        .query_map(params![content_type.as_str(), candidate_pool], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut best: Option<(String, f32)> = None;
    for (id, blob) in candidates {
        let Some(vec) = crate::embeddings::vector_from_bytes(&blob) else {
            continue;
        };
        let similarity = cosine(new_vec, &vec);
        if similarity as f64 >= threshold {
            if best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true) {
                best = Some((id, similarity));
            }
        }
    }

    let Some((id, similarity)) = best else {
        return Ok(None);
    };

    // Only supersede when the tag sets overlap (or the new memory is untagged
    // and so is the old one).
    let old_tags = Store::load_tags(conn, &id)?;
    let overlap = if new_tags.is_empty() && old_tags.is_empty() {
        true
    } else {
        new_tags.iter().any(|t| old_tags.contains(t))
    };

    if overlap {
        Ok(Some((id, similarity)))
    } else {
        Ok(None)
    }
}

/// Extract entities from content and attach them to the memory. Relevance
/// upserts keep the maximum.
pub(crate) fn attach_entities(
    conn: &Connection,
    memory_id: &str,
    content: &str,
    now: &str,
) -> Result<usize> {
    let mut attached = 0;
    for extracted in extract_entities(content) {
        let entity_id =
            crate::storage::entities::find_or_create_entity(conn, &extracted.name, extracted.entity_type, now)?;
        conn.execute(
            "INSERT INTO memory_entities (memory_id, entity_id, relevance) VALUES (?1, ?2, ?3)
             ON CONFLICT(memory_id, entity_id)
             DO UPDATE SET relevance = MAX(relevance, excluded.relevance)",
            params![memory_id, entity_id, extracted.relevance],
        )?;
        attached += 1;
    }
    Ok(attached)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingProvider;
    use std::sync::Arc;

    fn store_with_provider() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.set_embedding_provider(Arc::new(HashingProvider::new(128)));
        store
    }

    fn create(store: &Store, content: &str, tags: &[&str]) -> CreateMemoryResult {
        store
            .create_memory(CreateMemoryInput {
                content: content.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_create_then_get_roundtrip() {
        let store = store_with_provider();
        let created = create(&store, "Rust ownership prevents data races.", &["rust"]);

        let fetched = store.get_by_id(&created.memory.id).unwrap().unwrap();
        assert_eq!(fetched.content, created.memory.content);
        assert_eq!(fetched.tags, vec!["rust"]);
        assert_eq!(fetched.content_hash, created.memory.content_hash);
        assert!(fetched.is_active);
        assert!(fetched.embedding.is_some());
    }

    #[test]
    fn test_create_rejects_empty_content() {
        let store = store_with_provider();
        let err = store
            .create_memory(CreateMemoryInput::new("   \n  "))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_create_rejects_out_of_range_importance() {
        let store = store_with_provider();
        let mut input = CreateMemoryInput::new("valid content");
        input.importance = Some(1.5);
        assert!(matches!(
            store.create_memory(input),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_hash_dedup_merges_tags() {
        let store = store_with_provider();
        let first = create(&store, "Exact duplicate content phrase.", &["alpha"]);
        let second = create(&store, "Exact duplicate content phrase.", &["beta"]);

        assert_eq!(second.dedup_action.as_deref(), Some("skipped"));
        assert_eq!(second.memory.id, first.memory.id);
        assert!(second.memory.tags.contains(&"alpha".to_string()));
        assert!(second.memory.tags.contains(&"beta".to_string()));

        // Exactly one row with that content
        let count: i64 = store
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE content_hash = ?1",
                    params![first.memory.content_hash],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_hash_dedup_ignores_case_and_spacing() {
        let store = store_with_provider();
        let first = create(&store, "The deploy runs at NOON.", &[]);
        let second = create(&store, "the   deploy runs at noon.", &[]);
        assert_eq!(second.memory.id, first.memory.id);
        assert_eq!(second.dedup_action.as_deref(), Some("skipped"));
    }

    #[test]
    fn test_semantic_dedup_supersedes_older() {
        let store = store_with_provider();
        let first = create(
            &store,
            "We use the PostgreSQL database for billing and invoicing pipeline",
            &["infra"],
        );
        // Differs only in an article; cosine over shared tokens is >= 0.85
        let second = create(
            &store,
            "We use PostgreSQL database for billing and invoicing pipeline",
            &["infra"],
        );

        assert_eq!(second.superseded_id.as_deref(), Some(first.memory.id.as_str()));
        assert!(second.dedup_similarity.unwrap() >= 0.85);

        let old = store.get_by_id(&first.memory.id).unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(old.superseded_by.as_deref(), Some(second.memory.id.as_str()));
        assert!(store.get_by_id(&second.memory.id).unwrap().unwrap().is_active);
        assert_eq!(second.memory.access_count, 0);
    }

    #[test]
    fn test_semantic_dedup_requires_tag_overlap() {
        let store = store_with_provider();
        let first = create(
            &store,
            "We use the PostgreSQL database for billing and invoicing pipeline",
            &["infra"],
        );
        let second = create(
            &store,
            "We use PostgreSQL database for billing and invoicing pipeline",
            &["cooking"],
        );

        assert!(second.superseded_id.is_none());
        assert!(store.get_by_id(&first.memory.id).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_benchmark_create_is_unindexed_and_tagged() {
        let store = store_with_provider();
        let result = store
            .create_memory(CreateMemoryInput {
                content: "benchmark probe content".to_string(),
                benchmark: true,
                ..Default::default()
            })
            .unwrap();

        let m = &result.memory;
        assert!(m.is_metadata);
        assert!(!m.is_indexed);
        assert!(m.embedding.is_none());
        assert!((m.importance - 0.15).abs() < 1e-9);
        assert!(m.tags.contains(&"benchmark-artifact".to_string()));
    }

    #[test]
    fn test_chunking_creates_ordered_children() {
        let store = store_with_provider();
        let sentence = "Chunking splits long content into retrievable pieces. ";
        let content = sentence.repeat(60); // > 1500 chars
        let result = store.create_memory(CreateMemoryInput::new(content)).unwrap();

        let chunk_count = result.chunk_count.unwrap();
        assert!(chunk_count >= 2);

        let children: Vec<(String, i64)> = store
            .with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, chunk_index FROM memories WHERE parent_id = ?1 ORDER BY chunk_index",
                )?;
                let rows = stmt
                    .query_map(params![result.memory.id], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .unwrap();

        assert_eq!(children.len(), chunk_count);
        for (i, (_, idx)) in children.iter().enumerate() {
            assert_eq!(*idx, i as i64);
        }
        // Parent keeps full content but leaves the lexical index to chunks
        assert!(!result.memory.is_indexed);
    }

    #[test]
    fn test_update_dechunks_short_content() {
        let store = store_with_provider();
        let content = "A long sentence for the chunker to split apart. ".repeat(60);
        let created = store.create_memory(CreateMemoryInput::new(content)).unwrap();
        assert!(created.chunk_count.unwrap() >= 2);

        let updated = store
            .update_memory(
                &created.memory.id,
                UpdateMemoryInput {
                    content: Some("Now short.".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.content, "Now short.");
        assert!(updated.is_indexed);

        let children: i64 = store
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE parent_id = ?1",
                    params![created.memory.id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(children, 0);
    }

    #[test]
    fn test_update_merges_metadata() {
        let store = store_with_provider();
        let created = store
            .create_memory(CreateMemoryInput {
                content: "metadata carrier".to_string(),
                metadata: Some(serde_json::json!({"a": 1, "b": 2})),
                ..Default::default()
            })
            .unwrap();

        let updated = store
            .update_memory(
                &created.memory.id,
                UpdateMemoryInput {
                    metadata: Some(serde_json::json!({"b": 3, "c": 4})),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.metadata["a"], 1);
        assert_eq!(updated.metadata["b"], 3);
        assert_eq!(updated.metadata["c"], 4);
    }

    #[test]
    fn test_update_content_clears_stale_embedding() {
        let store = store_with_provider();
        let created = create(&store, "original embedded content", &[]);
        let original_vec = created.memory.embedding.clone().unwrap();

        let updated = store
            .update_memory(
                &created.memory.id,
                UpdateMemoryInput {
                    content: Some("completely different topic entirely".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let new_vec = updated.embedding.unwrap();
        assert_ne!(original_vec, new_vec);
    }

    #[test]
    fn test_record_access_increments_and_logs() {
        let store = store_with_provider();
        let created = create(&store, "frequently accessed memory", &[]);

        for _ in 0..3 {
            store.record_access(&created.memory.id, Some("query")).unwrap();
        }

        let m = store.get_by_id(&created.memory.id).unwrap().unwrap();
        assert_eq!(m.access_count, 3);
        assert!(m.last_accessed_at.is_some());

        let log_rows: i64 = store
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM access_log WHERE memory_id = ?1",
                    params![created.memory.id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(log_rows, 3);
    }

    #[test]
    fn test_delete_cascades() {
        let store = store_with_provider();
        let created = create(&store, "Ada Lovelace wrote about the Analytical Engine and Ada Lovelace was first.", &["history"]);
        store.record_access(&created.memory.id, None).unwrap();

        store.delete_memory(&created.memory.id).unwrap();
        assert!(store.get_by_id(&created.memory.id).unwrap().is_none());

        let (tags, accesses): (i64, i64) = store
            .with_reader(|conn| {
                let t: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memory_tags WHERE memory_id = ?1",
                    params![created.memory.id],
                    |row| row.get(0),
                )?;
                let a: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM access_log WHERE memory_id = ?1",
                    params![created.memory.id],
                    |row| row.get(0),
                )?;
                Ok((t, a))
            })
            .unwrap();
        assert_eq!(tags, 0);
        assert_eq!(accesses, 0);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = store_with_provider();
        assert!(matches!(
            store.delete_memory("01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_get_recent_with_tag_filter_dedupes() {
        let store = store_with_provider();
        create(&store, "tagged with both filters", &["one", "two"]);
        create(&store, "tagged with one filter", &["one"]);
        create(&store, "untagged memory", &[]);

        let recent = store
            .get_recent(10, 0, &["one".to_string(), "two".to_string()])
            .unwrap();
        assert_eq!(recent.len(), 2);
        // The doubly-tagged memory appears once despite matching both tags
        let ids: Vec<&str> = recent.iter().map(|m| m.id.as_str()).collect();
        let unique: std::collections::HashSet<&&str> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_restore_reactivates() {
        let store = store_with_provider();
        let created = create(&store, "to be archived", &[]);
        store
            .with_writer(|conn| {
                conn.execute(
                    "UPDATE memories SET is_active = 0 WHERE id = ?1",
                    params![created.memory.id],
                )?;
                Ok(())
            })
            .unwrap();

        let restored = store.restore(&created.memory.id).unwrap();
        assert!(restored.is_active);

        let archived = store.get_archived(10, 0).unwrap();
        assert!(archived.is_empty());
    }

    #[test]
    fn test_create_without_provider_stores_null_embedding() {
        let _guard = crate::embeddings::registry_test_lock();
        let store = Store::open_in_memory().unwrap();
        let result = store
            .create_memory(CreateMemoryInput::new("no provider registered here"))
            .unwrap();
        assert!(result.memory.embedding.is_none());
        assert!(result.memory.is_active);
    }

    #[test]
    fn test_import_records_counts_skips() {
        let store = store_with_provider();
        let records = vec![
            ImportRecord {
                content: "imported fact one".to_string(),
                tags: vec![],
                content_type: None,
                source_uri: None,
                metadata: None,
            },
            ImportRecord {
                content: "imported fact one".to_string(),
                tags: vec![],
                content_type: None,
                source_uri: None,
                metadata: None,
            },
            ImportRecord {
                content: "imported fact two".to_string(),
                tags: vec!["import".to_string()],
                content_type: None,
                source_uri: None,
                metadata: None,
            },
        ];

        let report = store.import_records(records).unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);

        let m = store.get_recent(10, 0, &["import".to_string()]).unwrap();
        assert_eq!(m[0].source, MemorySource::Import);
    }
}
