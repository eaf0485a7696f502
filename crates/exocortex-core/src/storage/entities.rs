//! Entity store, entity relationships, and memory-to-memory links.
//!
//! Entity lookup is case-insensitive. Memory-entity links upsert keeping the
//! maximum relevance. Relationship triples are unique; duplicate inserts are
//! silently ignored. Memory links are stored directed but queried
//! symmetrically.

use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{now_str, Store};
use crate::types::{Entity, EntityRelationship, EntityType, LinkType, LinkedRef, MemoryLink};

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let entity_type: String = row.get("entity_type")?;
    let aliases: String = row.get("aliases")?;
    let metadata: String = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Entity {
        id: row.get("id")?,
        name: row.get("name")?,
        entity_type: EntityType::parse_name(&entity_type),
        aliases: serde_json::from_str(&aliases).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        created_at: Store::parse_timestamp(&created_at, "created_at")?,
        updated_at: Store::parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn row_to_relationship(row: &rusqlite::Row) -> rusqlite::Result<EntityRelationship> {
    let created_at: String = row.get("created_at")?;
    Ok(EntityRelationship {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relationship: row.get("relationship")?,
        confidence: row.get("confidence")?,
        memory_id: row.get("memory_id")?,
        context: row.get("context")?,
        created_at: Store::parse_timestamp(&created_at, "created_at")?,
    })
}

/// Case-insensitive find-or-create, returning the entity id.
pub(crate) fn find_or_create_entity(
    conn: &Connection,
    name: &str,
    entity_type: EntityType,
    now: &str,
) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("entity name is empty".to_string()));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM entities WHERE name = ?1 COLLATE NOCASE",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = Ulid::new().to_string();
    conn.execute(
        "INSERT INTO entities (id, name, entity_type, aliases, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, '[]', '{}', ?4, ?4)",
        params![id, name, entity_type.as_str(), now],
    )?;
    Ok(id)
}

impl Store {
    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Find or create an entity by name (case-insensitive), merging any new
    /// aliases in.
    pub fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        aliases: &[String],
    ) -> Result<Entity> {
        self.with_writer_tx(|conn| {
            let now = now_str();
            let id = find_or_create_entity(conn, name, entity_type, &now)?;

            if !aliases.is_empty() {
                let current: String = conn.query_row(
                    "SELECT aliases FROM entities WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                let mut merged: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
                for alias in aliases {
                    let alias = alias.trim().to_string();
                    if !alias.is_empty()
                        && !merged.iter().any(|a| a.eq_ignore_ascii_case(&alias))
                    {
                        merged.push(alias);
                    }
                }
                conn.execute(
                    "UPDATE entities SET aliases = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&merged)?, now, id],
                )?;
            }

            conn.query_row(
                "SELECT * FROM entities WHERE id = ?1",
                params![id],
                row_to_entity,
            )
            .map_err(Error::from)
        })
    }

    /// Case-insensitive lookup by exact name.
    pub fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM entities WHERE name = ?1 COLLATE NOCASE",
                    params![name.trim()],
                    row_to_entity,
                )
                .optional()?)
        })
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row("SELECT * FROM entities WHERE id = ?1", params![id], row_to_entity)
                .optional()?)
        })
    }

    /// All entities, most memory-linked first.
    pub fn list_entities(&self, limit: usize) -> Result<Vec<Entity>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.* FROM entities e
                 LEFT JOIN memory_entities me ON me.entity_id = e.id
                 GROUP BY e.id
                 ORDER BY COUNT(me.memory_id) DESC, e.name
                 LIMIT ?1",
            )?;
            let entities = stmt
                .query_map(params![limit as i64], row_to_entity)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entities)
        })
    }

    /// Link a memory to an entity; repeated links keep the highest relevance.
    pub fn link_memory_entity(
        &self,
        memory_id: &str,
        entity_id: &str,
        relevance: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&relevance) {
            return Err(Error::InvalidInput(format!(
                "relevance {} outside [0,1]",
                relevance
            )));
        }
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO memory_entities (memory_id, entity_id, relevance)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(memory_id, entity_id)
                 DO UPDATE SET relevance = MAX(relevance, excluded.relevance)",
                params![memory_id, entity_id, relevance],
            )?;
            Ok(())
        })
    }

    /// Memories linked to an entity, strongest relevance first.
    pub fn memories_for_entity(&self, entity_id: &str, limit: usize) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT memory_id FROM memory_entities WHERE entity_id = ?1
                 ORDER BY relevance DESC LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![entity_id, limit as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    // ========================================================================
    // ENTITY RELATIONSHIPS
    // ========================================================================

    /// Add a (source, target, label) relationship. Duplicate triples are
    /// rejected silently.
    pub fn add_entity_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: &str,
        confidence: f64,
        memory_id: Option<&str>,
        context: Option<&str>,
    ) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO entity_relationships
                    (id, source_id, target_id, relationship, confidence, memory_id, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Ulid::new().to_string(),
                    source_id,
                    target_id,
                    relationship,
                    confidence.clamp(0.0, 1.0),
                    memory_id,
                    context,
                    now_str()
                ],
            )?;
            Ok(())
        })
    }

    /// Relationships touching an entity, either direction.
    pub fn relationships_for_entity(&self, entity_id: &str) -> Result<Vec<EntityRelationship>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM entity_relationships
                 WHERE source_id = ?1 OR target_id = ?1
                 ORDER BY confidence DESC",
            )?;
            let rels = stmt
                .query_map(params![entity_id], row_to_relationship)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rels)
        })
    }

    /// Names of entities related to the given one, strongest first. Used by
    /// query expansion.
    pub fn related_entity_names(&self, entity_id: &str, limit: usize) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.name FROM entity_relationships r
                 JOIN entities e ON e.id = CASE WHEN r.source_id = ?1 THEN r.target_id ELSE r.source_id END
                 WHERE r.source_id = ?1 OR r.target_id = ?1
                 ORDER BY r.confidence DESC
                 LIMIT ?2",
            )?;
            let names = stmt
                .query_map(params![entity_id, limit as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    // ========================================================================
    // MEMORY LINKS
    // ========================================================================

    /// Insert or update a directed memory link. A repeat of the same ordered
    /// pair upserts type and strength.
    pub fn upsert_memory_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
        strength: f64,
    ) -> Result<()> {
        if source_id == target_id {
            return Err(Error::InvalidInput("self-link rejected".to_string()));
        }
        if !(0.0..=1.0).contains(&strength) {
            return Err(Error::InvalidInput(format!(
                "strength {} outside [0,1]",
                strength
            )));
        }
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO memory_links (source_id, target_id, link_type, strength, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_id, target_id)
                 DO UPDATE SET link_type = excluded.link_type, strength = excluded.strength",
                params![source_id, target_id, link_type.as_str(), strength, now_str()],
            )?;
            Ok(())
        })
    }

    /// Links touching a memory; stored directed, queried symmetrically.
    pub fn links_for_memory(&self, memory_id: &str) -> Result<Vec<MemoryLink>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_id, target_id, link_type, strength, created_at
                 FROM memory_links
                 WHERE source_id = ?1 OR target_id = ?1
                 ORDER BY strength DESC",
            )?;
            let links = stmt
                .query_map(params![memory_id], |row| {
                    let link_type: String = row.get(2)?;
                    let created_at: String = row.get(4)?;
                    Ok(MemoryLink {
                        source_id: row.get(0)?,
                        target_id: row.get(1)?,
                        link_type: LinkType::parse_name(&link_type),
                        strength: row.get(3)?,
                        created_at: Store::parse_timestamp(&created_at, "created_at")?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(links)
        })
    }

    /// Merge outgoing and incoming neighbors of the seed set, excluding the
    /// seeds themselves, keeping the strongest reference per neighbor,
    /// strongest first.
    pub fn get_linked_refs(&self, seed_ids: &[String]) -> Result<Vec<LinkedRef>> {
        if seed_ids.is_empty() {
            return Ok(Vec::new());
        }

        self.with_reader(|conn| {
            let placeholders = vec!["?"; seed_ids.len()].join(", ");
            let sql = format!(
                "SELECT source_id, target_id, link_type, strength FROM memory_links
                 WHERE source_id IN ({ph}) OR target_id IN ({ph})",
                ph = placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
            for id in seed_ids {
                values.push(id);
            }
            for id in seed_ids {
                values.push(id);
            }

            let rows = stmt
                .query_map(values.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut best: std::collections::HashMap<String, LinkedRef> =
                std::collections::HashMap::new();
            for (source, target, link_type, strength) in rows {
                for neighbor in [source, target] {
                    if seed_ids.contains(&neighbor) {
                        continue;
                    }
                    let entry = best.entry(neighbor.clone()).or_insert(LinkedRef {
                        id: neighbor,
                        strength,
                        link_type: LinkType::parse_name(&link_type),
                    });
                    if strength > entry.strength {
                        entry.strength = strength;
                        entry.link_type = LinkType::parse_name(&link_type);
                    }
                }
            }

            let mut refs: Vec<LinkedRef> = best.into_values().collect();
            refs.sort_by(|a, b| {
                b.strength
                    .partial_cmp(&a.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(refs)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
