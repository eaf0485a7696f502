//! Versioned export/import and the encrypted container.
//!
//! The export document is plain JSON; import upserts by primary key, so
//! re-importing the same document is a no-op. The encrypted container is
//! `[salt(16) | nonce(12) | tag(16) | ciphertext]` under AES-256-GCM with a
//! PBKDF2-HMAC-SHA256 derived key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;

use crate::embeddings::vector_to_bytes;
use crate::error::{Error, Result};
use crate::storage::{timestamp, Store};
use crate::types::{Entity, Goal, LinkType, Memory, MemoryLink};

/// Export document format version.
pub const EXPORT_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntityRow {
    pub memory_id: String,
    pub entity_id: String,
    pub relevance: f64,
}

/// The versioned export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub memories: Vec<Memory>,
    pub entities: Vec<Entity>,
    pub memory_entities: Vec<MemoryEntityRow>,
    pub memory_links: Vec<MemoryLink>,
    pub goals: Vec<Goal>,
    pub settings: HashMap<String, String>,
}

/// Snapshot the whole store into an export document.
pub fn export(store: &Store) -> Result<ExportDocument> {
    let memories = store.with_reader(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM memories ORDER BY id")?;
        let mut memories = stmt
            .query_map([], Store::row_to_memory)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for m in &mut memories {
            m.tags = Store::load_tags(conn, &m.id)?;
        }
        Ok(memories)
    })?;

    let entities = store.list_entities(1_000_000)?;

    let memory_entities = store.with_reader(|conn| {
        let mut stmt =
            conn.prepare("SELECT memory_id, entity_id, relevance FROM memory_entities")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MemoryEntityRow {
                    memory_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    relevance: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let memory_links = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, link_type, strength, created_at FROM memory_links",
        )?;
        let rows = stmt
            .query_map([], |row| {
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
        Ok(rows)
    })?;

    let goals = store.list_goals(None)?;
    let settings = store.all_settings()?;

    Ok(ExportDocument {
        version: EXPORT_VERSION,
        exported_at: Utc::now(),
        memories,
        entities,
        memory_entities,
        memory_links,
        goals,
        settings,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub memories: usize,
    pub entities: usize,
    pub memory_entities: usize,
    pub memory_links: usize,
    pub goals: usize,
    pub settings: usize,
}

/// Import a document by primary-key upsert. Idempotent: importing the same
/// document twice leaves the store unchanged.
pub fn import(store: &Store, doc: &ExportDocument) -> Result<ImportReport> {
    if doc.version != EXPORT_VERSION {
        return Err(Error::InvalidInput(format!(
            "unsupported export version {}",
            doc.version
        )));
    }

    store.with_writer_tx(|conn| {
        // Rows arrive in arbitrary order relative to their parent_id /
        // superseded_by targets; defer FK checks to commit.
        conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

        let mut report = ImportReport::default();

        for m in &doc.memories {
            // ON CONFLICT DO UPDATE (not OR REPLACE): the implicit delete of
            // a REPLACE bypasses the FTS sync triggers.
            conn.execute(
                "INSERT INTO memories (
                    id, content, content_type, source, source_uri, embedding,
                    importance, access_count, useful_count, last_accessed_at,
                    parent_id, superseded_by, is_active, is_metadata, is_indexed,
                    chunk_index, metadata, keywords, content_hash, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                          ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                 ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    content_type = excluded.content_type,
                    source = excluded.source,
                    source_uri = excluded.source_uri,
                    embedding = excluded.embedding,
                    importance = excluded.importance,
                    access_count = excluded.access_count,
                    useful_count = excluded.useful_count,
                    last_accessed_at = excluded.last_accessed_at,
                    parent_id = excluded.parent_id,
                    superseded_by = excluded.superseded_by,
                    is_active = excluded.is_active,
                    is_metadata = excluded.is_metadata,
                    is_indexed = excluded.is_indexed,
                    chunk_index = excluded.chunk_index,
                    metadata = excluded.metadata,
                    keywords = excluded.keywords,
                    content_hash = excluded.content_hash,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    m.id,
                    m.content,
                    m.content_type.as_str(),
                    m.source.as_str(),
                    m.source_uri,
                    m.embedding.as_deref().map(vector_to_bytes),
                    m.importance,
                    m.access_count,
                    m.useful_count,
                    m.last_accessed_at.map(timestamp),
                    m.parent_id,
                    m.superseded_by,
                    m.is_active as i64,
                    m.is_metadata as i64,
                    m.is_indexed as i64,
                    m.chunk_index,
                    serde_json::to_string(&m.metadata)?,
                    m.keywords,
                    m.content_hash,
                    timestamp(m.created_at),
                    timestamp(m.updated_at),
                ],
            )?;
            conn.execute("DELETE FROM memory_tags WHERE memory_id = ?1", params![m.id])?;
            for (position, tag) in m.tags.iter().enumerate() {
                conn.execute(
                    "INSERT OR IGNORE INTO memory_tags (memory_id, tag, position)
                     VALUES (?1, ?2, ?3)",
                    params![m.id, tag, position as i64],
                )?;
            }
            report.memories += 1;
        }

        for e in &doc.entities {
            // Same REPLACE hazard as memories: the implicit delete would
            // cascade away entity_relationships rows, which the document
            // does not carry.
            conn.execute(
                "INSERT INTO entities
                    (id, name, entity_type, aliases, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = ?2,
                    entity_type = ?3,
                    aliases = ?4,
                    metadata = ?5,
                    updated_at = ?7",
                params![
                    e.id,
                    e.name,
                    e.entity_type.as_str(),
                    serde_json::to_string(&e.aliases)?,
                    serde_json::to_string(&e.metadata)?,
                    timestamp(e.created_at),
                    timestamp(e.updated_at),
                ],
            )?;
            report.entities += 1;
        }

        for link in &doc.memory_entities {
            conn.execute(
                "INSERT OR REPLACE INTO memory_entities (memory_id, entity_id, relevance)
                 VALUES (?1, ?2, ?3)",
                params![link.memory_id, link.entity_id, link.relevance],
            )?;
            report.memory_entities += 1;
        }

        for link in &doc.memory_links {
            conn.execute(
                "INSERT OR REPLACE INTO memory_links
                    (source_id, target_id, link_type, strength, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    link.source_id,
                    link.target_id,
                    link.link_type.as_str(),
                    link.strength,
                    timestamp(link.created_at),
                ],
            )?;
            report.memory_links += 1;
        }

        for g in &doc.goals {
            conn.execute(
                "INSERT OR REPLACE INTO goals
                    (id, title, description, status, priority, deadline, metadata,
                     embedding, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    g.id,
                    g.title,
                    g.description,
                    g.status.as_str(),
                    g.priority.as_str(),
                    g.deadline.map(timestamp),
                    serde_json::to_string(&g.metadata)?,
                    g.embedding.as_deref().map(vector_to_bytes),
                    timestamp(g.created_at),
                    timestamp(g.updated_at),
                    g.completed_at.map(timestamp),
                ],
            )?;
            report.goals += 1;
        }

        for (key, value) in &doc.settings {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            report.settings += 1;
        }

        Ok(report)
    })
}

// ============================================================================
// ENCRYPTED CONTAINER
// ============================================================================

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt bytes with a password: `[salt | nonce | tag | ciphertext]`.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| Error::InvalidInput("bad key length".to_string()))?;

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::InvalidInput("encryption failed".to_string()))?;

    // AES-GCM appends the tag; the container stores it up front.
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + TAG_LEN + body.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decrypt a `[salt | nonce | tag | ciphertext]` container. Wrong password
/// or tampering fails with `DecryptionFailed`.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(Error::DecryptionFailed);
    }

    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce, rest) = rest.split_at(NONCE_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::DecryptionFailed)?;

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
        .map_err(|_| Error::DecryptionFailed)
}

/// Export the store as an encrypted container.
pub fn export_encrypted(store: &Store, password: &str) -> Result<Vec<u8>> {
    let doc = export(store)?;
    let json = serde_json::to_vec(&doc)?;
    encrypt(&json, password)
}

/// Import from an encrypted container.
pub fn import_encrypted(store: &Store, data: &[u8], password: &str) -> Result<ImportReport> {
    let json = decrypt(data, password)?;
    let doc: ExportDocument =
        serde_json::from_slice(&json).map_err(|e| Error::InvalidInput(format!("bad export: {}", e)))?;
    import(store, &doc)
}

// ============================================================================
// TESTS
// ============================================================================
