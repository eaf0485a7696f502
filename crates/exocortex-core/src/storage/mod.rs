//! SQLite-backed store.
//!
//! One process owns the backing file. Reads and writes go through separate
//! connections behind mutexes, so `Store` is `Send + Sync` and callers can
//! share an `Arc<Store>`. Contention against other processes is absorbed by
//! a 1 s busy retry; a second failure surfaces as `Transient`.

pub mod entities;
pub mod goals;
pub mod memories;
pub mod schema;
pub mod settings;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::embeddings::{self, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::types::{ContentType, Memory, MemorySource, StoreStats};

pub use settings::{IngestSettings, ScoringSettings};

/// Writes between light maintenance passes.
const LIGHT_PASS_EVERY: u64 = 50;

static MEM_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The engine's backing store.
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    /// Store-local provider override; falls back to the process-wide
    /// registration when unset.
    embedder: RwLock<Option<Arc<dyn EmbeddingProvider>>>,
    /// LRU cache for query embeddings
    pub(crate) query_cache: Mutex<LruCache<String, Vec<f32>>>,
    write_counter: AtomicU64,
    /// Suppresses the every-N-writes light pass (used by jobs and imports)
    pub(crate) light_pass_enabled: std::sync::atomic::AtomicBool,
}

impl Store {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -32000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 1000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at `path`. When `path` is None the
    /// `EXOCORTEX_DB_PATH` environment variable is consulted, then the
    /// platform data directory.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => default_db_path()?,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer)?;
        schema::bootstrap(&writer, &path)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Self::from_connections(path, writer, reader))
    }

    /// Open an in-memory store (shared-cache, so reader and writer see the
    /// same database). Used by tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self> {
        let name = format!(
            "file:exocortex_mem_{}?mode=memory&cache=shared",
            MEM_DB_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let writer = Connection::open_with_flags(&name, flags)?;
        writer.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::bootstrap(&writer, Path::new(&name))?;

        let reader = Connection::open_with_flags(&name, flags)?;
        reader.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self::from_connections(PathBuf::from(&name), writer, reader))
    }

    fn from_connections(path: PathBuf, writer: Connection, reader: Connection) -> Self {
        Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            embedder: RwLock::new(None),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("100 is non-zero"),
            )),
            write_counter: AtomicU64::new(0),
            light_pass_enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // CONNECTION DISCIPLINE
    // ========================================================================

    /// Run a read closure against the reader connection. Low-level escape
    /// hatch for tooling and tests; prefer the typed methods.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| Error::SchemaCorrupt("reader lock poisoned".to_string()))?;
        f(&conn)
    }

    /// Run a write closure, retrying once after 1 s on store contention.
    /// Low-level escape hatch; the closure may run twice, so it must be
    /// idempotent.
    pub fn with_writer<T>(&self, f: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| Error::SchemaCorrupt("writer lock poisoned".to_string()))?;

        match f(&conn) {
            Err(e) if is_busy(&e) => {
                tracing::warn!("store busy, retrying once: {}", e);
                std::thread::sleep(Duration::from_secs(1));
                f(&conn).map_err(|e| {
                    if is_busy(&e) {
                        Error::Transient(format!("store still busy after retry: {}", e))
                    } else {
                        e
                    }
                })
            }
            other => other,
        }
    }

    /// Run a write closure inside a single transaction. Rolls back on error.
    pub(crate) fn with_writer_tx<T>(&self, f: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        self.with_writer(|conn| {
            let tx = conn.unchecked_transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    // ========================================================================
    // EMBEDDING RESOLUTION
    // ========================================================================

    /// Install a store-local embedding provider and persist its negotiated
    /// dimension.
    pub fn set_embedding_provider(&self, provider: Arc<dyn EmbeddingProvider>) {
        let dims = provider.dimensions();
        {
            let mut slot = self.embedder.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(provider);
        }
        let _ = self.set_setting("embedding.dimensions", &dims.to_string());
    }

    pub(crate) fn resolve_embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        let local = self
            .embedder
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        local.or_else(embeddings::provider)
    }

    /// Embed text via the resolved provider; typed error when unavailable.
    pub(crate) fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        match self.resolve_embedder() {
            Some(p) => p.embed(text),
            None => Err(Error::ProviderUnavailable(
                "no embedding provider registered".to_string(),
            )),
        }
    }

    // ========================================================================
    // TAG NORMALIZATION
    // ========================================================================

    /// Register a tag alias; future tag writes of `alias` normalize to
    /// `canonical`.
    pub fn set_tag_alias(&self, alias: &str, canonical: &str) -> Result<()> {
        let alias = alias.trim().to_lowercase();
        let canonical = canonical.trim().to_lowercase();
        if alias.is_empty() || canonical.is_empty() {
            return Err(Error::InvalidInput("empty tag alias".to_string()));
        }
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO tag_aliases (alias, canonical) VALUES (?1, ?2)
                 ON CONFLICT(alias) DO UPDATE SET canonical = excluded.canonical",
                params![alias, canonical],
            )?;
            Ok(())
        })
    }

    /// Lowercase, trim, alias-map, and dedupe tags preserving order.
    pub(crate) fn normalize_tags(conn: &Connection, tags: &[String]) -> Result<Vec<String>> {
        let aliases: HashMap<String, String> = {
            let mut stmt = conn.prepare("SELECT alias, canonical FROM tag_aliases")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };

        let mut out = Vec::new();
        for tag in tags {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() {
                continue;
            }
            let tag = aliases.get(&tag).cloned().unwrap_or(tag);
            if !out.contains(&tag) {
                out.push(tag);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // WRITE COUNTER
    // ========================================================================

    /// Count a write; every `LIGHT_PASS_EVERY` writes runs the light
    /// maintenance pass. Errors are logged, never surfaced.
    pub(crate) fn note_write(&self) {
        let count = self.write_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count % LIGHT_PASS_EVERY == 0 && self.light_pass_enabled.load(Ordering::SeqCst) {
            tracing::debug!("write #{} triggering light maintenance pass", count);
            if let Err(e) = crate::maintenance::light_pass(self) {
                tracing::warn!("light maintenance pass failed: {}", e);
            }
        }
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Aggregate counts over the store.
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_reader(|conn| {
            let count = |sql: &str| -> Result<i64> {
                Ok(conn.query_row(sql, [], |row| row.get(0))?)
            };

            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;

            Ok(StoreStats {
                total_memories: count("SELECT COUNT(*) FROM memories")?,
                active_memories: count("SELECT COUNT(*) FROM memories WHERE is_active = 1")?,
                archived_memories: count("SELECT COUNT(*) FROM memories WHERE is_active = 0")?,
                memories_with_embeddings: count(
                    "SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL",
                )?,
                total_entities: count("SELECT COUNT(*) FROM entities")?,
                total_memory_links: count("SELECT COUNT(*) FROM memory_links")?,
                total_goals: count("SELECT COUNT(*) FROM goals")?,
                active_goals: count("SELECT COUNT(*) FROM goals WHERE status = 'active'")?,
                pending_contradictions: count(
                    "SELECT COUNT(*) FROM contradictions WHERE status = 'pending'",
                )?,
                total_accesses: count("SELECT COUNT(*) FROM access_log")?,
                db_size_bytes: page_count * page_size,
            })
        })
    }

    // ========================================================================
    // ROW MAPPING
    // ========================================================================

    pub(crate) fn parse_timestamp(value: &str, field: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid {} timestamp '{}': {}", field, value, e),
                    )),
                )
            })
    }

    /// Map a `SELECT * FROM memories` row; tags are loaded separately.
    pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let last_accessed_at: Option<String> = row.get("last_accessed_at")?;

        let content_type: String = row.get("content_type")?;
        let source: String = row.get("source")?;
        let metadata: String = row.get("metadata")?;
        let embedding: Option<Vec<u8>> = row.get("embedding")?;

        Ok(Memory {
            id: row.get("id")?,
            content: row.get("content")?,
            content_type: ContentType::parse_name(&content_type),
            source: MemorySource::parse_name(&source),
            source_uri: row.get("source_uri")?,
            embedding: embedding.and_then(|b| crate::embeddings::vector_from_bytes(&b)),
            importance: row.get("importance")?,
            access_count: row.get("access_count")?,
            useful_count: row.get("useful_count")?,
            last_accessed_at: last_accessed_at
                .map(|s| Self::parse_timestamp(&s, "last_accessed_at"))
                .transpose()?,
            parent_id: row.get("parent_id")?,
            superseded_by: row.get("superseded_by")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            is_metadata: row.get::<_, i64>("is_metadata")? != 0,
            is_indexed: row.get::<_, i64>("is_indexed")? != 0,
            chunk_index: row.get("chunk_index")?,
            metadata: serde_json::from_str(&metadata)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            keywords: row.get("keywords")?,
            content_hash: row.get("content_hash")?,
            created_at: Self::parse_timestamp(&created_at, "created_at")?,
            updated_at: Self::parse_timestamp(&updated_at, "updated_at")?,
            tags: Vec::new(),
        })
    }

    pub(crate) fn load_tags(conn: &Connection, memory_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT tag FROM memory_tags WHERE memory_id = ?1 ORDER BY position, tag",
        )?;
        let tags = stmt
            .query_map(params![memory_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(tags)
    }

    pub(crate) fn read_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
        let memory = conn
            .query_row(
                "SELECT * FROM memories WHERE id = ?1",
                params![id],
                Self::row_to_memory,
            )
            .optional()?;

        match memory {
            Some(mut m) => {
                m.tags = Self::load_tags(conn, id)?;
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }
}

/// Canonical RFC 3339 timestamp with fixed microsecond width, so the TEXT
/// column sorts chronologically.
pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn now_str() -> String {
    timestamp(Utc::now())
}

fn is_busy(err: &Error) -> bool {
    match err {
        Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Default location of the backing file: `EXOCORTEX_DB_PATH`, else the
/// platform data directory.
pub fn default_db_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("EXOCORTEX_DB_PATH") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let proj_dirs = directories::ProjectDirs::from("com", "exocortex", "exocortex")
        .ok_or_else(|| Error::SchemaCorrupt("could not determine data directory".to_string()))?;
    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        let _ = std::fs::set_permissions(data_dir, perms);
    }

    Ok(data_dir.join("exocortex.db"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_bootstraps() {
        let store = Store::open_in_memory().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.total_goals, 0);
    }

    #[test]
    fn test_open_on_disk_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        {
            let store = Store::open(Some(path.clone())).unwrap();
            store.set_setting("scoring.rrf_k", "99").unwrap();
        }

        let store = Store::open(Some(path)).unwrap();
        assert_eq!(store.setting("scoring.rrf_k").unwrap().as_deref(), Some("99"));
    }

    #[test]
    fn test_normalize_tags_lowercases_and_dedupes() {
        let store = Store::open_in_memory().unwrap();
        store.set_tag_alias("k8s", "kubernetes").unwrap();

        store
            .with_reader(|conn| {
                let tags = Store::normalize_tags(
                    conn,
                    &[
                        " Rust ".to_string(),
                        "rust".to_string(),
                        "K8S".to_string(),
                        "".to_string(),
                    ],
                )?;
                assert_eq!(tags, vec!["rust".to_string(), "kubernetes".to_string()]);
                Ok(())
            })
            .unwrap();
    }
}
