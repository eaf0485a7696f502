//! Schema bootstrap and additive migrations.
//!
//! Bootstrap is idempotent and applied once per process per backing file. It
//! creates missing tables, then migrates by inspecting the column catalog and
//! only ever ADDing columns; an existing column is never rewritten. The
//! lexical index is rebuilt when the `keywords` column is introduced on an
//! older store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Files already bootstrapped by this process.
static BOOTSTRAPPED: Mutex<Option<HashSet<PathBuf>>> = Mutex::new(None);

/// Reset the per-process bootstrap guard. Test hook.
pub fn reset_bootstrap_guard() {
    let mut guard = BOOTSTRAPPED.lock().unwrap_or_else(|e| e.into_inner());
    *guard = None;
}

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'text'
        CHECK (content_type IN ('text','conversation','note','summary')),
    source TEXT NOT NULL DEFAULT 'manual'
        CHECK (source IN ('manual','cli','api','mcp','browser','import','consolidation')),
    source_uri TEXT,
    embedding BLOB,
    importance REAL NOT NULL DEFAULT 0.5 CHECK (importance >= 0.0 AND importance <= 1.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    useful_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    parent_id TEXT REFERENCES memories(id) ON DELETE SET NULL,
    superseded_by TEXT REFERENCES memories(id) ON DELETE SET NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_metadata INTEGER NOT NULL DEFAULT 0,
    is_indexed INTEGER NOT NULL DEFAULT 1,
    chunk_index INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    keywords TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Hash dedup: at most one ACTIVE top-level row per normalized content.
-- Chunk children repeat their parent's text and stay out of the constraint.
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_active_hash
    ON memories(content_hash) WHERE is_active = 1 AND chunk_index IS NULL;

CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_active ON memories(is_active);
CREATE INDEX IF NOT EXISTS idx_memories_parent ON memories(parent_id);
CREATE INDEX IF NOT EXISTS idx_memories_superseded ON memories(superseded_by);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(content_type);

CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (memory_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag);

CREATE TABLE IF NOT EXISTS tag_aliases (
    alias TEXT PRIMARY KEY,
    canonical TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL DEFAULT 'concept'
        CHECK (entity_type IN ('person','project','technology','organization','concept')),
    aliases TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_name
    ON entities(name COLLATE NOCASE);

CREATE TABLE IF NOT EXISTS memory_entities (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relevance REAL NOT NULL DEFAULT 0.5 CHECK (relevance >= 0.0 AND relevance <= 1.0),
    PRIMARY KEY (memory_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);

CREATE TABLE IF NOT EXISTS entity_relationships (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    memory_id TEXT REFERENCES memories(id) ON DELETE SET NULL,
    context TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (source_id, target_id, relationship)
);

CREATE INDEX IF NOT EXISTS idx_entity_rel_source ON entity_relationships(source_id);
CREATE INDEX IF NOT EXISTS idx_entity_rel_target ON entity_relationships(target_id);

CREATE TABLE IF NOT EXISTS memory_links (
    source_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    link_type TEXT NOT NULL DEFAULT 'related'
        CHECK (link_type IN ('related','elaborates','contradicts','supersedes','supports','derived_from')),
    strength REAL NOT NULL DEFAULT 0.5 CHECK (strength >= 0.0 AND strength <= 1.0),
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id)
);

CREATE INDEX IF NOT EXISTS idx_memory_links_target ON memory_links(target_id);

CREATE TABLE IF NOT EXISTS consolidations (
    id TEXT PRIMARY KEY,
    summary_id TEXT NOT NULL,
    source_ids TEXT NOT NULL DEFAULT '[]',
    strategy TEXT NOT NULL,
    memories_merged INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contradictions (
    id TEXT PRIMARY KEY,
    memory_a_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    memory_b_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','resolved','dismissed')),
    resolution TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contradictions_status ON contradictions(status);

CREATE TABLE IF NOT EXISTS access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    query TEXT,
    accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_memory ON access_log(memory_id);
CREATE INDEX IF NOT EXISTS idx_access_log_time ON access_log(accessed_at);

CREATE TABLE IF NOT EXISTS co_retrievals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_hash TEXT NOT NULL,
    memory_ids TEXT NOT NULL DEFAULT '[]',
    retrieved_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_co_retrievals_time ON co_retrievals(retrieved_at);

CREATE TABLE IF NOT EXISTS search_misses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    filters TEXT NOT NULL DEFAULT '{}',
    best_score REAL,
    occurred_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS goals (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active','completed','stalled','abandoned')),
    priority TEXT NOT NULL DEFAULT 'medium'
        CHECK (priority IN ('low','medium','high','critical')),
    deadline TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_goals_status ON goals(status);

CREATE TABLE IF NOT EXISTS regression_baselines (
    query_key TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    result_ids TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS regression_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    query_key TEXT NOT NULL,
    query TEXT NOT NULL,
    current_ids TEXT NOT NULL DEFAULT '[]',
    overlap REAL NOT NULL,
    avg_rank_shift REAL NOT NULL,
    exact_order INTEGER NOT NULL,
    alert INTEGER NOT NULL,
    initialized INTEGER NOT NULL,
    ran_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_regression_runs_run ON regression_runs(run_id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id, content, keywords,
    content='memories',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories
WHEN NEW.is_indexed = 1 BEGIN
    INSERT INTO memories_fts(rowid, id, content, keywords)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.keywords);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories
WHEN OLD.is_indexed = 1 BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content, keywords)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.keywords);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au_del AFTER UPDATE ON memories
WHEN OLD.is_indexed = 1 BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content, keywords)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.keywords);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au_ins AFTER UPDATE ON memories
WHEN NEW.is_indexed = 1 BEGIN
    INSERT INTO memories_fts(rowid, id, content, keywords)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.keywords);
END;
"#;

/// Columns added after the initial schema shipped. Migration is additive
/// only: a missing column is ADDed, never rewritten.
const MEMORY_COLUMNS: &[(&str, &str)] = &[
    ("source_uri", "ALTER TABLE memories ADD COLUMN source_uri TEXT"),
    (
        "useful_count",
        "ALTER TABLE memories ADD COLUMN useful_count INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "superseded_by",
        "ALTER TABLE memories ADD COLUMN superseded_by TEXT REFERENCES memories(id) ON DELETE SET NULL",
    ),
    (
        "is_metadata",
        "ALTER TABLE memories ADD COLUMN is_metadata INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "is_indexed",
        "ALTER TABLE memories ADD COLUMN is_indexed INTEGER NOT NULL DEFAULT 1",
    ),
    ("chunk_index", "ALTER TABLE memories ADD COLUMN chunk_index INTEGER"),
    (
        "keywords",
        "ALTER TABLE memories ADD COLUMN keywords TEXT NOT NULL DEFAULT ''",
    ),
];

/// Bootstrap the schema on `conn`, once per process per `path`.
pub fn bootstrap(conn: &Connection, path: &Path) -> Result<()> {
    {
        let mut guard = BOOTSTRAPPED.lock().unwrap_or_else(|e| e.into_inner());
        let seen = guard.get_or_insert_with(HashSet::new);
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !seen.insert(canonical) {
            return Ok(());
        }
    }

    conn.execute_batch(BASE_SCHEMA)
        .map_err(|e| Error::SchemaCorrupt(format!("base schema: {}", e)))?;

    let added = migrate_columns(conn)?;

    conn.execute_batch(FTS_SCHEMA)
        .map_err(|e| Error::SchemaCorrupt(format!("lexical index: {}", e)))?;

    // An older store gaining the keywords column needs its lexical index
    // rebuilt so existing rows carry the new column.
    if added.iter().any(|c| c == "keywords") {
        rebuild_fts(conn)?;
    }

    super::settings::insert_defaults(conn)?;

    Ok(())
}

/// Inspect the column catalog and add any missing columns. Returns the names
/// of the columns added.
fn migrate_columns(conn: &Connection) -> Result<Vec<String>> {
    let existing = table_columns(conn, "memories")?;
    let mut added = Vec::new();

    for (name, ddl) in MEMORY_COLUMNS {
        if !existing.contains(*name) {
            tracing::info!("adding column memories.{}", name);
            conn.execute(ddl, [])?;
            added.push((*name).to_string());
        }
    }

    Ok(added)
}

/// Read a table's column names from the catalog. The only path that may
/// produce `SchemaCorrupt`.
pub fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(|e| Error::SchemaCorrupt(format!("catalog unreadable: {}", e)))?;

    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| Error::SchemaCorrupt(format!("catalog unreadable: {}", e)))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(columns)
}

/// Drop and repopulate the lexical index from indexed rows.
pub fn rebuild_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TRIGGER IF EXISTS memories_fts_ai;
        DROP TRIGGER IF EXISTS memories_fts_ad;
        DROP TRIGGER IF EXISTS memories_fts_au_del;
        DROP TRIGGER IF EXISTS memories_fts_au_ins;
        DROP TABLE IF EXISTS memories_fts;
        "#,
    )?;
    conn.execute_batch(FTS_SCHEMA)?;
    conn.execute(
        "INSERT INTO memories_fts(rowid, id, content, keywords)
         SELECT rowid, id, content, keywords FROM memories WHERE is_indexed = 1",
        [],
    )?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_bootstrap_creates_tables() {
        let conn = fresh_conn();
        conn.execute_batch(BASE_SCHEMA).unwrap();
        conn.execute_batch(FTS_SCHEMA).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='memories'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let conn = fresh_conn();
        conn.execute_batch(BASE_SCHEMA).unwrap();
        conn.execute_batch(FTS_SCHEMA).unwrap();
        conn.execute_batch(BASE_SCHEMA).unwrap();
        conn.execute_batch(FTS_SCHEMA).unwrap();
    }

    #[test]
    fn test_additive_migration_adds_missing_columns() {
        let conn = fresh_conn();
        // An old store without the later columns
        conn.execute_batch(
            "CREATE TABLE memories (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'text',
                source TEXT NOT NULL DEFAULT 'manual',
                embedding BLOB,
                importance REAL NOT NULL DEFAULT 0.5,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at TEXT,
                parent_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                metadata TEXT NOT NULL DEFAULT '{}',
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .unwrap();

        let added = migrate_columns(&conn).unwrap();
        assert!(added.contains(&"keywords".to_string()));
        assert!(added.contains(&"superseded_by".to_string()));

        let columns = table_columns(&conn, "memories").unwrap();
        assert!(columns.contains("keywords"));
        assert!(columns.contains("is_indexed"));
        assert!(columns.contains("useful_count"));

        // Re-running adds nothing
        assert!(migrate_columns(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_unindexed_rows_stay_out_of_fts() {
        let conn = fresh_conn();
        conn.execute_batch(BASE_SCHEMA).unwrap();
        conn.execute_batch(FTS_SCHEMA).unwrap();

        conn.execute(
            "INSERT INTO memories (id, content, keywords, content_hash, is_indexed, created_at, updated_at)
             VALUES ('m1', 'visible words here', 'visible words', 'h1', 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memories (id, content, keywords, content_hash, is_indexed, created_at, updated_at)
             VALUES ('m2', 'hidden benchmark artifact', 'hidden benchmark', 'h2', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'hidden'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'visible'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_active_hash_uniqueness() {
        let conn = fresh_conn();
        conn.execute_batch(BASE_SCHEMA).unwrap();

        conn.execute(
            "INSERT INTO memories (id, content, content_hash, created_at, updated_at)
             VALUES ('m1', 'abc', 'same-hash', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO memories (id, content, content_hash, created_at, updated_at)
             VALUES ('m2', 'abc', 'same-hash', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(dup.is_err());

        // Inactive rows do not participate in the uniqueness constraint
        conn.execute(
            "INSERT INTO memories (id, content, content_hash, is_active, created_at, updated_at)
             VALUES ('m3', 'abc', 'same-hash', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    }
}
