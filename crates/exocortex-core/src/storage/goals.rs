//! Goals: CRUD, progress memories, semantic auto-linking, and stall
//! detection.
//!
//! Progress entries are ordinary memories tagged `goal-progress` whose
//! `metadata.goal_id` points at the goal. Goal matching prefers cosine over
//! the goal embedding and falls back to keyword overlap.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

use crate::embeddings::{vector_from_bytes, vector_to_bytes};
use crate::error::{Error, Result};
use crate::scoring::cosine;
use crate::storage::{now_str, timestamp, Store};
use crate::types::{
    CreateGoalInput, CreateMemoryInput, Goal, GoalPriority, GoalStatus, Memory, MemorySource,
};

/// Tag on explicit progress entries.
pub const GOAL_PROGRESS_TAG: &str = "goal-progress";

/// Extra tag on auto-linked progress entries.
pub const GOAL_PROGRESS_IMPLICIT_TAG: &str = "goal-progress-implicit";

/// Minimum cosine for an embedding-based goal match.
const GOAL_MATCH_THRESHOLD: f32 = 0.4;

/// Stop words removed from goal titles before keyword matching.
const GOAL_STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "any", "as", "at", "be", "been", "before", "but",
    "by", "can", "could", "did", "do", "does", "for", "from", "get", "had", "has", "have", "how",
    "i", "if", "in", "into", "is", "it", "its", "just", "make", "more", "my", "new", "no", "not",
    "of", "on", "or", "our", "out", "over", "so", "some", "than", "that", "the", "their", "then",
    "there", "these", "they", "this", "to", "up", "us", "was", "we", "were", "what", "when",
    "which", "will", "with", "would", "you", "your",
];

fn row_to_goal(row: &rusqlite::Row) -> rusqlite::Result<Goal> {
    let status: String = row.get("status")?;
    let priority: String = row.get("priority")?;
    let metadata: String = row.get("metadata")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let deadline: Option<String> = row.get("deadline")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(Goal {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: GoalStatus::parse_name(&status),
        priority: GoalPriority::parse_name(&priority),
        deadline: deadline
            .map(|s| Store::parse_timestamp(&s, "deadline"))
            .transpose()?,
        metadata: serde_json::from_str(&metadata)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        embedding: embedding.and_then(|b| vector_from_bytes(&b)),
        created_at: Store::parse_timestamp(&created_at, "created_at")?,
        updated_at: Store::parse_timestamp(&updated_at, "updated_at")?,
        completed_at: completed_at
            .map(|s| Store::parse_timestamp(&s, "completed_at"))
            .transpose()?,
    })
}

/// Title content words with stop words removed, lowercased.
fn title_content_words(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2 && !GOAL_STOP_WORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Keyword fallback: at least half the goal title's content words appear in
/// the text.
fn keyword_match(goal: &Goal, content_lower: &str) -> bool {
    let words = title_content_words(&goal.title);
    if words.is_empty() {
        return false;
    }
    let hits = words.iter().filter(|w| content_lower.contains(w.as_str())).count();
    hits * 2 >= words.len()
}

/// Rank active goals against content. Embedding path when a vector is given,
/// keyword overlap otherwise.
pub(crate) fn detect_relevant_goals_on(
    conn: &Connection,
    content: &str,
    embedding: Option<&[f32]>,
) -> Result<Vec<(Goal, f32)>> {
    let mut stmt = conn.prepare("SELECT * FROM goals WHERE status = 'active'")?;
    let goals = stmt
        .query_map([], row_to_goal)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let content_lower = content.to_lowercase();
    let mut scored = Vec::new();

    for goal in goals {
        match (embedding, goal.embedding.as_deref()) {
            (Some(query_vec), Some(goal_vec)) => {
                let similarity = cosine(query_vec, goal_vec);
                if similarity >= GOAL_MATCH_THRESHOLD {
                    scored.push((goal, similarity));
                }
            }
            _ => {
                if keyword_match(&goal, &content_lower) {
                    scored.push((goal, 0.5));
                }
            }
        }
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}

/// Attach a freshly created memory to its best-matching active goal, if any.
/// Adds the progress tags and sets `metadata.goal_id`.
pub(crate) fn auto_link_progress(
    conn: &Connection,
    memory_id: &str,
    content: &str,
    embedding: Option<&[f32]>,
) -> Result<bool> {
    let metadata: String = conn.query_row(
        "SELECT metadata FROM memories WHERE id = ?1",
        params![memory_id],
        |row| row.get(0),
    )?;
    let mut metadata: serde_json::Value =
        serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Object(Default::default()));

    // An explicit goal linkage always wins over the implicit match.
    if metadata.get("goal_id").is_some() {
        return Ok(false);
    }

    let matches = detect_relevant_goals_on(conn, content, embedding)?;
    let Some((goal, _)) = matches.first() else {
        return Ok(false);
    };

    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("goal_id".to_string(), serde_json::json!(goal.id));
    }
    conn.execute(
        "UPDATE memories SET metadata = ?1 WHERE id = ?2",
        params![serde_json::to_string(&metadata)?, memory_id],
    )?;

    let start: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM memory_tags WHERE memory_id = ?1",
        params![memory_id],
        |row| row.get(0),
    )?;
    for (i, tag) in [GOAL_PROGRESS_TAG, GOAL_PROGRESS_IMPLICIT_TAG].iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO memory_tags (memory_id, tag, position) VALUES (?1, ?2, ?3)",
            params![memory_id, tag, start + i as i64],
        )?;
    }

    Ok(true)
}

impl Store {
    // ========================================================================
    // CRUD
    // ========================================================================

    pub fn create_goal(&self, input: CreateGoalInput) -> Result<Goal> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(Error::InvalidInput("goal title is empty".to_string()));
        }

        // Embed title plus description; absent provider leaves the goal on
        // the keyword path.
        let embed_text = match input.description {
            Some(ref d) => format!("{}\n{}", title, d),
            None => title.clone(),
        };
        let embedding = self.embed_text(&embed_text).ok();

        self.with_writer_tx(|conn| {
            let id = Ulid::new().to_string();
            let now = now_str();
            conn.execute(
                "INSERT INTO goals (id, title, description, status, priority, deadline, metadata,
                                    embedding, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    title,
                    input.description,
                    input.priority.as_str(),
                    input.deadline.map(timestamp),
                    serde_json::to_string(
                        &input
                            .metadata
                            .clone()
                            .unwrap_or(serde_json::Value::Object(Default::default()))
                    )?,
                    embedding.as_deref().map(vector_to_bytes),
                    now
                ],
            )?;
            conn.query_row("SELECT * FROM goals WHERE id = ?1", params![id], row_to_goal)
                .map_err(Error::from)
        })
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<Goal>> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row("SELECT * FROM goals WHERE id = ?1", params![id], row_to_goal)
                .optional()?)
        })
    }

    /// Goals by status, most recently updated first. None lists everything.
    pub fn list_goals(&self, status: Option<GoalStatus>) -> Result<Vec<Goal>> {
        self.with_reader(|conn| {
            let goals = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM goals WHERE status = ?1 ORDER BY updated_at DESC",
                    )?;
                    let rows = stmt
                        .query_map(params![status.as_str()], row_to_goal)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM goals ORDER BY updated_at DESC")?;
                    let rows = stmt
                        .query_map([], row_to_goal)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(goals)
        })
    }

    /// Change a goal's status; completing stamps `completed_at`.
    pub fn set_goal_status(&self, id: &str, status: GoalStatus) -> Result<Goal> {
        self.with_writer_tx(|conn| {
            let now = now_str();
            let completed_at = matches!(status, GoalStatus::Completed).then(|| now.clone());
            let changed = conn.execute(
                "UPDATE goals SET status = ?1, completed_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), completed_at, now, id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            conn.query_row("SELECT * FROM goals WHERE id = ?1", params![id], row_to_goal)
                .map_err(Error::from)
        })
    }

    /// Append a milestone title to `metadata.milestones`.
    pub fn add_goal_milestone(&self, id: &str, milestone: &str) -> Result<Goal> {
        let milestone = milestone.trim();
        if milestone.is_empty() {
            return Err(Error::InvalidInput("milestone is empty".to_string()));
        }
        self.with_writer_tx(|conn| {
            let goal = conn
                .query_row("SELECT * FROM goals WHERE id = ?1", params![id], row_to_goal)
                .optional()?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;

            let mut metadata = goal.metadata.clone();
            let obj = metadata
                .as_object_mut()
                .ok_or_else(|| Error::InvalidInput("goal metadata is not an object".to_string()))?;
            let milestones = obj
                .entry("milestones")
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(arr) = milestones.as_array_mut() {
                arr.push(serde_json::json!(milestone));
            }

            conn.execute(
                "UPDATE goals SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&metadata)?, now_str(), id],
            )?;
            conn.query_row("SELECT * FROM goals WHERE id = ?1", params![id], row_to_goal)
                .map_err(Error::from)
        })
    }

    pub fn delete_goal(&self, id: &str) -> Result<()> {
        self.with_writer(|conn| {
            let deleted = conn.execute("DELETE FROM goals WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    // ========================================================================
    // PROGRESS
    // ========================================================================

    /// Record explicit progress: a `goal-progress` memory pointing at the
    /// goal, and a touched `updated_at` on the goal.
    pub fn log_progress(&self, goal_id: &str, content: &str) -> Result<Memory> {
        let goal = self
            .get_goal(goal_id)?
            .ok_or_else(|| Error::NotFound(goal_id.to_string()))?;

        let result = self.create_memory(CreateMemoryInput {
            content: content.to_string(),
            source: MemorySource::Manual,
            tags: vec![GOAL_PROGRESS_TAG.to_string()],
            metadata: Some(serde_json::json!({ "goal_id": goal.id })),
            ..Default::default()
        })?;

        self.with_writer(|conn| {
            conn.execute(
                "UPDATE goals SET updated_at = ?1 WHERE id = ?2",
                params![now_str(), goal_id],
            )?;
            Ok(())
        })?;

        Ok(result.memory)
    }

    /// Rank active goals against free text. With an embedding the ranking is
    /// cosine-based; otherwise keyword overlap.
    pub fn detect_relevant_goals(
        &self,
        content: &str,
        embedding: Option<&[f32]>,
    ) -> Result<Vec<(Goal, f32)>> {
        self.with_reader(|conn| detect_relevant_goals_on(conn, content, embedding))
    }

    /// Progress memories for a goal, newest first.
    pub fn goal_progress(&self, goal_id: &str, limit: usize) -> Result<Vec<Memory>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.* FROM memories m
                 JOIN memory_tags t ON t.memory_id = m.id AND t.tag = ?1
                 WHERE json_extract(m.metadata, '$.goal_id') = ?2
                 ORDER BY m.created_at DESC LIMIT ?3",
            )?;
            let mut memories = stmt
                .query_map(
                    params![GOAL_PROGRESS_TAG, goal_id, limit as i64],
                    Store::row_to_memory,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for m in &mut memories {
                m.tags = Store::load_tags(conn, &m.id)?;
            }
            Ok(memories)
        })
    }

    /// Active goals with no progress memory inside the window.
    pub fn find_stalled_goals(&self, days: i64) -> Result<Vec<Goal>> {
        let cutoff = timestamp(Utc::now() - Duration::days(days.max(0)));
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.* FROM goals g
                 WHERE g.status = 'active'
                   AND NOT EXISTS (
                       SELECT 1 FROM memories m
                       JOIN memory_tags t ON t.memory_id = m.id AND t.tag = ?1
                       WHERE json_extract(m.metadata, '$.goal_id') = g.id
                         AND m.created_at >= ?2
                   )
                 ORDER BY g.updated_at ASC",
            )?;
            let goals = stmt
                .query_map(params![GOAL_PROGRESS_TAG, cutoff], row_to_goal)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(goals)
        })
    }
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

    #[test]
    fn test_goal_crud() {
        let store = store_with_provider();
        let goal = store
            .create_goal(CreateGoalInput {
                title: "Ship the retrieval pipeline rewrite".to_string(),
                description: Some("Hybrid ranking with fusion".to_string()),
                priority: GoalPriority::High,
                deadline: None,
                metadata: None,
            })
            .unwrap();

        assert_eq!(goal.status, GoalStatus::Active);
        assert!(goal.embedding.is_some());

        let fetched = store.get_goal(&goal.id).unwrap().unwrap();
        assert_eq!(fetched.title, goal.title);

        let completed = store.set_goal_status(&goal.id, GoalStatus::Completed).unwrap();
        assert_eq!(completed.status, GoalStatus::Completed);
        assert!(completed.completed_at.is_some());

        store.delete_goal(&goal.id).unwrap();
        assert!(store.get_goal(&goal.id).unwrap().is_none());
    }

    #[test]
    fn test_goal_requires_title() {
        let store = store_with_provider();
        assert!(matches!(
            store.create_goal(CreateGoalInput::new("  ")),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_log_progress_tags_and_touches() {
        let store = store_with_provider();
        let goal = store
            .create_goal(CreateGoalInput::new("Learn woodworking joinery"))
            .unwrap();

        let progress = store
            .log_progress(&goal.id, "Cut the first set of dovetails today")
            .unwrap();

        assert!(progress.tags.contains(&GOAL_PROGRESS_TAG.to_string()));
        assert_eq!(progress.metadata["goal_id"], goal.id);

        let entries = store.goal_progress(&goal.id, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, progress.id);

        let touched = store.get_goal(&goal.id).unwrap().unwrap();
        assert!(touched.updated_at >= goal.updated_at);
    }

    #[test]
    fn test_log_progress_unknown_goal() {
        let store = store_with_provider();
        assert!(matches!(
            store.log_progress("01ARZ3NDEKTSV4RRFFQ69G5FAV", "progress"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_detect_relevant_goals_by_embedding() {
        let store = store_with_provider();
        store
            .create_goal(CreateGoalInput::new(
                "Migrate billing database to PostgreSQL replica setup",
            ))
            .unwrap();
        store
            .create_goal(CreateGoalInput::new("Run a marathon in under four hours"))
            .unwrap();

        let content = "Finished the billing database migration dry run on the PostgreSQL replica";
        let embedding = store.embed_text(content).unwrap();
        let matches = store
            .detect_relevant_goals(content, Some(&embedding))
            .unwrap();

        assert!(!matches.is_empty());
        assert!(matches[0].0.title.contains("billing"));
    }

    #[test]
    fn test_detect_relevant_goals_keyword_fallback() {
        let store = Store::open_in_memory().unwrap(); // no provider
        store
            .create_goal(CreateGoalInput::new("Publish the gardening newsletter"))
            .unwrap();

        let matches = store
            .detect_relevant_goals(
                "Drafted two sections of the gardening newsletter this morning",
                None,
            )
            .unwrap();
        assert_eq!(matches.len(), 1);

        let no_match = store
            .detect_relevant_goals("Watched a film about submarines", None)
            .unwrap();
        assert!(no_match.is_empty());
    }

    #[test]
    fn test_auto_link_progress_on_create() {
        let store = store_with_provider();
        let goal = store
            .create_goal(CreateGoalInput::new(
                "Improve retrieval latency for the memory engine search",
            ))
            .unwrap();

        let created = store
            .create_memory(CreateMemoryInput::new(
                "Cut retrieval latency in half by caching query embeddings in the memory engine search path",
            ))
            .unwrap();

        let m = store.get_by_id(&created.memory.id).unwrap().unwrap();
        assert_eq!(m.metadata["goal_id"], goal.id);
        assert!(m.tags.contains(&GOAL_PROGRESS_TAG.to_string()));
        assert!(m.tags.contains(&GOAL_PROGRESS_IMPLICIT_TAG.to_string()));
    }

    #[test]
    fn test_find_stalled_goals() {
        let store = store_with_provider();
        let stalled = store
            .create_goal(CreateGoalInput::new("Organize the photo archive"))
            .unwrap();
        let active = store
            .create_goal(CreateGoalInput::new("Water the ficus"))
            .unwrap();
        store.log_progress(&active.id, "Watered the ficus").unwrap();

        let found = store.find_stalled_goals(7).unwrap();
        let ids: Vec<&str> = found.iter().map(|g| g.id.as_str()).collect();
        assert!(ids.contains(&stalled.id.as_str()));
        assert!(!ids.contains(&active.id.as_str()));
    }
}
