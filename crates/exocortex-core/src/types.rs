//! Core data model: memories, entities, links, goals, and the input/result
//! types exchanged with callers.
//!
//! All identifiers are opaque, lexically sortable, time-prefixed strings
//! (ULIDs). Timestamps are UTC and serialized as RFC 3339 text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ENUMS
// ============================================================================

/// What kind of text a memory holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Free-form text
    #[default]
    Text,
    /// A conversation transcript or excerpt
    Conversation,
    /// A short note
    Note,
    /// A summary produced by consolidation
    Summary,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Conversation => "conversation",
            ContentType::Note => "note",
            ContentType::Summary => "summary",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "conversation" => ContentType::Conversation,
            "note" => ContentType::Note,
            "summary" => ContentType::Summary,
            _ => ContentType::Text,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    #[default]
    Manual,
    Cli,
    Api,
    Mcp,
    Browser,
    Import,
    /// Produced by the consolidation job
    Consolidation,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Manual => "manual",
            MemorySource::Cli => "cli",
            MemorySource::Api => "api",
            MemorySource::Mcp => "mcp",
            MemorySource::Browser => "browser",
            MemorySource::Import => "import",
            MemorySource::Consolidation => "consolidation",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "cli" => MemorySource::Cli,
            "api" => MemorySource::Api,
            "mcp" => MemorySource::Mcp,
            "browser" => MemorySource::Browser,
            "import" => MemorySource::Import,
            "consolidation" => MemorySource::Consolidation,
            _ => MemorySource::Manual,
        }
    }
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Edge label on a directed memory-to-memory link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Related,
    Elaborates,
    Contradicts,
    Supersedes,
    Supports,
    DerivedFrom,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Related => "related",
            LinkType::Elaborates => "elaborates",
            LinkType::Contradicts => "contradicts",
            LinkType::Supersedes => "supersedes",
            LinkType::Supports => "supports",
            LinkType::DerivedFrom => "derived_from",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "elaborates" => LinkType::Elaborates,
            "contradicts" => LinkType::Contradicts,
            "supersedes" => LinkType::Supersedes,
            "supports" => LinkType::Supports,
            "derived_from" => LinkType::DerivedFrom,
            _ => LinkType::Related,
        }
    }
}

/// Entity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Project,
    Technology,
    Organization,
    #[default]
    Concept,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Project => "project",
            EntityType::Technology => "technology",
            EntityType::Organization => "organization",
            EntityType::Concept => "concept",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" => EntityType::Person,
            "project" => EntityType::Project,
            "technology" => EntityType::Technology,
            "organization" => EntityType::Organization,
            _ => EntityType::Concept,
        }
    }
}

/// Goal lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    #[default]
    Active,
    Completed,
    Stalled,
    Abandoned,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
            GoalStatus::Stalled => "stalled",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "completed" => GoalStatus::Completed,
            "stalled" => GoalStatus::Stalled,
            "abandoned" => GoalStatus::Abandoned,
            _ => GoalStatus::Active,
        }
    }
}

/// Goal priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl GoalPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalPriority::Low => "low",
            GoalPriority::Medium => "medium",
            GoalPriority::High => "high",
            GoalPriority::Critical => "critical",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => GoalPriority::Low,
            "high" => GoalPriority::High,
            "critical" => GoalPriority::Critical,
            _ => GoalPriority::Medium,
        }
    }
}

/// Contradiction triage state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContradictionStatus {
    #[default]
    Pending,
    Resolved,
    Dismissed,
}

impl ContradictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContradictionStatus::Pending => "pending",
            ContradictionStatus::Resolved => "resolved",
            ContradictionStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "resolved" => ContradictionStatus::Resolved,
            "dismissed" => ContradictionStatus::Dismissed,
            _ => ContradictionStatus::Pending,
        }
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// A stored unit of textual knowledge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub content_type: ContentType,
    pub source: MemorySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Unit-normalized embedding, absent when the provider was unavailable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Salience in [0,1]; 1.0 means pinned (exempt from automated changes)
    pub importance: f64,
    pub access_count: i64,
    pub useful_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Weak reference to the summary that subsumed this memory, or to the
    /// parent row of a chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Weak reference to the newer memory that replaced this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub is_active: bool,
    /// Benchmark/system artifact flag; excluded from default retrieval
    pub is_metadata: bool,
    /// Whether this row participates in the lexical index
    pub is_indexed: bool,
    /// Position within a chunked parent; only set when `parent_id` is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<i64>,
    /// Free-form key-value metadata
    pub metadata: serde_json::Value,
    /// Derived lexical keyword string
    pub keywords: String,
    /// SHA-256 of normalized content
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Lowercased, alias-normalized, unique, in insertion order
    pub tags: Vec<String>,
}

/// Input for creating a memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateMemoryInput {
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub source: MemorySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// System artifact flag
    #[serde(default)]
    pub is_metadata: bool,
    /// Benchmark artifact: low importance, unindexed, no embedding
    #[serde(default)]
    pub benchmark: bool,
}

impl Default for CreateMemoryInput {
    fn default() -> Self {
        Self {
            content: String::new(),
            content_type: ContentType::Text,
            source: MemorySource::Manual,
            source_uri: None,
            importance: None,
            parent_id: None,
            tags: vec![],
            metadata: None,
            is_metadata: false,
            benchmark: false,
        }
    }
}

impl CreateMemoryInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Outcome of a create, including any dedup decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemoryResult {
    pub memory: Memory,
    /// "skipped" when hash dedup returned an existing row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_action: Option<String>,
    /// Id of the older memory this create superseded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_id: Option<String>,
    /// Cosine similarity that triggered the supersede
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_similarity: Option<f32>,
    /// Number of chunk children created, when the content was chunked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
}

/// Patch for updating a memory; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateMemoryInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Merged key-by-key into the existing metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// SEARCH
// ============================================================================

/// A ranked retrieval query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<MemorySource>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Only memories created after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
    /// Only memories created before this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_importance: Option<f64>,
    /// Overrides the configured admission threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    /// Include benchmark/system artifacts
    #[serde(default)]
    pub include_metadata: bool,
    /// Truncate returned content for terse surfaces
    #[serde(default)]
    pub compact: bool,
}

fn default_search_limit() -> usize {
    20
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: 20,
            offset: 0,
            content_type: None,
            source: None,
            tags: vec![],
            after: None,
            before: None,
            min_importance: None,
            min_score: None,
            include_metadata: false,
            compact: false,
        }
    }
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Per-signal score components behind a fused result
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub vector: f64,
    pub fts: f64,
    pub recency: f64,
    pub frequency: f64,
    pub usefulness: f64,
    pub graph: f64,
}

/// One fused, thresholded retrieval hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub memory: Memory,
    pub score: f64,
    pub components: ScoreBreakdown,
}

// ============================================================================
// ENTITIES AND LINKS
// ============================================================================

/// A named thing referenced by memories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A labeled edge between two entities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRelationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship: String,
    pub confidence: f64,
    /// Memory the relationship was observed in, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    /// Phrase the relationship was extracted from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A directed memory-to-memory edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLink {
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

/// A neighbor reference produced by link expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedRef {
    pub id: String,
    pub strength: f64,
    pub link_type: LinkType,
}

// ============================================================================
// DERIVED RECORDS
// ============================================================================

/// Immutable record of a consolidation merge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationRecord {
    pub id: String,
    pub summary_id: String,
    pub source_ids: Vec<String>,
    pub strategy: String,
    pub memories_merged: usize,
    pub created_at: DateTime<Utc>,
}

/// A detected contradiction between two memories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    pub id: String,
    pub memory_a_id: String,
    pub memory_b_id: String,
    pub description: String,
    pub status: ContradictionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// GOALS
// ============================================================================

/// A tracked objective with optional milestones in its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: GoalStatus,
    pub priority: GoalPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for creating a goal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateGoalInput {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: GoalPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CreateGoalInput {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            priority: GoalPriority::Medium,
            deadline: None,
            metadata: None,
        }
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Aggregate counts over the whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_memories: i64,
    pub active_memories: i64,
    pub archived_memories: i64,
    pub memories_with_embeddings: i64,
    pub total_entities: i64,
    pub total_memory_links: i64,
    pub total_goals: i64,
    pub active_goals: i64,
    pub pending_contradictions: i64,
    pub total_accesses: i64,
    pub db_size_bytes: i64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_roundtrip() {
        for ct in [
            ContentType::Text,
            ContentType::Conversation,
            ContentType::Note,
            ContentType::Summary,
        ] {
            assert_eq!(ContentType::parse_name(ct.as_str()), ct);
        }
    }

    #[test]
    fn test_source_roundtrip() {
        for src in [
            MemorySource::Manual,
            MemorySource::Cli,
            MemorySource::Api,
            MemorySource::Mcp,
            MemorySource::Browser,
            MemorySource::Import,
            MemorySource::Consolidation,
        ] {
            assert_eq!(MemorySource::parse_name(src.as_str()), src);
        }
    }

    #[test]
    fn test_link_type_roundtrip() {
        for lt in [
            LinkType::Related,
            LinkType::Elaborates,
            LinkType::Contradicts,
            LinkType::Supersedes,
            LinkType::Supports,
            LinkType::DerivedFrom,
        ] {
            assert_eq!(LinkType::parse_name(lt.as_str()), lt);
        }
    }

    #[test]
    fn test_unknown_names_fall_back_to_defaults() {
        assert_eq!(ContentType::parse_name("screenplay"), ContentType::Text);
        assert_eq!(MemorySource::parse_name("telegraph"), MemorySource::Manual);
        assert_eq!(EntityType::parse_name("starship"), EntityType::Concept);
    }

    #[test]
    fn test_create_input_deny_unknown_fields() {
        let json = r#"{"content": "test", "tags": ["a"]}"#;
        assert!(serde_json::from_str::<CreateMemoryInput>(json).is_ok());

        let json_bad = r#"{"content": "test", "sneaky": true}"#;
        assert!(serde_json::from_str::<CreateMemoryInput>(json_bad).is_err());
    }

    #[test]
    fn test_search_query_defaults() {
        let query: SearchQuery = serde_json::from_str(r#"{"query": "rust"}"#).unwrap();
        assert_eq!(query.limit, 20);
        assert_eq!(query.offset, 0);
        assert!(!query.include_metadata);
    }
}
