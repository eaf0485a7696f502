//! Text derivation helpers: content normalization and hashing, keyword
//! derivation, chunk splitting, and rule-based entity extraction.
//!
//! Entity extraction here is deliberately shallow: capitalized-phrase
//! patterns with a small type-hint table. Anything smarter is an external
//! collaborator.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::EntityType;

// ============================================================================
// NORMALIZATION AND HASHING
// ============================================================================

/// Lowercase and collapse whitespace; the canonical form behind
/// `content_hash`.
pub fn normalize_content(content: &str) -> String {
    content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(content).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// First 16 hex chars of the SHA-256 of a query string; the co-retrieval
/// fingerprint.
pub fn query_fingerprint(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..16]
        .to_string()
}

// ============================================================================
// KEYWORDS
// ============================================================================

const KEYWORD_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "i", "in", "is", "it", "its", "my", "not", "of", "on", "or", "our", "she",
    "that", "the", "their", "they", "this", "to", "was", "we", "were", "will", "with", "you",
    "your",
];

/// Derive the lexical keyword string fed to the full-text index: lowercased
/// distinct terms of length >= 3 with stop words removed, in first-seen
/// order, capped at 40 terms.
pub fn derive_keywords(content: &str) -> String {
    let stop: HashSet<&str> = KEYWORD_STOP_WORDS.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for token in content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
    {
        if stop.contains(token) || !seen.insert(token.to_string()) {
            continue;
        }
        keywords.push(token.to_string());
        if keywords.len() >= 40 {
            break;
        }
    }

    keywords.join(" ")
}

// ============================================================================
// CHUNKING
// ============================================================================

/// Split long content into ordered chunks of roughly `target_size`
/// characters, preferring paragraph and sentence boundaries.
pub fn split_chunks(content: &str, target_size: usize) -> Vec<String> {
    let target_size = target_size.max(100);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in split_sentences(content) {
        if !current.is_empty() && current.len() + piece.len() > target_size {
            chunks.push(current.trim().to_string());
            current = String::new();
        }
        // A single sentence longer than the target is split on raw length.
        if piece.len() > target_size {
            let mut rest = piece.as_str();
            while rest.len() > target_size {
                let split_at = floor_char_boundary(rest, target_size);
                chunks.push(rest[..split_at].trim().to_string());
                rest = &rest[split_at..];
            }
            current.push_str(rest);
            current.push(' ');
        } else {
            current.push_str(&piece);
            current.push(' ');
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index.max(1)
}

fn split_sentences(content: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    for paragraph in content.split("\n\n") {
        let mut sentence = String::new();
        for ch in paragraph.chars() {
            sentence.push(ch);
            if matches!(ch, '.' | '!' | '?') {
                pieces.push(std::mem::take(&mut sentence));
            }
        }
        if !sentence.trim().is_empty() {
            pieces.push(sentence);
        }
    }
    pieces
}

// ============================================================================
// ENTITY EXTRACTION
// ============================================================================

/// A rule-extracted entity mention.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    /// Mention frequency mapped into [0,1]
    pub relevance: f64,
}

fn capitalized_phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Two-level phrase: "Ada Lovelace", "Apache Kafka", single "Postgres"
        Regex::new(r"\b[A-Z][a-zA-Z0-9+#.-]*(?:\s+[A-Z][a-zA-Z0-9+#.-]*){0,3}\b")
            .expect("static regex")
    })
}

const TECHNOLOGY_HINTS: &[&str] = &[
    "rust", "python", "postgres", "postgresql", "sqlite", "redis", "kafka", "docker",
    "kubernetes", "linux", "react", "tokio", "axum", "git", "typescript", "javascript", "nginx",
    "graphql", "grpc", "webassembly", "llvm",
];

const ORGANIZATION_SUFFIXES: &[&str] = &["inc", "corp", "labs", "ltd", "llc", "gmbh", "foundation"];

fn classify_entity(name: &str) -> EntityType {
    let lower = name.to_lowercase();

    if TECHNOLOGY_HINTS.iter().any(|t| *t == lower) {
        return EntityType::Technology;
    }
    if ORGANIZATION_SUFFIXES
        .iter()
        .any(|s| lower.ends_with(&format!(" {}", s)) || lower.ends_with(&format!(" {}.", s)))
    {
        return EntityType::Organization;
    }
    // Two capitalized words with no digits reads as a person name
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.len() == 2 && !name.chars().any(|c| c.is_ascii_digit()) {
        return EntityType::Person;
    }
    EntityType::Concept
}

/// Extract entity mentions from content using capitalized-phrase rules.
///
/// Sentence-leading words are kept only when they recur elsewhere or match a
/// technology hint, which filters most false positives from ordinary prose.
pub fn extract_entities(content: &str) -> Vec<ExtractedEntity> {
    let mut counts: Vec<(String, usize)> = Vec::new();

    for m in capitalized_phrase_re().find_iter(content) {
        let name = m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string();
        if name.len() < 3 {
            continue;
        }
        let lower = name.to_lowercase();
        if KEYWORD_STOP_WORDS.contains(&lower.as_str()) {
            continue;
        }
        let sentence_leading = m.start() == 0
            || content[..m.start()]
                .trim_end()
                .ends_with(['.', '!', '?', '\n']);
        if sentence_leading
            && !TECHNOLOGY_HINTS.contains(&lower.as_str())
            && content.matches(name.as_str()).count() < 2
        {
            continue;
        }

        match counts.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some((_, c)) => *c += 1,
            None => counts.push((name, 1)),
        }
    }

    let max_count = counts.iter().map(|(_, c)| *c).max().unwrap_or(1) as f64;
    counts
        .into_iter()
        .map(|(name, count)| ExtractedEntity {
            entity_type: classify_entity(&name),
            relevance: (0.5 + 0.5 * (count as f64 / max_count)).min(1.0),
            name,
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_content("  Hello   WORLD\n\tagain "),
            "hello world again"
        );
    }

    #[test]
    fn test_content_hash_is_case_insensitive() {
        assert_eq!(content_hash("Hello World"), content_hash("hello   world"));
        assert_ne!(content_hash("hello world"), content_hash("hello worlds"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn test_query_fingerprint_is_sha16() {
        let fp = query_fingerprint("what database do we use");
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, query_fingerprint("what database do we use"));
    }

    #[test]
    fn test_derive_keywords_drops_stop_words() {
        let kw = derive_keywords("The database is on the staging cluster");
        assert!(kw.contains("database"));
        assert!(kw.contains("staging"));
        assert!(!kw.split(' ').any(|t| t == "the"));
    }

    #[test]
    fn test_derive_keywords_dedupes() {
        let kw = derive_keywords("retry retry retry backoff");
        assert_eq!(kw, "retry backoff");
    }

    #[test]
    fn test_split_chunks_respects_target() {
        let sentence = "This is a sentence about memory engines and ranking. ";
        let content = sentence.repeat(40);
        let chunks = split_chunks(&content, 500);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 600, "chunk too large: {}", chunk.len());
            assert!(!chunk.is_empty());
        }
        // No content lost beyond whitespace
        let rejoined: String = chunks.join(" ");
        assert_eq!(
            normalize_content(&rejoined),
            normalize_content(&content)
        );
    }

    #[test]
    fn test_split_chunks_handles_oversized_sentence() {
        let content = "x".repeat(1200);
        let chunks = split_chunks(&content, 500);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn test_extract_entities_finds_recurring_names() {
        let text = "Talked to Ada Lovelace about the analytical engine. \
                    Ada Lovelace suggested we benchmark against PostgreSQL.";
        let entities = extract_entities(text);

        let ada = entities
            .iter()
            .find(|e| e.name == "Ada Lovelace")
            .expect("person found");
        assert_eq!(ada.entity_type, EntityType::Person);
        assert!(entities.iter().any(|e| e.name == "PostgreSQL"
            && e.entity_type == EntityType::Technology));
    }

    #[test]
    fn test_extract_entities_relevance_bounds() {
        let text = "We migrated the billing service to Kubernetes, and Kubernetes \
                    handled the rollout.";
        for entity in extract_entities(text) {
            assert!(entity.relevance >= 0.0 && entity.relevance <= 1.0);
        }
    }
}
