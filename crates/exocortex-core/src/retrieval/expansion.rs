//! Query expansion through the entity graph.
//!
//! For each query word an entity lookup contributes the entity's aliases and
//! up to five related-entity names as additional OR terms, which also enrich
//! the embedded query text.

use crate::error::Result;
use crate::storage::Store;

/// Related-entity names pulled in per matched entity.
const RELATED_LIMIT: usize = 5;

/// Terms added to a query by entity expansion.
#[derive(Debug, Clone, Default)]
pub struct ExpandedQuery {
    pub extra_terms: Vec<String>,
}

/// Expand a raw query via the entity graph. Returns None when nothing
/// matched.
pub fn expand_query(store: &Store, query: &str) -> Result<Option<ExpandedQuery>> {
    let mut extra_terms: Vec<String> = Vec::new();

    for word in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
    {
        let Some(entity) = store.find_entity_by_name(word)? else {
            continue;
        };

        for alias in &entity.aliases {
            push_unique(&mut extra_terms, alias, query);
        }
        for name in store.related_entity_names(&entity.id, RELATED_LIMIT)? {
            push_unique(&mut extra_terms, &name, query);
        }
    }

    if extra_terms.is_empty() {
        Ok(None)
    } else {
        Ok(Some(ExpandedQuery { extra_terms }))
    }
}

fn push_unique(terms: &mut Vec<String>, term: &str, query: &str) {
    let term = term.trim();
    if term.is_empty() {
        return;
    }
    let lower = term.to_lowercase();
    if query.to_lowercase().contains(&lower) {
        return;
    }
    if !terms.iter().any(|t| t.eq_ignore_ascii_case(term)) {
        terms.push(term.to_string());
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateMemoryInput, EntityType, SearchQuery};

    #[test]
    fn test_expand_adds_aliases_and_relations() {
        let store = Store::open_in_memory().unwrap();
        let k8s = store
            .upsert_entity("Kubernetes", EntityType::Technology, &["k8s".to_string()])
            .unwrap();
        let helm = store
            .upsert_entity("Helm", EntityType::Technology, &[])
            .unwrap();
        store
            .add_entity_relationship(&k8s.id, &helm.id, "uses", 0.9, None, None)
            .unwrap();

        let expanded = expand_query(&store, "kubernetes upgrade plan")
            .unwrap()
            .unwrap();
        assert!(expanded.extra_terms.iter().any(|t| t == "k8s"));
        assert!(expanded.extra_terms.iter().any(|t| t == "Helm"));
    }

    #[test]
    fn test_expand_returns_none_without_entities() {
        let store = Store::open_in_memory().unwrap();
        assert!(expand_query(&store, "nothing known here").unwrap().is_none());
    }

    #[test]
    fn test_expansion_widens_search_when_enabled() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("search.query_expansion", "true").unwrap();

        let k8s = store
            .upsert_entity("Kubernetes", EntityType::Technology, &["k8s".to_string()])
            .unwrap();
        let _ = k8s;

        // The memory only ever says "k8s", never "kubernetes".
        store
            .create_memory(CreateMemoryInput::new(
                "Rolled the k8s control plane to the new version",
            ))
            .unwrap();

        let results = store.search(&SearchQuery::new("kubernetes")).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].memory.content.contains("k8s"));
    }
}
