//! Contradiction detection: pairwise scan of recent memories whose
//! embeddings agree but whose text disagrees.
//!
//! A qualifying pair is semantically close (cosine at or above the
//! threshold) and shows a contradiction signal: exactly one side matches a
//! negation pattern, or both sides yield an "X is Y" extraction with the
//! same subject and different values.

use std::sync::OnceLock;

use regex::Regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::embeddings::vector_from_bytes;
use crate::error::{Error, Result};
use crate::scoring::cosine;
use crate::storage::{now_str, Store};
use crate::types::{Contradiction, ContradictionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionOptions {
    /// Cosine floor for a pair to be considered
    pub threshold: f64,
    /// Most recent memories scanned
    pub max_memories: usize,
    pub dry_run: bool,
}

impl Default for ContradictionOptions {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_memories: 200,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionReport {
    pub pairs_examined: usize,
    pub candidates_found: usize,
    pub created: usize,
    pub dry_run: bool,
}

/// Case-insensitive negation signals.
const NEGATION_PATTERNS: &[&str] = &[
    r"\bnot\b",
    r"n't\b",
    r"\bnever\b",
    r"\bno longer\b",
    r"\bstopped\b",
    r"\bwithout\b",
    r"\bcannot\b",
    r"\bno\b",
];

fn negation_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        NEGATION_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){}", p)).expect("static regex"))
            .collect()
    })
}

fn value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b([a-z][a-z0-9 _-]{1,40}?)\s+(?:is|are|was|were|uses|runs on|equals)\s+([a-z0-9._-]+)")
            .expect("static regex")
    })
}

fn has_negation(text: &str) -> bool {
    negation_res().iter().any(|re| re.is_match(text))
}

/// Extract the first "X is Y" style (subject, value) pair.
fn extract_value(text: &str) -> Option<(String, String)> {
    value_re().captures(text).map(|caps| {
        (
            caps[1].trim().to_lowercase(),
            caps[2].trim().to_lowercase(),
        )
    })
}

/// The contradiction signal for a close pair, if any.
fn contradiction_signal(a: &str, b: &str) -> Option<String> {
    let neg_a = has_negation(a);
    let neg_b = has_negation(b);
    if neg_a != neg_b {
        return Some("negation mismatch between near-identical statements".to_string());
    }

    if let (Some((subj_a, val_a)), Some((subj_b, val_b))) = (extract_value(a), extract_value(b)) {
        if subj_a == subj_b && val_a != val_b {
            return Some(format!(
                "conflicting values for '{}': '{}' vs '{}'",
                subj_a, val_a, val_b
            ));
        }
    }

    None
}

pub fn run_contradiction_scan(
    store: &Store,
    options: &ContradictionOptions,
) -> Result<ContradictionReport> {
    let memories = store.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, content, embedding FROM memories
             WHERE is_active = 1 AND embedding IS NOT NULL AND is_metadata = 0
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
            .filter_map(|(id, content, blob)| vector_from_bytes(&blob).map(|v| (id, content, v)))
            .collect::<Vec<_>>())
    })?;

    let mut report = ContradictionReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    let mut found: Vec<(String, String, String)> = Vec::new();
    for i in 0..memories.len() {
        for j in (i + 1)..memories.len() {
            report.pairs_examined += 1;
            let similarity = cosine(&memories[i].2, &memories[j].2) as f64;
            if similarity < options.threshold {
                continue;
            }
            if let Some(reason) = contradiction_signal(&memories[i].1, &memories[j].1) {
                found.push((memories[i].0.clone(), memories[j].0.clone(), reason));
            }
        }
    }
    report.candidates_found = found.len();

    if options.dry_run || found.is_empty() {
        return Ok(report);
    }

    let created = store.with_writer_tx(|conn| {
        let mut created = 0usize;
        for (a, b, reason) in &found {
            // Pair identity is symmetric: skip if recorded either way.
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM contradictions
                 WHERE (memory_a_id = ?1 AND memory_b_id = ?2)
                    OR (memory_a_id = ?2 AND memory_b_id = ?1)",
                params![a, b],
                |row| row.get(0),
            )?;
            if exists > 0 {
                continue;
            }
            conn.execute(
                "INSERT INTO contradictions (id, memory_a_id, memory_b_id, description,
                                             status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
                params![Ulid::new().to_string(), a, b, reason, now_str()],
            )?;
            created += 1;
        }
        Ok(created)
    })?;

    report.created = created;
    tracing::info!(
        "contradiction scan: {} candidates, {} recorded",
        report.candidates_found,
        report.created
    );
    Ok(report)
}

impl Store {
    /// List contradictions, optionally by status, newest first.
    pub fn list_contradictions(
        &self,
        status: Option<ContradictionStatus>,
    ) -> Result<Vec<Contradiction>> {
        self.with_reader(|conn| {
            let map_row = |row: &rusqlite::Row| -> rusqlite::Result<Contradiction> {
                let status: String = row.get("status")?;
                let created_at: String = row.get("created_at")?;
                let updated_at: String = row.get("updated_at")?;
                Ok(Contradiction {
                    id: row.get("id")?,
                    memory_a_id: row.get("memory_a_id")?,
                    memory_b_id: row.get("memory_b_id")?,
                    description: row.get("description")?,
                    status: ContradictionStatus::parse_name(&status),
                    resolution: row.get("resolution")?,
                    created_at: Store::parse_timestamp(&created_at, "created_at")?,
                    updated_at: Store::parse_timestamp(&updated_at, "updated_at")?,
                })
            };

            let rows = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM contradictions WHERE status = ?1 ORDER BY created_at DESC",
                    )?;
                    let rows = stmt
                        .query_map(params![status.as_str()], map_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM contradictions ORDER BY created_at DESC")?;
                    let rows = stmt
                        .query_map([], map_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    /// Resolve or dismiss a contradiction.
    pub fn set_contradiction_status(
        &self,
        id: &str,
        status: ContradictionStatus,
        resolution: Option<&str>,
    ) -> Result<()> {
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE contradictions SET status = ?1, resolution = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), resolution, now_str(), id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            Ok(())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
