//! Embedding provider boundary.
//!
//! The embedding model itself lives outside the engine. Anything that can map
//! a string to a unit-normalized vector of fixed dimension can be registered
//! here; network-backed implementations should honor `EXOCORTEX_MODEL_DIR`
//! for their local cache. Provider failure is a typed error and never crashes
//! the engine: writes store a null embedding, queries zero the vector signal.

use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::scoring::cosine;

/// Contract for an injected embedding model.
///
/// Implementations must be safe to invoke from concurrent callers or
/// serialize internally.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text into a unit-normalized vector of `dimensions()`
    /// length.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts. The default implementation loops.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Fixed output dimension D.
    fn dimensions(&self) -> usize;
}

// Process-wide provider registration. RwLock rather than OnceLock because
// tests must be able to swap and clear the provider.
static PROVIDER: RwLock<Option<Arc<dyn EmbeddingProvider>>> = RwLock::new(None);

/// Register the process-wide embedding provider.
pub fn set_provider(provider: Arc<dyn EmbeddingProvider>) {
    let mut slot = PROVIDER.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(provider);
}

/// Remove the registered provider. Subsequent embed calls degrade gracefully.
pub fn clear_provider() {
    let mut slot = PROVIDER.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// The currently registered provider, if any.
pub fn provider() -> Option<Arc<dyn EmbeddingProvider>> {
    PROVIDER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Embed via the registered provider, surfacing a typed error when absent or
/// failing.
pub fn embed(text: &str) -> Result<Vec<f32>> {
    match provider() {
        Some(p) => p.embed(text),
        None => Err(Error::ProviderUnavailable(
            "no embedding provider registered".to_string(),
        )),
    }
}

/// Dimension of the registered provider, or None when unregistered.
pub fn dimensions() -> Option<usize> {
    provider().map(|p| p.dimensions())
}

// ============================================================================
// VECTOR CODEC
// ============================================================================

/// Serialize a vector as raw little-endian f32 bytes (length 4·D).
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize raw little-endian f32 bytes; None when the length is not a
/// multiple of 4.
pub fn vector_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ============================================================================
// IN-PROCESS PROVIDER
// ============================================================================

/// Deterministic in-process provider: a hashed bag-of-tokens model.
///
/// Each lowercased token is hashed into one of D buckets and the bucket
/// counts are L2-normalized. Texts sharing most tokens land close in cosine
/// space, which is enough for offline operation and for exercising the dedup
/// and ranking paths without a model download.
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

fn token_bucket(token: &str, dims: usize) -> usize {
    // FNV-1a, stable across platforms
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % dims as u64) as usize
}

impl EmbeddingProvider for HashingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::ProviderUnavailable(
                "cannot embed empty text".to_string(),
            ));
        }

        let mut vector = vec![0.0_f32; self.dims];
        for token in trimmed
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[token_bucket(token, self.dims)] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Cosine similarity between two optional embeddings; 0.0 when either is
/// absent.
pub fn similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => cosine(a, b),
        _ => 0.0,
    }
}

/// Tests that mutate or depend on the empty process-wide registry serialize
/// through this lock.
#[cfg(test)]
pub(crate) fn registry_test_lock() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// TESTS
// ============================================================================
