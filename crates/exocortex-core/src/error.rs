//! Error types for the memory engine.

/// Engine error type.
///
/// Variants map to the externally documented failure kinds. Background jobs
/// and providers log and swallow the non-fatal ones; write paths surface
/// `InvalidInput`, `NotFound`, `Conflict`, and `SchemaCorrupt` to callers.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller-provided value violates a documented constraint
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Id does not resolve
    #[error("not found: {0}")]
    NotFound(String),
    /// Uniqueness violation outside the structured dedup path
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backing store cannot be initialized or its catalog cannot be read
    #[error("schema corrupt: {0}")]
    SchemaCorrupt(String),
    /// Wrong password or tampered ciphertext
    #[error("decryption failed")]
    DecryptionFailed,
    /// Embedding provider error; non-fatal for writes, zeroes the vector
    /// component for queries
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Retryable store contention, already retried once internally
    #[error("transient store contention: {0}")]
    Transient(String),
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Short machine-readable kind tag for surfaces that map errors to
    /// protocol codes. Never leaks backing-store specifics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::SchemaCorrupt(_) => "schema_corrupt",
            Error::DecryptionFailed => "decryption_failed",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::Transient(_) => "transient",
            Error::Database(_) | Error::Io(_) | Error::Serde(_) => "internal",
        }
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Error::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(Error::NotFound("m-1".into()).kind(), "not_found");
        assert_eq!(Error::DecryptionFailed.kind(), "decryption_failed");
    }

    #[test]
    fn test_display_carries_reason() {
        let err = Error::InvalidInput("content is empty".into());
        assert_eq!(err.to_string(), "invalid input: content is empty");
    }
}
