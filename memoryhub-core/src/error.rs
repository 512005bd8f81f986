//! Error types for the memory store.

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the public API.
///
/// Kinds mirror the failure taxonomy of the storage engine: a caller can
/// match on [`Error::is_recoverable`] to decide whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty content, malformed tag list, or an unknown tier name.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An append or DB insert failed; the caller's record was not persisted.
    #[error("storage write failed: {0}")]
    StorageWrite(String),

    /// An unrecoverable read failure with no fallback available.
    #[error("storage read failed: {0}")]
    StorageRead(String),

    /// The sidecar index disagrees with its log; recoverable by rebuild.
    #[error("index inconsistent for tier {tier}: {reason}")]
    IndexInconsistency {
        /// Tier whose sidecar/log disagree.
        tier: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A stored record could not be decoded; the line is skipped, not fatal.
    #[error("failed to deserialize record: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the operation that produced this error can be safely retried
    /// or whether the store has already degraded in a way that serving the
    /// caller is still possible (e.g. a rebuild or a skip-and-continue).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::IndexInconsistency { .. } | Error::SerializationError(_)
        )
    }
}
