//! Error type for the image store.

/// Alias for `Result<T, sarus_store::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by image store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A reference string could not be parsed, or lacked both a tag and a
    /// digest when one was required.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// No entry in the store matched the reference.
    #[error("image not found in store: {0}")]
    NotFound(String),

    /// Acquiring the advisory lock on `metadata.json` exceeded its timeout.
    #[error("timed out after {0}ms waiting for the repository metadata lock")]
    LockTimeout(u64),

    /// `metadata.json` contained a document that didn't match its schema.
    #[error("corrupt repository metadata: {0}")]
    CorruptMetadata(String),

    /// An I/O error touching the repository directory or its files.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `metadata.json` failed to (de)serialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
