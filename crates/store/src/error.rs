/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the local store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Options did not carry a database path.
    #[error("store options are missing a path")]
    MissingPath,

    /// The requested key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// The configured bucket disappeared from the database.
    #[error("bucket `{0}` not found")]
    BucketMissing(String),

    /// A value could not be serialised before writing.
    #[error("value encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored value could not be deserialised.
    #[error("value decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// A stored key or value is not valid UTF-8.
    #[error("entry `{0}` is not valid UTF-8")]
    RawEncoding(String),

    /// Error from the underlying engine.
    #[error("engine error: {0}")]
    Engine(#[from] rocksdb::Error),
}
