//! Error types for the replicated store engine.

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, Error>;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, fatal to construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from the local store.
    #[error("store error: {0}")]
    Store(#[from] replikv_store::Error),

    /// Error from the membership layer.
    #[error("membership error: {0}")]
    Membership(#[from] replikv_membership::Error),

    /// Error from the consensus layer.
    #[error("consensus error: {0}")]
    Consensus(#[from] replikv_consensus::Error),

    /// A command payload could not be encoded.
    #[error("command encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The membership event channel closed unexpectedly.
    #[error("membership event channel closed")]
    EventChannelClosed,

    /// I/O error during startup or shutdown.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
