/// Result type for membership operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the membership layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An endpoint string could not be parsed.
    #[error("malformed address `{0}`")]
    BadAddress(String),

    /// A host name resolved to no addresses.
    #[error("host `{0}` did not resolve")]
    UnknownHost(String),

    /// None of the requested peers could be contacted.
    #[error("no peers could be joined")]
    JoinFailed,

    /// A gossip message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A received frame exceeds the protocol limit.
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    /// Network error while gossiping.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
