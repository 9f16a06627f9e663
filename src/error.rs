use thiserror::Error;

/// Protocol-level errors a handler must distinguish by kind in order to pick
/// the right outbound frame. Anything else propagates as `anyhow::Error` and
/// collapses to a generic `error` frame at the session boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Not registered")]
    NotRegistered,

    #[error("Attestation required")]
    NotAttested,

    #[error("Chunk payload too large (max {0} bytes)")]
    ChunkTooLarge(usize),

    #[error("Pair request could not be processed")]
    PairRequestRejected,

    #[error("No pending request from this peer")]
    NoPendingPairRequest,

    #[error("No source available for {0}")]
    NoChunkSource(String),

    #[error("not owner of channel")]
    NotChannelOwner,

    #[error("upstream-message rate limit exceeded")]
    UpstreamRateLimited,

    #[error("Unknown message type")]
    UnknownMessageType,
}

impl ProtocolError {
    /// A machine-readable code for errors the spec calls out by name.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::NotAttested => Some("NOT_ATTESTED"),
            _ => None,
        }
    }
}
