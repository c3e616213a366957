use thiserror::Error;

/// Result type for RPC bridge operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced by the RPC bridge.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc channel closed")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unsupported protocol version {actual}: expected {expected}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Returns true when the failure means the other side is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}
