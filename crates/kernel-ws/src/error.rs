//! Errors raised by the kernel WebSocket client.

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum KernelWsError {
    /// Malformed frame or unexpected message shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message exceeds the maximum size of {limit} bytes")]
    MessageTooBig { limit: usize },

    /// Local contract violation by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Kernel channels are not running")]
    NotConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelWsError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        KernelWsError::Protocol(msg.into())
    }
}
