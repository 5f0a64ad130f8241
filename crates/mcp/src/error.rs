// Error types for the MCP surface

use editor_bridge_core::BridgeError;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// The stdout writer has gone away.
    #[error("Output channel closed")]
    OutputClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
