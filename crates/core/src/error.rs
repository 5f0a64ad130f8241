use serde::Deserialize;
use serde_json::Value;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// `error.data.type` value the peer uses when a capability is disabled by its
/// security settings.
pub const SECURITY_BLOCKED: &str = "security_blocked";

/// Error types that can occur while talking to the peer.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No live session with the peer.
    #[error("Not connected to the editor")]
    NotConnected,

    /// The TCP connect attempt failed.
    #[error("Editor connection failed ({host}:{port}): {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The session went away while a request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Socket I/O failed after the session was established.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response arrived within the request budget.
    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The peer could not be reached within the connection budget.
    #[error("Editor connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// The peer answered with an error.
    #[error("{message}")]
    Peer {
        message: String,
        data: Option<Value>,
    },

    /// The peer refused the call because the capability is disabled.
    #[error("{}", security_blocked_message(.reason, .command.as_deref()))]
    SecurityBlocked {
        reason: String,
        command: Option<String>,
    },

    /// No capability with this name is currently registered.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// The peer sent something that does not match the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Errors that mean "the session is unusable"; Discovery retries these.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectFailed { .. } | Self::ConnectionClosed | Self::Io(_)
        )
    }

    /// Check if this error is a request or connection timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionTimeout { .. })
    }

    /// Build the error for a failed response from its `error` member.
    pub fn from_error_payload(error: &Value) -> Self {
        let payload: ErrorPayload = serde_json::from_value(error.clone()).unwrap_or_default();
        let message = payload
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Unknown error".to_string());

        if let Some(data) = payload.data.as_ref() {
            if data.get("type").and_then(Value::as_str) == Some(SECURITY_BLOCKED) {
                let reason = data
                    .get("reason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .unwrap_or(message);
                let command = data
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                return Self::SecurityBlocked { reason, command };
            }
        }

        Self::Peer {
            message,
            data: payload.data,
        }
    }
}

fn security_blocked_message(reason: &str, command: Option<&str>) -> String {
    let mut message = reason.to_string();
    if let Some(command) = command {
        message.push_str(&format!(" (Command: {command})"));
    }
    message.push_str(
        " To use this feature, enable the corresponding option in the editor's bridge security settings",
    );
    message
}

/// `error` member of a failed response.
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}
