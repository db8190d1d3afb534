use thiserror::Error;

/// Failures the bridge can report to backend code or encode into a reply.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("invalid or expired session: {0}")]
    InvalidSession(String),
    #[error("{0}")]
    Timeout(String),
    #[error("bridge is busy and would block: {0}")]
    Reentrancy(String),
    #[error("{message}: '{expression}'")]
    RemoteExecution {
        message: String,
        expression: String,
    },
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("key not present: {0}")]
    KeyNotPresent(String),
    #[error("expression was already sent: {0}")]
    Spent(String),
    #[error("unexpected value shape: {0}")]
    Decode(String),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidSession(_) => "InvalidSession",
            BridgeError::Timeout(_) => "Timeout",
            BridgeError::Reentrancy(_) => "Reentrancy",
            BridgeError::RemoteExecution { .. } => "RemoteExecutionError",
            BridgeError::MethodNotFound(_) => "MethodNotFound",
            BridgeError::KeyNotPresent(_) => "KeyNotPresent",
            BridgeError::Spent(_) => "Spent",
            BridgeError::Decode(_) => "DecodeError",
        }
    }

    /// Message without the kind prefix, as carried in reply payloads.
    pub fn detail(&self) -> String {
        match self {
            BridgeError::InvalidSession(id) => id.clone(),
            BridgeError::MethodNotFound(name) => name.clone(),
            BridgeError::KeyNotPresent(key) => key.clone(),
            other => other.to_string(),
        }
    }

    /// `<kind>: <message>`, the form used in `{"error": ...}` payloads.
    pub fn wire_message(&self) -> String {
        format!("{}: {}", self.kind(), self.detail())
    }
}
