//! Unified error taxonomy. Internal code propagates `BridgeError` with `?`;
//! the two outer edges (the entry loop, tool workers) project it onto
//! either a JSON-RPC error object or an `isError:true` tool result,
//! depending on which layer the fault belongs to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed frame: {0}")]
    Transport(String),

    #[error("unknown method: {0}")]
    Protocol(String),

    #[error("invalid parameters: {0}")]
    Param(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request was cancelled")]
    Cancelled,

    #[error("upstream process exited")]
    ProcessExited,

    #[error("upstream returned an error: {0}")]
    Upstream(String),

    #[error("upstream channel closed unexpectedly")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Render this error the way a tool-call worker would: a short,
    /// human-readable diagnostic suitable for an `isError:true` tool result.
    pub fn as_tool_message(&self) -> String {
        match self {
            BridgeError::Upstream(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
