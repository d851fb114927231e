//! Error types for MCP operations.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::tasks::TaskStatus;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A payload could not be serialized for the wire.
    #[error("failed to encode message: {0}")]
    Encoding(#[source] serde_json::Error),

    /// Failed to spawn the MCP server process.
    #[error("failed to spawn MCP server: {0}")]
    SpawnFailed(String),

    /// The transport endpoint does not exist.
    #[error("transport unavailable at {}: {reason}", path.display())]
    TransportUnavailable {
        /// Endpoint that was checked.
        path: PathBuf,
        /// Why the endpoint is unusable.
        reason: String,
    },

    /// Failed to communicate with the MCP server.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server returned an error response.
    #[error("server error {code}: {message}")]
    ServerError {
        /// Error code from the server.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional additional data.
        data: Option<serde_json::Value>,
    },

    /// The initialize exchange failed; the connection is unusable.
    #[error("handshake failed: {source}")]
    HandshakeFailed {
        /// What went wrong during the exchange.
        #[source]
        source: Arc<McpError>,
    },

    /// Server not initialized.
    #[error("server not initialized - call initialize() first")]
    NotInitialized,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A caller-imposed bound was exceeded.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// No task with this id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task already reached a terminal state.
    #[error("task {id} is already in terminal state: {status}")]
    TaskTerminal {
        /// Task id.
        id: String,
        /// Terminal status the task is in.
        status: TaskStatus,
    },

    /// The requested status change is not allowed.
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task id.
        id: String,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// The task finished in the failed state.
    #[error("task {id} failed: {message}")]
    TaskFailed {
        /// Task id.
        id: String,
        /// Failure message recorded by the producer.
        message: String,
        /// Whether the failure came from a tool result flagged as an error.
        tool_error: bool,
    },

    /// The task was canceled.
    #[error("task {0} was canceled")]
    TaskCanceled(String),

    /// The task manager is shutting down.
    #[error("task manager shutting down")]
    Shutdown,
}

impl McpError {
    /// Create an encoding error.
    pub fn encoding(err: serde_json::Error) -> Self {
        Self::Encoding(err)
    }

    /// Create a spawn failed error.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a transport-unavailable error.
    pub fn unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a server error from an error response.
    pub fn server_error(
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
            data,
        }
    }

    /// Wrap the error that ended the initialize exchange.
    pub fn handshake_failed(source: McpError) -> Self {
        Self::HandshakeFailed {
            source: Arc::new(source),
        }
    }

    /// The error that ended the handshake, when this is a handshake failure.
    pub fn handshake_cause(&self) -> Option<&McpError> {
        match self {
            Self::HandshakeFailed { source } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    /// Whether this error ends the connection it was raised on.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::TransportUnavailable { .. }
                | Self::ConnectionClosed
                | Self::SpawnFailed(_)
                | Self::Io(_)
        )
    }

    /// Whether this error signals cancellation (task canceled or manager gone).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::TaskCanceled(_) | Self::Shutdown)
    }
}
