use std::path::PathBuf;

use tarmak_mux::MuxError;
use tarmak_transport::TransportError;

/// Errors that can occur while serving or calling procedures.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Socket-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session-level error.
    #[error("session error: {0}")]
    Mux(#[from] MuxError),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The host never came up on the socket.
    #[error("could not reach tarmak at {path} after {attempts} attempts: {source}")]
    Connect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The host ran the procedure and it failed.
    #[error("call to {procedure} failed: {message}")]
    Remote { procedure: String, message: String },

    /// The requested procedure is not in the table.
    #[error("rpc: can't find method {0}")]
    UnknownProcedure(String),

    /// The peer sent something that is not a valid reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A collaborator behind a procedure failed.
    #[error("{0}")]
    Backend(String),

    /// The connection closed before a reply arrived.
    #[error("connection closed before reply")]
    Disconnected,
}

impl RpcError {
    pub fn backend(message: impl Into<String>) -> Self {
        RpcError::Backend(message.into())
    }

    /// Whether the host could not be reached at all, as opposed to a
    /// procedure failing on a reachable host.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            RpcError::Connect { .. }
                | RpcError::Transport(_)
                | RpcError::Mux(_)
                | RpcError::Io(_)
                | RpcError::Disconnected
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
