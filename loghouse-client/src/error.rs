//! Client error types.

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No resolved server can take this call right now. Resolution retries
    /// on the next call.
    #[error("no suitable server available")]
    NoServerAvailable,

    /// Transport-level failure dialing a server.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The server rejected the call.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
}
