//! Client error kinds.

use haxorport_proto::CodecError;
use thiserror::Error;

/// Errors surfaced by the client core.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("authentication rejected by broker: {code}: {message}")]
    AuthRejected { code: String, message: String },

    #[error("tunnel registration failed: {0}")]
    RegisterFailed(String),

    #[error("tunnel quota exceeded: {used}/{limit} in use")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] CodecError),

    #[error("local I/O failed: {0}")]
    LocalIo(String),
}

impl ClientError {
    /// True for errors that retrying cannot fix; the orchestrator aborts on
    /// these instead of handing them to the reconnect supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::TokenInvalid(_) | ClientError::AuthRejected { .. }
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::LocalIo(err.to_string())
    }
}
