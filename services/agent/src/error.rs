//! Error types for the agent core.

use fleet_proto::control::v1::ResponseCode;
use thiserror::Error;
use tonic::Code;

/// Errors that leave the control-channel core.
///
/// Everything not listed here is absorbed inside the core: retried with
/// backoff or turned into an in-band response code.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Certificate material or other configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The server rejected registration in a way that must not be retried.
    #[error("registration rejected ({}): {message}", code.as_str_name())]
    Registration { code: ResponseCode, message: String },

    /// Streaming was attempted without a successful registration.
    #[error("agent is not registered")]
    NotRegistered,

    /// The control stream failed in a way that must not be retried.
    #[error("fatal stream error: {0}")]
    Fatal(String),

    /// Shutdown was signaled while waiting.
    #[error("shutdown requested")]
    Shutdown,
}

impl AgentError {
    /// Get a stable reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config_error",
            AgentError::Registration { .. } => "registration_rejected",
            AgentError::NotRegistered => "not_registered",
            AgentError::Fatal(_) => "fatal_stream_error",
            AgentError::Shutdown => "shutdown",
        }
    }

    /// Returns true if this error only reports a requested shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, AgentError::Shutdown)
    }
}

/// Errors produced by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Certificate material or endpoint configuration is unusable.
    #[error("transport configuration error: {0}")]
    Config(String),

    /// The server could not be reached.
    #[error("server unavailable: {0}")]
    Unavailable(String),

    /// The RPC failed with a gRPC status.
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The outbound side of the stream is gone.
    #[error("stream closed")]
    StreamClosed,
}

impl TransportError {
    /// Configuration and authentication failures that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Config(_) => true,
            TransportError::Rpc(status) => is_fatal_code(status.code()),
            TransportError::Unavailable(_) | TransportError::StreamClosed => false,
        }
    }

    /// Whether the underlying connection is suspect, as opposed to just the stream.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            TransportError::Unavailable(_) => true,
            TransportError::Rpc(status) => matches!(
                status.code(),
                Code::Unavailable | Code::Unknown | Code::DeadlineExceeded | Code::Internal
            ),
            TransportError::Config(_) | TransportError::StreamClosed => false,
        }
    }
}

/// gRPC codes that mean the server will never accept this agent's credentials.
pub(crate) fn is_fatal_code(code: Code) -> bool {
    matches!(code, Code::Unauthenticated | Code::PermissionDenied)
}
