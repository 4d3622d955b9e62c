// Error taxonomy for the session core

//! Error types
//!
//! [`SessionError`] is what the orchestrator reports back to callers of
//! `engage`. [`RemoteError`] covers calls to the remote authority.

use thiserror::Error;

/// Failures surfaced at the orchestrator boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Unusable mode, tunnel config or server answer
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The host refused tunnel authorization
    #[error("Tunnel permission denied")]
    PermissionDenied,

    /// The tunnel primitive returned no descriptor
    #[error("Failed to establish tunnel interface")]
    Establish,

    /// No engine to run; the session stays up without one
    #[error("Packet engine unavailable")]
    EngineUnavailable,

    /// The server revoked the subscription mid-session
    #[error("Subscription not entitled: {0}")]
    Entitlement(String),

    /// The server could not be reached; retrying may help
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The engine exited while the session was active
    #[error("Packet engine terminated unexpectedly")]
    UnexpectedEngineTermination,

    /// Engage while a session is starting, up, or stopping
    #[error("Session already running")]
    AlreadyRunning,

    /// A stop arrived before the session came up
    #[error("Session start cancelled by stop request")]
    Cancelled,

    /// The orchestrator task is gone
    #[error("Orchestrator is shut down")]
    ShutDown,
}

/// Failures talking to the remote authority
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Status code the call does not handle
    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    /// Server error message, e.g. bad credentials
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Body did not match the expected shape
    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RemoteError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            RemoteError::Rejected(_) | RemoteError::Decode(_) => false,
        }
    }
}

impl From<RemoteError> for SessionError {
    fn from(err: RemoteError) -> Self {
        if err.is_transient() {
            SessionError::TransientNetwork(err.to_string())
        } else {
            SessionError::Configuration(format!("remote authority: {}", err))
        }
    }
}

/// Result alias for remote calls
pub type RemoteResult<T> = Result<T, RemoteError>;
