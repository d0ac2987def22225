//! Error types for the updater client library.

use tonic::{Code, Status};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Metadata key carrying the daemon's machine-readable error name.
pub const ERROR_NAME_METADATA_KEY: &str = "x-eos-updater-error";

/// Errors that can occur during client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failed to establish connection to the daemon.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Transport-level error from tonic.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// gRPC error returned by the daemon.
    #[error("grpc error: {0}")]
    Grpc(Box<Status>),

    /// Invalid argument provided by caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The property stream ended before the awaited state was reached.
    #[error("property stream closed")]
    StreamClosed,
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        ClientError::Grpc(Box::new(status))
    }
}

impl ClientError {
    /// Returns the error message.
    pub fn message(&self) -> String {
        match self {
            ClientError::Connection(msg) => msg.clone(),
            ClientError::Transport(e) => e.to_string(),
            ClientError::Grpc(s) => s.message().to_string(),
            ClientError::InvalidArgument(msg) => msg.clone(),
            ClientError::StreamClosed => "property stream closed".to_string(),
        }
    }

    /// Returns the gRPC status code if this is a gRPC error.
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::Grpc(s) => Some(s.code()),
            _ => None,
        }
    }

    /// Daemon error name (e.g. `WRONG_STATE`, `LIVE_BOOT`) if present.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            ClientError::Grpc(s) => s
                .metadata()
                .get(ERROR_NAME_METADATA_KEY)
                .and_then(|v| v.to_str().ok()),
            _ => None,
        }
    }

    /// Returns true if the call was rejected because of the daemon's state.
    pub fn is_wrong_state(&self) -> bool {
        self.error_name() == Some("WRONG_STATE")
    }

    /// Returns true if the daemon runs on a live (non-installed) system.
    pub fn is_live_boot(&self) -> bool {
        self.error_name() == Some("LIVE_BOOT")
    }
}
