//! Error types for the sync engine.

use ledgersync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A network call exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The backend rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No credentials are available.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The local accounting engine could not be read.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The backend did not accept pushed records.
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// The tenant list could not be fetched.
    #[error("tenant directory error: {0}")]
    Directory(String),

    /// Server-side failure.
    #[error("server error: {0}")]
    ServerError(String),

    /// Malformed document or message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session authority invalidated this device's session.
    #[error("session invalidated: {0}")]
    SessionInvalidated(String),

    /// Not connected to the session authority.
    #[error("not connected to server")]
    NotConnected,

    /// Settings or wiring are incomplete or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Writing or reading a report or settings file failed.
    #[error("export error: {0}")]
    Export(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error must abort the whole run.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed(_) | SyncError::NotAuthenticated
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(ProtocolError::from(err))
    }
}
