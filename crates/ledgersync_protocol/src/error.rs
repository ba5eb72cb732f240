//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding protocol documents.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The input was not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON was valid but did not have the expected shape.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// A resolution strategy name was not recognised.
    #[error("unknown resolution strategy: {0}")]
    UnknownStrategy(String),
}

impl ProtocolError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid_structure("expected array");
        assert_eq!(err.to_string(), "invalid structure: expected array");

        let err = ProtocolError::UnknownStrategy("keepBoth".into());
        assert!(err.to_string().contains("keepBoth"));
    }

    #[test]
    fn json_error_converts() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
