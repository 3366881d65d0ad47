//! Error types and handling for the indexing engine
//!
//! The taxonomy separates caller mistakes (validation), lock budget
//! exhaustion, and collaborator faults. Anything unexpected thrown by a
//! collaborator folds into an internal-service error carrying the original
//! cause for diagnostics.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the indexing engine
#[derive(Error, Debug)]
pub enum Error {
    /// Caller mistake; never retried, surfaced as-is
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Lock could not be obtained within its timeout/retry budget; the
    /// operation failed without mutating state and is safe to retry
    #[error("lock acquisition error: {0}")]
    LockAcquisition(#[from] LockAcquisitionError),

    /// Store or lock substrate failure; caller decides retry policy
    #[error("internal service error: {0}")]
    InternalService(#[from] InternalServiceError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Caller mistakes detected before any state is touched
#[derive(Error, Debug)]
pub enum ValidationError {
    /// No type name or config supplied
    #[error("no type has been specified")]
    UndefinedType,

    /// Type name not present in the configured registry
    #[error("unrecognized type: {name}")]
    UnrecognizedType {
        /// The unknown type name
        name: String,
    },

    /// No id supplied and none could be derived from the document
    #[error("no id has been specified or can be calculated")]
    UndefinedId,
}

impl ValidationError {
    /// Stable machine-readable code for this validation failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UndefinedType => "UNDEFINED_TYPE",
            Self::UnrecognizedType { .. } => "UNRECOGNIZED_TYPE",
            Self::UndefinedId => "UNDEFINED_ID",
        }
    }
}

/// Exclusive section could not be entered within the configured budget
#[derive(Error, Debug)]
#[error("could not acquire lock '{key}': {details}")]
pub struct LockAcquisitionError {
    /// Lock key that timed out
    pub key: String,
    /// Backend-specific diagnostic
    pub details: String,
}

/// Collaborator fault: non-2xx/404 store response or transport failure
#[derive(Error, Debug)]
#[error("{details}")]
pub struct InternalServiceError {
    /// HTTP status of the failing response, when one was received
    pub status_code: Option<u16>,
    /// Response body or transport diagnostic
    pub details: String,
}

impl InternalServiceError {
    /// Build from a store response that was neither 2xx nor tolerated.
    pub fn from_status(status_code: u16, details: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            details: details.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::InternalService(InternalServiceError {
            status_code: error.status().map(|s| s.as_u16()),
            details: error.to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::InternalService(InternalServiceError {
            status_code: None,
            details: format!("malformed collaborator payload: {error}"),
        })
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal-service error without an HTTP status
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalService(InternalServiceError {
            status_code: None,
            details: msg.into(),
        })
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockAcquisition(_) => true,
            Self::InternalService(e) => e.status_code.map_or(true, |code| code >= 500),
            _ => false,
        }
    }

    /// Check if this is a caller error (4xx equivalent)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_codes() {
        assert_eq!(ValidationError::UndefinedId.code(), "UNDEFINED_ID");
        let err = ValidationError::UnrecognizedType { name: "movie".into() };
        assert_eq!(err.code(), "UNRECOGNIZED_TYPE");
        assert!(err.to_string().contains("movie"));
    }

    #[test]
    fn test_retry_classification() {
        let lock = Error::LockAcquisition(LockAcquisitionError {
            key: "book:1".into(),
            details: "timed out".into(),
        });
        assert!(lock.is_retryable());

        let client = Error::Validation(ValidationError::UndefinedType);
        assert!(!client.is_retryable());
        assert!(client.is_client_error());

        let server = Error::InternalService(InternalServiceError::from_status(503, "unavailable"));
        assert!(server.is_retryable());
        let conflict = Error::InternalService(InternalServiceError::from_status(409, "conflict"));
        assert!(!conflict.is_retryable());
    }
}
