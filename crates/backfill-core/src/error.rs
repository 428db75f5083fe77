use thiserror::Error;

use crate::validator::ValidationError;

/// Application-wide error types for Backfill.
#[derive(Error, Debug)]
pub enum AppError {
    /// Generation service answered with a gateway/server error worth retrying.
    #[error("Transient service error (HTTP {status_code}): {message}")]
    Transient { message: String, status_code: u16 },

    /// Generation service signalled overload (HTTP 429).
    #[error("Generation service overloaded: {0}")]
    Overloaded(String),

    /// Request timed out on the client side.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Generation service rejected the request in a way retrying won't fix.
    #[error("Generation service error (HTTP {status_code}): {message}")]
    ServiceError { message: String, status_code: u16 },

    /// Generated content failed the response contract.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Writing results back to the record store failed.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Reading from the record store failed (connection, query, migration).
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Checkpoint file could not be written.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Invalid or missing configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The shutdown signal fired while waiting.
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Transient { .. }
                | AppError::Overloaded(_)
                | AppError::Timeout(_)
                | AppError::NetworkError(_)
                | AppError::Validation(_)
        )
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// Validation failures are content problems, not service health
    /// problems, and never count against the breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::Transient { .. }
            | AppError::Overloaded(_)
            | AppError::Timeout(_)
            | AppError::NetworkError(_) => true,
            AppError::ServiceError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    /// Returns true if the service asked us to slow down.
    pub fn is_overload(&self) -> bool {
        matches!(self, AppError::Overloaded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30_000).is_retryable());
        assert!(AppError::Overloaded("slow down".into()).is_retryable());
        assert!(
            AppError::Transient {
                message: "bad gateway".into(),
                status_code: 502,
            }
            .is_retryable()
        );
        assert!(AppError::Validation(ValidationError::MissingField("summary".into())).is_retryable());
        assert!(
            !AppError::ServiceError {
                message: "bad request".into(),
                status_code: 400,
            }
            .is_retryable()
        );
        assert!(!AppError::ConfigError("missing".into()).is_retryable());
        assert!(!AppError::Shutdown.is_retryable());
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::Overloaded("429".into()).should_trip_circuit());
        assert!(AppError::Timeout(30_000).should_trip_circuit());
        assert!(
            AppError::ServiceError {
                message: "internal".into(),
                status_code: 501,
            }
            .should_trip_circuit()
        );
        assert!(
            !AppError::Validation(ValidationError::MalformedPayload("bad".into()))
                .should_trip_circuit()
        );
        assert!(!AppError::Shutdown.should_trip_circuit());
    }

    #[test]
    fn test_overload_classification() {
        assert!(AppError::Overloaded("429".into()).is_overload());
        assert!(
            !AppError::Transient {
                message: "503".into(),
                status_code: 503,
            }
            .is_overload()
        );
    }
}
