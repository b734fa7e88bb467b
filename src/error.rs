// vigil: Error types

use thiserror::Error;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error kinds
///
/// Every subsystem surfaces failures as one of these variants; the API layer
/// owns the mapping to HTTP statuses.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Canceled: {0}")]
    Canceled(String),
}

/// Check if error is retryable (transient)
pub fn is_transient(err: &CoreError) -> bool {
    matches!(err, CoreError::Transient(_) | CoreError::Timeout(_))
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            CoreError::Transient(err.to_string())
        } else {
            CoreError::Permanent(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&CoreError::Transient("io".into())));
        assert!(is_transient(&CoreError::Timeout("deadline".into())));
        assert!(!is_transient(&CoreError::Permanent("bad payload".into())));
        assert!(!is_transient(&CoreError::NotFound("rule".into())));
    }
}
