//! Error types for albumkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Catalog Errors ===
    #[error("No album found: {0}")]
    NotFound(String),

    #[error("Invalid album id: {0:?}")]
    InvalidId(String),

    // === Store Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store timeout: {0}")]
    Timeout(String),

    #[error("Store protocol error: {0}")]
    Protocol(String),

    #[error("Consistent read aborted after {attempts} attempts")]
    Conflict { attempts: u32 },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only transport failures qualify. No path that returns one of these
    /// has left a partial mutation behind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidId(_) => StatusCode::BAD_REQUEST,
            Error::Store(_) | Error::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        use redis::ErrorKind;

        if e.is_timeout() {
            return Error::Timeout(e.to_string());
        }
        match e.kind() {
            // The server answered, but not in the shape we asked for.
            ErrorKind::TypeError | ErrorKind::ResponseError | ErrorKind::ExtensionError => {
                Error::Protocol(e.to_string())
            }
            _ => Error::Store(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable() {
        assert!(Error::Store("connection refused".into()).is_retryable());
        assert!(Error::Timeout("pool".into()).is_retryable());
        assert!(!Error::NotFound("5".into()).is_retryable());
        assert!(!Error::Protocol("bad reply".into()).is_retryable());
        assert!(!Error::Conflict { attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::NotFound("5".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::InvalidId("x".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Store("down".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Protocol("drift".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_redis_error_classification() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(Error::from(io), Error::Store(_)));

        let ty = redis::RedisError::from((redis::ErrorKind::TypeError, "unexpected reply"));
        assert!(matches!(Error::from(ty), Error::Protocol(_)));
    }
}
