use std::time::Duration;

use http::StatusCode;

/// Longest response body excerpt kept in a [`Error::Registry`].
const MAX_DETAIL_BYTES: usize = 512;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unsupported authentication challenge: '{0}'")]
    ChallengesUnsupported(String),
    #[error("registry responded with {status}: {detail}")]
    Registry { status: StatusCode, detail: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: '{0}'")]
    Transport(#[from] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wraps a non-2xx response, keeping a bounded excerpt of the body.
    pub fn registry(status: StatusCode, body: &str) -> Self {
        let mut end = body.len().min(MAX_DETAIL_BYTES);
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        Error::Registry {
            status,
            detail: body[..end].trim().to_string(),
        }
    }

    /// 5xx responses, connection failures and deadlines are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Registry { status, .. } => status.is_server_error(),
            Error::Transport(_) | Error::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Registry { status, .. } => *status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }

    /// Label written in the final line of a failed job's log.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::Auth(_) => "AuthError",
            Error::ChallengesUnsupported(_) => "ChallengesUnsupportedError",
            Error::Registry { .. } | Error::Transport(_) | Error::Timeout(_) => "RegistryError",
            Error::NotFound(_) => "NotFound",
            Error::RateLimited(_) => "RateLimit",
            Error::Conflict(_) => "Conflict",
            Error::Store(_) | Error::Migrate(_) => "StoreError",
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => "InternalError",
        }
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Internal(format!("failed to build request: {}", e))
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(e: http::uri::InvalidUri) -> Self {
        Error::Configuration(format!("invalid url: {}", e))
    }
}

impl From<http::uri::InvalidUriParts> for Error {
    fn from(e: http::uri::InvalidUriParts) -> Self {
        Error::Configuration(format!("invalid url: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_detail_is_truncated() {
        let body = "x".repeat(2048);
        match Error::registry(StatusCode::BAD_GATEWAY, &body) {
            Error::Registry { status, detail } => {
                assert_eq!(status, StatusCode::BAD_GATEWAY);
                assert_eq!(detail.len(), MAX_DETAIL_BYTES);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let body = "é".repeat(400);
        if let Error::Registry { detail, .. } = Error::registry(StatusCode::BAD_REQUEST, &body) {
            assert!(detail.len() <= MAX_DETAIL_BYTES);
            assert!(detail.chars().all(|c| c == 'é'));
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::registry(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(!Error::registry(StatusCode::FORBIDDEN, "").is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!Error::Auth("denied".to_string()).is_retryable());
        assert!(Error::registry(StatusCode::NOT_FOUND, "").is_not_found());
    }
}
