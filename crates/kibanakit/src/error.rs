//! Error types for Kibana API operations.
//!
//! Errors are categorized so callers can decide whether an operation is
//! worth retrying, whether it can be ignored, or whether it must be
//! reported as a hard failure.

use std::time::Duration;
use thiserror::Error;

/// Categories of Kibana API errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection, DNS, timeout or other transport failure (transient)
    Network,
    /// The server asked us to slow down (HTTP 429)
    RateLimited,
    /// The server failed to handle a valid request (HTTP 5xx)
    Server,
    /// Object or endpoint does not exist (HTTP 404)
    NotFound,
    /// An object with the same id already exists (HTTP 409)
    Conflict,
    /// Request rejected by the server (other HTTP 4xx)
    Client,
    /// Response body could not be decoded
    InvalidResponse,
    /// Operation abandoned because the caller cancelled
    Cancelled,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimited | Self::Server)
    }

    /// Whether this error can be safely ignored when removing an object.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Network connectivity issue",
            Self::RateLimited => "Rate limited by Kibana",
            Self::Server => "Kibana server error",
            Self::NotFound => "Object not found",
            Self::Conflict => "Object already exists",
            Self::Client => "Request rejected",
            Self::InvalidResponse => "Unexpected response",
            Self::Cancelled => "Cancelled",
            Self::Other => "Unexpected error",
        }
    }
}

/// Errors that can occur while talking to Kibana.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transport-level failure (connection refused, DNS, timeout, ...)
    #[error("network error calling {url}: {message}")]
    Network {
        /// Request URL
        url: String,
        /// Underlying transport error
        message: String,
    },

    /// HTTP 429
    #[error("rate limited by {url}")]
    RateLimited {
        /// Request URL
        url: String,
        /// Server-provided `Retry-After`, if any
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx
    #[error("server error {status} from {url}: {body}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
        /// Response body (truncated)
        body: String,
    },

    /// HTTP 404
    #[error("not found: {url}")]
    NotFound {
        /// Request URL
        url: String,
    },

    /// HTTP 409, or an existing object that may not be overwritten
    #[error("conflict on {target}: {message}")]
    Conflict {
        /// URL or object the conflict was reported for
        target: String,
        /// Server message or explanation
        message: String,
    },

    /// Other HTTP 4xx
    #[error("request rejected with {status} by {url}: {body}")]
    Client {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
        /// Response body (truncated)
        body: String,
    },

    /// Response could not be decoded
    #[error("invalid response from {url}: {message}")]
    InvalidResponse {
        /// Request URL
        url: String,
        /// Decoder error
        message: String,
    },

    /// The caller cancelled while the operation was waiting to retry
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Longest response body kept in an error message.
const MAX_BODY_CHARS: usize = 512;

impl Error {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network { .. } => ErrorCategory::Network,
            Error::RateLimited { .. } => ErrorCategory::RateLimited,
            Error::Server { .. } => ErrorCategory::Server,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::Client { .. } => ErrorCategory::Client,
            Error::InvalidResponse { .. } => ErrorCategory::InvalidResponse,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether this error can be safely ignored.
    pub fn is_ignorable(&self) -> bool {
        self.category().is_ignorable()
    }

    /// Minimum wait requested by the server before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Create an error from a non-success HTTP status.
    ///
    /// `retry_after` is the raw `Retry-After` header value, only consulted
    /// for HTTP 429.
    pub fn from_status(status: u16, url: &str, body: &str, retry_after: Option<&str>) -> Self {
        let url = url.to_string();
        let body = truncate(body.trim());
        match status {
            404 => Error::NotFound { url },
            409 => Error::Conflict {
                target: url,
                message: body,
            },
            429 => Error::RateLimited {
                url,
                retry_after: retry_after
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            500..=599 => Error::Server { status, url, body },
            _ => Error::Client { status, url, body },
        }
    }

    /// Create an error from a ureq transport failure.
    pub fn from_transport(url: &str, err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::from_status(code, url, "", None),
            ureq::Error::Json(e) => Error::InvalidResponse {
                url: url.to_string(),
                message: e.to_string(),
            },
            ureq::Error::BadUri(uri) => Error::Other(format!("invalid url {uri}")),
            other => Error::Network {
                url: url.to_string(),
                message: other.to_string(),
            },
        }
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_BODY_CHARS {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{cut}...")
    }
}

/// Result type for Kibana operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(ErrorCategory::Server.is_retryable());
        assert!(!ErrorCategory::NotFound.is_retryable());
        assert!(!ErrorCategory::Conflict.is_retryable());
        assert!(!ErrorCategory::Client.is_retryable());
        assert!(!ErrorCategory::InvalidResponse.is_retryable());
        assert!(!ErrorCategory::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_category_ignorable() {
        assert!(ErrorCategory::NotFound.is_ignorable());
        assert!(!ErrorCategory::Server.is_ignorable());
        assert!(!ErrorCategory::Conflict.is_ignorable());
    }

    #[test]
    fn test_from_status_mapping() {
        let url = "http://kibana/api/saved_objects/dashboard/a";
        assert_eq!(
            Error::from_status(404, url, "", None).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            Error::from_status(409, url, "exists", None).category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            Error::from_status(503, url, "unavailable", None).category(),
            ErrorCategory::Server
        );
        assert_eq!(
            Error::from_status(400, url, "bad payload", None).category(),
            ErrorCategory::Client
        );
        assert!(!Error::from_status(403, url, "", None).is_retryable());
    }

    #[test]
    fn test_rate_limit_retry_after() {
        let err = Error::from_status(429, "http://kibana", "", Some(" 7 "));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = Error::from_status(429, "http://kibana", "", Some("soon"));
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_long_body_truncated() {
        let body = "x".repeat(2000);
        match Error::from_status(500, "http://kibana", &body, None) {
            Error::Server { body, .. } => assert!(body.len() < 600),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
