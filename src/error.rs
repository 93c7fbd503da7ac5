use hyper::header::HeaderMap;
use hyper::StatusCode;
use thiserror::Error;

/// Type alias for Result with GoAwayError
pub type Result<T> = std::result::Result<T, GoAwayError>;

/// Error taxonomy for the unsubscribe pipeline
///
/// Errors fall in three groups:
/// - transient transport errors, retried on a later run
/// - permanent per-message errors, logged and skipped
/// - run-fatal errors (credentials, storage, configuration) that stop the run
#[derive(Error, Debug)]
pub enum GoAwayError {
    /// Provider returned a non-success status not covered by a narrower variant
    #[error("Provider API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// Still unauthorized after refreshing the access token
    #[error("Unauthorized after refreshing credentials: {0}")]
    Unauthorized(String),

    /// Token endpoint or credential lifecycle failure
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Operator never completed the authorization redirect
    #[error("Timed out after {0} seconds waiting for the authorization redirect")]
    AuthorizationTimeout(u64),

    /// Authorization server redirected back with an error
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, TLS, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// Request did not complete in time
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Provider payload could not be mapped into a message
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Ledger or credential store failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Store could not be used (e.g. poisoned connection lock)
    #[error("State error: {0}")]
    State(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Run stopped on request
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl GoAwayError {
    /// Check if the error is transient and the operation should be retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GoAwayError::RateLimitExceeded { .. }
                | GoAwayError::ServerError { .. }
                | GoAwayError::Network(_)
                | GoAwayError::Timeout(_)
        )
    }

    /// Check if the error must stop the whole run
    ///
    /// Credential failures cannot be fixed by moving on to the next message,
    /// and a failed ledger write would break the no-duplicate-send guarantee.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GoAwayError::Unauthorized(_)
                | GoAwayError::Auth(_)
                | GoAwayError::AuthorizationTimeout(_)
                | GoAwayError::AuthorizationDenied(_)
                | GoAwayError::Storage(_)
                | GoAwayError::State(_)
                | GoAwayError::Config(_)
                | GoAwayError::Io(_)
                | GoAwayError::Cancelled(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Map a non-success provider response into an error
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let status_code = status.as_u16();
        let body = String::from_utf8_lossy(body).into_owned();
        let message = format!(
            "HTTP {}: {}",
            status_code,
            status.canonical_reason().unwrap_or("Unknown")
        );

        match status_code {
            429 => GoAwayError::RateLimitExceeded {
                retry_after: parse_retry_after_header(headers),
            },
            400 => GoAwayError::BadRequest(format!("{message}: {body}")),
            403 => GoAwayError::Forbidden(format!("{message}: {body}")),
            404 => GoAwayError::NotFound(format!("{message}: {body}")),
            500..=599 => GoAwayError::ServerError {
                status: status_code,
                message: format!("{message}: {body}"),
            },
            _ => GoAwayError::Api {
                status: status_code,
                body,
            },
        }
    }
}

impl From<hyper::Error> for GoAwayError {
    fn from(error: hyper::Error) -> Self {
        GoAwayError::Network(error.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for GoAwayError {
    fn from(error: hyper_util::client::legacy::Error) -> Self {
        GoAwayError::Network(format!("Connection error: {}", error))
    }
}

impl From<hyper::http::Error> for GoAwayError {
    fn from(error: hyper::http::Error) -> Self {
        GoAwayError::Network(format!("Invalid request: {}", error))
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
fn parse_retry_after_header(headers: &HeaderMap) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_value) = headers.get(hyper::header::RETRY_AFTER) {
        if let Ok(retry_after_str) = retry_after_value.to_str() {
            if let Ok(seconds) = retry_after_str.parse::<u64>() {
                return seconds;
            }

            if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
                let now = std::time::SystemTime::now();
                if let Ok(duration) = http_date.duration_since(now) {
                    return duration.as_secs();
                }
            }
        }
    }

    DEFAULT_RETRY_AFTER
}
