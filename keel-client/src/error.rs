//! Error types for the Keel client

use serde::Deserialize;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Keel client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}, {code}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error code from the response body, e.g. `NotFound`
        code: String,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Error body the orchestrator returns on failure
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl ClientError {
    /// Create an API error from status code and raw response body
    ///
    /// Bodies that are not the orchestrator's `{error, code}` shape are kept
    /// verbatim as the message.
    pub fn api_error(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => Self::ApiError {
                status,
                code: parsed.code,
                message: parsed.error,
            },
            Err(_) => Self::ApiError {
                status,
                code: "Unknown".to_string(),
                message: body,
            },
        }
    }

    /// Error code reported by the orchestrator, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ApiError { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// The job is already terminal or the write lost a race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ApiError { status: 409, .. })
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if (400..500).contains(status))
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_parses_orchestrator_body() {
        let err = ClientError::api_error(404, r#"{"error":"job not found","code":"NotFound"}"#);

        assert!(err.is_not_found());
        assert!(err.is_client_error());
        assert_eq!(err.code(), Some("NotFound"));
        assert_eq!(
            err.to_string(),
            "API error (status 404, NotFound): job not found"
        );
    }

    #[test]
    fn test_api_error_keeps_unknown_body() {
        let err = ClientError::api_error(502, "bad gateway");

        assert!(err.is_server_error());
        assert_eq!(err.code(), Some("Unknown"));
        assert!(matches!(err, ClientError::ApiError { ref message, .. } if message == "bad gateway"));
    }

    #[test]
    fn test_conflict() {
        let err = ClientError::api_error(409, r#"{"error":"job is Completed","code":"ResourceInUse"}"#);
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }
}
