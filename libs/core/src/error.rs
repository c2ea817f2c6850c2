use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Rejections raised before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("credential must not be empty")]
    Empty,
    #[error("credential looks like a placeholder value")]
    Placeholder,
    #[error("credential is too short ({length} characters, minimum {min})")]
    TooShort { length: usize, min: usize },
    #[error("credential contains disallowed character {0:?}")]
    InvalidCharacter(char),
    #[error("activity has neither text nor attachments")]
    EmptyActivity,
}

/// Failures surfaced by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport provider unavailable: {0}")]
    Unavailable(String),
    #[error("transport request timed out")]
    Timeout,
    #[error("transport network error")]
    Network(#[source] BoxError),
    #[error("remote error (status {status}, retry_after = {retry_after:?})")]
    Remote {
        status: StatusCode,
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("transport response decode error")]
    Decode(#[source] BoxError),
    #[error("transport does not support {0}")]
    Unsupported(&'static str),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Network(_) | TransportError::Closed => true,
            TransportError::Remote { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            TransportError::Unavailable(_)
            | TransportError::Decode(_)
            | TransportError::Unsupported(_) => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors returned to callers of the connection controller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("session not initialized")]
    SessionNotInitialized,
    #[error("no transport provider available: {0}")]
    TransportUnavailable(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("connection controller stopped")]
    Closed,
}

impl SessionError {
    pub fn diagnose(&self) -> ErrorDiagnosis {
        match self {
            SessionError::Validation(err) => ErrorDiagnosis::new(
                ErrorCategory::Validation,
                err.to_string(),
                "Check the Direct Line secret or token copied from the bot channel settings.",
            ),
            SessionError::SessionNotInitialized => ErrorDiagnosis::new(
                ErrorCategory::Configuration,
                self.to_string(),
                "Call initialize before sending activities.",
            ),
            SessionError::TransportUnavailable(message) => ErrorDiagnosis::new(
                ErrorCategory::TransportUnavailable,
                message.clone(),
                "Register at least one available transport provider.",
            ),
            SessionError::Transport(err) => classify(err),
            SessionError::Closed => ErrorDiagnosis::new(
                ErrorCategory::Unknown,
                self.to_string(),
                "Construct a new connection controller.",
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    TransportUnavailable,
    Authentication,
    Permission,
    Configuration,
    NotFound,
    Throttling,
    Server,
    Network,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::TransportUnavailable => "transport_unavailable",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Throttling => "throttling",
            ErrorCategory::Server => "server",
            ErrorCategory::Network => "network",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Human-oriented classification of a failure. Never replaces the raw error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDiagnosis {
    pub category: ErrorCategory,
    pub message: String,
    pub suggestion: String,
}

impl ErrorDiagnosis {
    fn new(category: ErrorCategory, message: String, suggestion: &str) -> Self {
        Self {
            category,
            message,
            suggestion: suggestion.to_string(),
        }
    }
}

pub fn classify(err: &TransportError) -> ErrorDiagnosis {
    let message = err.to_string();
    match err {
        TransportError::Unavailable(_) => ErrorDiagnosis::new(
            ErrorCategory::TransportUnavailable,
            message,
            "The transport library could not be loaded; check the provider fallback order.",
        ),
        TransportError::Timeout | TransportError::Network(_) | TransportError::Closed => {
            ErrorDiagnosis::new(
                ErrorCategory::Network,
                message,
                "Check network connectivity, proxies and firewall rules for the Direct Line domain.",
            )
        }
        TransportError::Remote { status, .. } => classify_status(*status, message),
        TransportError::Unsupported(_) => ErrorDiagnosis::new(
            ErrorCategory::Configuration,
            message,
            "The selected transport cannot perform this operation.",
        ),
        TransportError::Decode(_) => ErrorDiagnosis::new(
            ErrorCategory::Unknown,
            message,
            "The endpoint returned an unexpected payload; verify the domain setting.",
        ),
    }
}

fn classify_status(status: StatusCode, message: String) -> ErrorDiagnosis {
    match status {
        StatusCode::UNAUTHORIZED => ErrorDiagnosis::new(
            ErrorCategory::Authentication,
            message,
            "The secret or token was rejected or has expired; generate a new one.",
        ),
        StatusCode::FORBIDDEN => ErrorDiagnosis::new(
            ErrorCategory::Permission,
            message,
            "Enable the Direct Line channel for the bot and check trusted origins.",
        ),
        StatusCode::BAD_REQUEST => ErrorDiagnosis::new(
            ErrorCategory::Configuration,
            message,
            "The request was malformed; verify the domain and conversation settings.",
        ),
        StatusCode::NOT_FOUND => ErrorDiagnosis::new(
            ErrorCategory::NotFound,
            message,
            "The conversation or endpoint does not exist; start a new conversation.",
        ),
        StatusCode::TOO_MANY_REQUESTS => ErrorDiagnosis::new(
            ErrorCategory::Throttling,
            message,
            "Too many requests; slow down polling or wait before reconnecting.",
        ),
        status if status.is_server_error() => ErrorDiagnosis::new(
            ErrorCategory::Server,
            message,
            "The agent service is failing; retry later or check the service health page.",
        ),
        _ => ErrorDiagnosis::new(
            ErrorCategory::Unknown,
            message,
            "Inspect the raw error for details.",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(status: StatusCode) -> TransportError {
        TransportError::Remote {
            status,
            retry_after: None,
            message: String::new(),
        }
    }

    #[test]
    fn classifies_http_statuses() {
        let cases = [
            (StatusCode::UNAUTHORIZED, ErrorCategory::Authentication),
            (StatusCode::FORBIDDEN, ErrorCategory::Permission),
            (StatusCode::BAD_REQUEST, ErrorCategory::Configuration),
            (StatusCode::NOT_FOUND, ErrorCategory::NotFound),
            (StatusCode::TOO_MANY_REQUESTS, ErrorCategory::Throttling),
            (StatusCode::BAD_GATEWAY, ErrorCategory::Server),
            (StatusCode::IM_A_TEAPOT, ErrorCategory::Unknown),
        ];
        for (status, expected) in cases {
            assert_eq!(classify(&remote(status)).category, expected, "{status}");
        }
        assert_eq!(classify(&TransportError::Timeout).category, ErrorCategory::Network);
    }

    #[test]
    fn transient_errors() {
        assert!(TransportError::Timeout.is_transient());
        assert!(remote(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(remote(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!remote(StatusCode::UNAUTHORIZED).is_transient());
        assert!(!TransportError::Unsupported("resume").is_transient());
    }

    #[test]
    fn session_error_keeps_raw_transport_error() {
        let err = SessionError::from(remote(StatusCode::FORBIDDEN));
        assert_eq!(err.diagnose().category, ErrorCategory::Permission);
        match err {
            SessionError::Transport(TransportError::Remote { status, .. }) => {
                assert_eq!(status, StatusCode::FORBIDDEN)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
