//! Error types for Nimbus

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Nimbus Error
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a compute/edge provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Retryable (rate limits, 5xx, connection resets)
    Transient,
    /// Not retryable
    Permanent,
    /// Account limits reached
    QuotaExceeded,
    /// The request itself was rejected (unknown size, bad region...)
    InvalidSpec,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::Transient => write!(f, "transient"),
            ProviderErrorKind::Permanent => write!(f, "permanent"),
            ProviderErrorKind::QuotaExceeded => write!(f, "quota exceeded"),
            ProviderErrorKind::InvalidSpec => write!(f, "invalid spec"),
        }
    }
}

/// Nimbus error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
        detail: Option<String>,
    },

    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        detail: Option<String>,
    },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("SSH error: {message}")]
    Ssh {
        message: String,
        detail: Option<String>,
        transient: bool,
    },

    #[error("{workflow} failed at step '{step}' (compensation {}): {source}", outcome(.compensated))]
    Pipeline {
        workflow: String,
        step: String,
        compensated: bool,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn outcome(compensated: &bool) -> &'static str {
    if *compensated {
        "succeeded"
    } else {
        "failed"
    }
}

/// Machine-readable error kind carried by every user-visible failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderTransient,
    ProviderPermanent,
    QuotaExceeded,
    InvalidSpec,
    Authentication,
    Timeout,
    Validation,
    Conflict,
    Encryption,
    NotFound,
    Ssh,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderPermanent => "provider_permanent",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Encryption => "encryption",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Ssh => "ssh",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Error::Provider {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::provider(ProviderErrorKind::Transient, message)
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            seconds: elapsed.as_secs(),
        }
    }

    /// Attach raw upstream text to a provider, SSH or authentication error.
    pub fn with_detail(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Error::Provider { detail, .. }
            | Error::Authentication { detail, .. }
            | Error::Ssh { detail, .. } => *detail = Some(text.into()),
            _ => {}
        }
        self
    }

    /// Machine-readable kind. Pipeline failures report the kind of the step error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provider { kind, .. } => match kind {
                ProviderErrorKind::Transient => ErrorKind::ProviderTransient,
                ProviderErrorKind::Permanent => ErrorKind::ProviderPermanent,
                ProviderErrorKind::QuotaExceeded => ErrorKind::QuotaExceeded,
                ProviderErrorKind::InvalidSpec => ErrorKind::InvalidSpec,
            },
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Encryption(_) => ErrorKind::Encryption,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Ssh { .. } => ErrorKind::Ssh,
            Error::Pipeline { source, .. } => source.kind(),
            Error::Io(_) | Error::Store(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Raw provider/SSH text preserved for debugging.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Error::Provider { detail, .. }
            | Error::Authentication { detail, .. }
            | Error::Ssh { detail, .. } => detail.as_deref(),
            Error::Pipeline { source, .. } => source.detail(),
            _ => None,
        }
    }

    /// Whether the operation that produced this error may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { kind, .. } => *kind == ProviderErrorKind::Transient,
            Error::Ssh { transient, .. } => *transient,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// The "resource already gone" signal providers use for idempotent deletes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Wire form of an error: machine kind, human message, optional raw detail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            detail: e.detail().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::transient("503").is_retryable());
        assert!(!Error::provider(ProviderErrorKind::QuotaExceeded, "limit").is_retryable());
        assert!(!Error::Authentication {
            message: "bad key".into(),
            detail: None
        }
        .is_retryable());
    }

    #[test]
    fn test_pipeline_error_reports_step_kind() {
        let err = Error::Pipeline {
            workflow: "domain ssl".into(),
            step: "request_certificate".into(),
            compensated: true,
            source: Box::new(
                Error::provider(ProviderErrorKind::Permanent, "rejected")
                    .with_detail("{\"errors\":[{\"code\":1010}]}"),
            ),
        };
        assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
        assert_eq!(err.detail(), Some("{\"errors\":[{\"code\":1010}]}"));
        let msg = err.to_string();
        assert!(msg.contains("request_certificate"));
        assert!(msg.contains("compensation succeeded"));
    }

    #[test]
    fn test_error_body() {
        let body = ErrorBody::from(&Error::Conflict("name taken".into()));
        assert_eq!(body.kind, ErrorKind::Conflict);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "conflict");
        assert!(json.get("detail").is_none());
    }
}
