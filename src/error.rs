// src/error.rs

//! Unified error handling for the schedule orchestrator.
//!
//! Every error maps onto an [`ErrorKind`], which is what the stage invoker
//! uses to decide between retrying and giving up.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Failure classes recorded on executions and branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unparsable ingest file or malformed trigger payload.
    Input,
    /// Store/network throttling, timeouts, unavailable dependencies.
    TransientInfra,
    /// Access denied by the store, object store or messaging endpoint.
    Permission,
    /// A template or channel the pipeline depends on does not exist.
    ConfigMissing,
    /// A unit of work explicitly refused the request.
    Rejected,
    /// Some branches of an execution failed while others succeeded.
    PartialDelivery,
    /// The execution was aborted before this work could run.
    Cancelled,
}

impl ErrorKind {
    /// Only transient infrastructure failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientInfra)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Input => "InputError",
            ErrorKind::TransientInfra => "TransientInfraError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::ConfigMissing => "ConfigMissingError",
            ErrorKind::Rejected => "RejectedError",
            ErrorKind::PartialDelivery => "PartialDeliveryError",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed trigger payload or work-data file
    #[error("Input error: {0}")]
    Input(String),

    /// Throttling, unavailable store, transient network failure
    #[error("Transient infrastructure error: {0}")]
    Transient(String),

    /// A unit of work exceeded its time budget
    #[error("Stage '{stage}' timed out after {elapsed:?}")]
    Timeout { stage: String, elapsed: Duration },

    /// Access denied by a collaborator
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Template, channel or other required configuration is absent
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    /// Explicit business-logic rejection
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Structured error returned by an external unit of work
    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// Execution aborted by an operator
    #[error("Execution aborted")]
    Cancelled,

    /// Attempt to modify a terminal execution record
    #[error("Execution {0} is already terminal")]
    ExecutionTerminal(String),

    /// Storage backend failure that is not transient
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV reading or writing failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn transient(message: impl fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::ConfigMissing(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn storage(message: impl fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an error from a remote service code.
    pub fn remote(code: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.to_string(),
        }
    }

    /// Classify this error. Remote codes listed in `transient_codes` count as
    /// transient in addition to the built-in throttling codes.
    pub fn classify(&self, transient_codes: &[String]) -> ErrorKind {
        match self {
            AppError::Remote { code, .. } => remote_kind(code, transient_codes),
            other => other.kind(),
        }
    }

    /// Classification without an allowlist; remote codes fall back to the
    /// built-in throttling list.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Input(_)
            | AppError::Json(_)
            | AppError::Csv(_)
            | AppError::Validation(_) => ErrorKind::Input,
            AppError::Transient(_) | AppError::Timeout { .. } => ErrorKind::TransientInfra,
            AppError::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                std::io::ErrorKind::NotFound => ErrorKind::Input,
                _ => ErrorKind::TransientInfra,
            },
            AppError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorKind::TransientInfra
                } else {
                    match e.status().map(|s| s.as_u16()) {
                        Some(401) | Some(403) => ErrorKind::Permission,
                        Some(429) => ErrorKind::TransientInfra,
                        Some(s) if s >= 500 => ErrorKind::TransientInfra,
                        _ => ErrorKind::Rejected,
                    }
                }
            }
            AppError::Permission(_) => ErrorKind::Permission,
            AppError::ConfigMissing(_)
            | AppError::Config(_)
            | AppError::Toml(_)
            | AppError::TomlSerialize(_) => ErrorKind::ConfigMissing,
            AppError::Remote { code, .. } => remote_kind(code, &[]),
            AppError::Rejected(_) | AppError::ExecutionTerminal(_) | AppError::Storage(_) => {
                ErrorKind::Rejected
            }
            AppError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn remote_kind(code: &str, extra_transient: &[String]) -> ErrorKind {
    let transient = crate::models::defaults::transient_codes();
    if transient.iter().chain(extra_transient).any(|c| c == code) {
        ErrorKind::TransientInfra
    } else if is_permission_code(code) {
        ErrorKind::Permission
    } else {
        ErrorKind::Rejected
    }
}

fn is_permission_code(code: &str) -> bool {
    code.starts_with("AccessDenied")
        || matches!(
            code,
            "UnauthorizedOperation" | "Forbidden" | "InvalidAccessKeyId" | "ExpiredToken"
        )
}

/// Map an AWS SDK error to an [`AppError`] by its error code.
#[cfg(feature = "aws")]
pub fn from_sdk_error<E, R>(
    context: &str,
    err: sdk::SdkError<E, R>,
) -> AppError
where
    E: sdk::ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: fmt::Debug,
{
    use sdk::SdkError;

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return AppError::transient(format!("{context}: {err}"));
        }
        _ => {}
    }

    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    let transient = crate::models::defaults::transient_codes();

    if transient.iter().any(|c| *c == code) {
        AppError::transient(format!("{context}: [{code}] {message}"))
    } else if is_permission_code(&code) {
        AppError::permission(format!("{context}: [{code}] {message}"))
    } else {
        AppError::remote(code, format!("{context}: {message}"))
    }
}

/// SDK error types; S3 and DynamoDB share the same smithy runtime types.
#[cfg(feature = "aws")]
pub(crate) mod sdk {
    pub use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AppError::transient("throttled").is_retryable());
        assert!(
            AppError::Timeout {
                stage: "Ingest".into(),
                elapsed: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(!AppError::input("bad row").is_retryable());
        assert!(!AppError::permission("denied").is_retryable());
        assert!(!AppError::config_missing("template").is_retryable());
    }

    #[test]
    fn test_remote_classification_extends_builtin_codes() {
        let allow = vec!["EndpointBusy".to_string()];
        let err = AppError::remote("EndpointBusy", "please wait");
        assert_eq!(err.classify(&allow), ErrorKind::TransientInfra);
        assert_eq!(err.kind(), ErrorKind::Rejected);

        let err = AppError::remote("ThrottlingException", "busy");
        assert_eq!(err.classify(&allow), ErrorKind::TransientInfra);
        assert_eq!(err.classify(&[]), ErrorKind::TransientInfra);
        assert_eq!(err.kind(), ErrorKind::TransientInfra);

        let err = AppError::remote("ValidationException", "bad");
        assert_eq!(err.classify(&allow), ErrorKind::Rejected);

        let err = AppError::remote("AccessDeniedException", "nope");
        assert_eq!(err.classify(&allow), ErrorKind::Permission);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Permission.to_string(), "PermissionError");
        assert_eq!(ErrorKind::Input.to_string(), "InputError");
    }
}
