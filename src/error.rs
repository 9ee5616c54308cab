//! Error taxonomy shared by every component.
//!
//! All fallible public operations return [`Result`]. Errors carry a stable
//! [`ErrorKind`] code (the machine-readable identifier external callers match
//! on), a human message, and `retryable`/`fatal` attributes. Conversion
//! errors additionally carry the converter id and source metadata so that
//! per-file failures can be recorded in `ingest_errors` without losing
//! context.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kind identifiers.
///
/// The `code()` strings are part of the external contract: they are stored
/// in `ingest_errors.code` and `documents.last_error_code`, and the CLI/MCP
/// collaborators map them to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unsupported,
    TooLarge,
    Timeout,
    Corrupt,
    Permission,
    Io,
    AdapterFailure,
    QueryFailed,
    VecUnavailable,
    VecSyncFailed,
    Runtime,
    Internal,
}

impl ErrorKind {
    /// Stable identifier for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::TooLarge => "TOO_LARGE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Corrupt => "CORRUPT",
            ErrorKind::Permission => "PERMISSION",
            ErrorKind::Io => "IO",
            ErrorKind::AdapterFailure => "ADAPTER_FAILURE",
            ErrorKind::QueryFailed => "QUERY_FAILED",
            ErrorKind::VecUnavailable => "VEC_UNAVAILABLE",
            ErrorKind::VecSyncFailed => "VEC_SYNC_FAILED",
            ErrorKind::Runtime => "RUNTIME",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Whether an operation failing with this kind is worth retrying
    /// without any change to the input.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Io | ErrorKind::AdapterFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// A fatal error aborts the current file, never the batch.
    pub fatal: bool,
    pub converter_id: Option<String>,
    pub source_path: Option<String>,
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            fatal: false,
            converter_id: None,
            source_path: None,
            mime: None,
            ext: None,
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueryFailed, message)
    }

    pub fn vec_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VecUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_converter(mut self, converter_id: &str) -> Self {
        self.converter_id = Some(converter_id.to_string());
        self
    }

    pub fn with_source(mut self, path: &str, mime: &str, ext: &str) -> Self {
        self.source_path = Some(path.to_string());
        self.mime = Some(mime.to_string());
        self.ext = Some(ext.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Exit code the CLI collaborator maps this error to.
    ///
    /// `VALIDATION`/`UNSUPPORTED`/`NOT_FOUND` are caller mistakes (exit 1);
    /// everything else is an operational failure (exit 2).
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Validation | ErrorKind::Unsupported | ErrorKind::NotFound => 1,
            _ => 2,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::not_found("row not found"),
            other => Error::query_failed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Error::new(kind, e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::new(ErrorKind::Timeout, e.to_string())
        } else {
            Error::new(ErrorKind::AdapterFailure, e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::AdapterFailure, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::Validation.code(), "VALIDATION");
        assert_eq!(ErrorKind::VecSyncFailed.code(), "VEC_SYNC_FAILED");
        assert_eq!(ErrorKind::AdapterFailure.code(), "ADAPTER_FAILURE");
        assert_eq!(ErrorKind::Runtime.code(), "RUNTIME");
    }

    #[test]
    fn retryable_defaults() {
        assert!(Error::new(ErrorKind::Timeout, "t").retryable);
        assert!(Error::new(ErrorKind::Io, "i").retryable);
        assert!(Error::new(ErrorKind::AdapterFailure, "a").retryable);
        assert!(!Error::new(ErrorKind::Corrupt, "c").retryable);
        assert!(!Error::validation("v").retryable);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Error::validation("bad").exit_code(), 1);
        assert_eq!(Error::not_found("missing").exit_code(), 1);
        assert_eq!(Error::unsupported("nope").exit_code(), 1);
        assert_eq!(Error::internal("boom").exit_code(), 2);
        assert_eq!(Error::new(ErrorKind::Io, "disk").exit_code(), 2);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::query_failed("syntax error");
        assert_eq!(e.to_string(), "QUERY_FAILED: syntax error");
    }
}
