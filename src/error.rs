/*!
 * Error types for stage storage operations
 */

use std::fmt;
use std::io;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Result type alias for caller-visible storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for provider primitives
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Retry-relevant classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Cloud-issued token expired; recoverable by renewing credentials
    ExpiredCredentials,

    /// Throttling or a transient network/service fault; recoverable by backoff
    ThrottledOrTransient,

    /// Object, bucket or container does not exist
    NotFound,

    /// Bad input from the caller or bad credentials shape
    Malformed,

    /// Retries exhausted or an unclassifiable provider error
    Fatal,

    /// The client was shut down
    Closed,

    /// The caller cancelled the operation
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind may be recovered from inside the client
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExpiredCredentials | ErrorKind::ThrottledOrTransient
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ExpiredCredentials => "expired credentials",
            ErrorKind::ThrottledOrTransient => "throttled or transient",
            ErrorKind::NotFound => "not found",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Closed => "client closed",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The operation that was running when an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Renew,
    ListObjects,
    GetObjectMetadata,
    Download,
    Upload,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Renew => "renew",
            Operation::ListObjects => "listObjects",
            Operation::GetObjectMetadata => "getObjectMetadata",
            Operation::Download => "download",
            Operation::Upload => "upload",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure reported by a provider primitive
///
/// Carries whatever the provider exposed (error code, HTTP status) so the
/// classifier can map it without knowing which SDK produced it.
#[derive(Debug, Error)]
#[error("{provider} request failed{}: {message}", describe_code(.code.as_deref(), .status))]
pub struct ProviderError {
    /// Provider name ("s3", "azure", "gcs", "memory", "local")
    pub provider: &'static str,

    /// Provider error code (e.g. "ExpiredToken", "SlowDown")
    pub code: Option<String>,

    /// HTTP status, when the provider surfaced one
    pub status: Option<u16>,

    /// Human readable message
    pub message: String,

    /// Classification decided at the call site, overriding code/status rules
    pub kind_hint: Option<ErrorKind>,

    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn describe_code(code: Option<&str>, status: &Option<u16>) -> String {
    match (code, status) {
        (Some(code), Some(status)) => format!(" ({code}, HTTP {status})"),
        (Some(code), None) => format!(" ({code})"),
        (None, Some(status)) => format!(" (HTTP {status})"),
        (None, None) => String::new(),
    }
}

impl ProviderError {
    pub fn new(provider: &'static str, message: impl Into<String>) -> Self {
        Self {
            provider,
            code: None,
            status: None,
            message: message.into(),
            kind_hint: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_hint(mut self, kind: ErrorKind) -> Self {
        self.kind_hint = Some(kind);
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Provider does not implement the requested primitive
    pub fn unsupported(provider: &'static str, primitive: &str) -> Self {
        Self::new(provider, format!("{primitive} is not supported"))
            .with_hint(ErrorKind::Fatal)
    }

    /// Credentials map lacks a field the provider requires
    pub fn missing_credential(provider: &'static str, key: &str) -> Self {
        Self::new(provider, format!("missing credential field {key}"))
            .with_hint(ErrorKind::Malformed)
    }
}

impl From<io::Error> for ProviderError {
    fn from(err: io::Error) -> Self {
        let hint = if is_io_transient(&err) {
            ErrorKind::ThrottledOrTransient
        } else if err.kind() == io::ErrorKind::NotFound {
            ErrorKind::NotFound
        } else {
            ErrorKind::Fatal
        };
        ProviderError::new("local", err.to_string())
            .with_hint(hint)
            .with_source(err)
    }
}

/// Check if an I/O error is transient
pub(crate) fn is_io_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
            | UnexpectedEof
    )
}

/// Underlying cause of a caller-visible failure
#[derive(Debug, Error)]
pub enum Cause {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Message(String),
}

/// The single error type seen by the session layer
///
/// Renders as `"upload failed for 'PUT ...' after 4 attempt(s) [fatal]: cause"`.
#[derive(Debug, Error)]
#[error("{operation} failed for '{command}' after {attempts} attempt(s) [{kind}]: {cause}")]
pub struct StorageError {
    kind: ErrorKind,
    operation: Operation,
    command: String,
    attempts: u32,
    #[source]
    cause: Cause,
}

impl StorageError {
    pub fn new(
        kind: ErrorKind,
        operation: Operation,
        command: impl Into<String>,
        attempts: u32,
        cause: impl Into<Cause>,
    ) -> Self {
        Self {
            kind,
            operation,
            command: command.into(),
            attempts,
            cause: cause.into(),
        }
    }

    /// Caller contract violation detected before any I/O
    pub fn malformed(operation: Operation, command: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Malformed,
            operation,
            command,
            0,
            Cause::Message(message.into()),
        )
    }

    pub fn closed(operation: Operation, command: &str) -> Self {
        Self::new(
            ErrorKind::Closed,
            operation,
            command,
            0,
            Cause::Message("storage client is closed".to_string()),
        )
    }

    pub fn cancelled(operation: Operation, command: &str, attempts: u32) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            operation,
            command,
            attempts,
            Cause::Message("operation cancelled by caller".to_string()),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Raw provider error, if the failure came from a provider call
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match &self.cause {
            Cause::Provider(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = self.attempts.max(attempts);
        self
    }
}
