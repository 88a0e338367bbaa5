//! Error types for the ETL pipeline
//!
//! Every failure is one [`EtlError`] tagged with the pipeline phase it came
//! from ([`ErrorKind`]) and whether a local retry may succeed. The finer
//! [`Cause`] lets callers tell a rate limit from an auth failure without a
//! type hierarchy.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pipeline phase an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Extraction,
    Normalization,
    Load,
    Checkpoint,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Extraction => "extraction",
            ErrorKind::Normalization => "normalization",
            ErrorKind::Load => "load",
            ErrorKind::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What specifically went wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    /// Timeout, connection failure or 5xx after the retry budget
    Network,
    /// HTTP 429 after the retry budget; carries the advertised wait
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 401/403
    Authentication,
    /// HTTP 404
    NotFound,
    /// Body was not JSON or not a supported shape
    MalformedResponse,
    /// Request short-circuited by an open circuit breaker
    CircuitOpen,
    /// Feed or file could not be parsed
    Parse,
    /// Record failed unified-schema validation
    Validation,
    /// Persistence failure
    Database,
    /// Invalid source or pipeline configuration
    Configuration,
    Unexpected,
}

impl Cause {
    /// Whether errors with this cause may succeed on a local retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Cause::Network | Cause::RateLimited { .. })
    }
}

/// Main error type for the ETL pipeline
#[derive(Error, Debug)]
#[error("{kind} error: {message}{}", render_context(.context))]
pub struct EtlError {
    kind: ErrorKind,
    retryable: bool,
    cause: Cause,
    message: String,
    context: Vec<(String, String)>,
    #[source]
    source: Option<BoxError>,
}

fn render_context(context: &[(String, String)]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = context.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(" ({})", pairs.join(", "))
}

impl EtlError {
    pub fn new(kind: ErrorKind, cause: Cause, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: cause.is_retryable(),
            cause,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::Network, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::RateLimited { retry_after }, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::Authentication, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::NotFound, message)
    }

    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::MalformedResponse, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::CircuitOpen, message)
    }

    /// Unparseable feed or file content
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::Parse, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, Cause::Configuration, message)
    }

    /// Per-record unified-schema validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Normalization, Cause::Validation, message)
    }

    pub fn load(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Load, Cause::Database, message)
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Checkpoint, Cause::Database, message)
    }

    pub fn unexpected(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, Cause::Unexpected, message)
    }

    /// Append a key/value pair to the diagnostic context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.push((key.into(), value.to_string()));
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Override the retryable flag derived from the cause.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Look up a context value by key (first match).
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Wait hint advertised by a rate-limited upstream.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.cause {
            Cause::RateLimited { retry_after } => retry_after,
            _ => None,
        }
    }
}
