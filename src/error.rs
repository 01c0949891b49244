//! Error types for the limiter engines and the outbox relay.

use std::error::Error;
use std::fmt;

/// Errors surfaced by the limiter engines.
#[derive(Debug)]
pub enum LimitError {
    /// Caller bug: non-positive permit count, empty key, or malformed
    /// engine configuration. Never retryable.
    InvalidArgument(String),
    /// The backing store could not be reached or answered with an error.
    /// Retryable at the caller's discretion; the HTTP adapter maps this to
    /// a 5xx so outages stay visible.
    StoreUnavailable(Box<dyn Error + Send + Sync>),
}

impl LimitError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        LimitError::InvalidArgument(reason.into())
    }

    pub fn store_unavailable(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        LimitError::StoreUnavailable(source.into())
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, LimitError::InvalidArgument(_))
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, LimitError::StoreUnavailable(_))
    }
}

impl fmt::Display for LimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitError::InvalidArgument(reason) => write!(f, "invalid argument: {}", reason),
            LimitError::StoreUnavailable(source) => {
                write!(f, "rate limit store unavailable: {}", source)
            }
        }
    }
}

impl Error for LimitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LimitError::StoreUnavailable(source) => {
                Some(source.as_ref() as &(dyn Error + 'static))
            }
            LimitError::InvalidArgument(_) => None,
        }
    }
}

/// Transient failure talking to the relational store backing the outbox.
///
/// The relay logs these and retries on the next tick; affected rows keep
/// whatever status they had, so no state is lost.
#[derive(Debug)]
pub struct StoreError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl StoreError {
    /// Wrap an underlying driver error.
    pub fn new(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        let source = source.into();
        Self { message: source.to_string(), source: Some(source) }
    }

    /// A store-level failure with no underlying driver error.
    pub fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbox store error: {}", self.message)
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|s| s as &(dyn Error + 'static))
    }
}

/// The downstream log rejected or failed a publish. Always retryable until
/// the event's retry budget runs out; the message is persisted on the row.
#[derive(Debug)]
pub struct PublishError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl PublishError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    pub fn with_source(mut self, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "publish failed: {}: {}", self.message, source),
            None => write!(f, "publish failed: {}", self.message),
        }
    }
}

impl Error for PublishError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|s| s as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn invalid_argument_display() {
        let err = LimitError::invalid_argument("tokens must be positive");
        assert_eq!(err.to_string(), "invalid argument: tokens must be positive");
        assert!(err.is_invalid_argument());
        assert!(!err.is_store_unavailable());
        assert!(err.source().is_none());
    }

    #[test]
    fn store_unavailable_keeps_source() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err = LimitError::store_unavailable(io_err);
        assert!(err.is_store_unavailable());
        assert!(err.to_string().contains("connection refused"));
        assert!(err.source().is_some());
    }

    #[test]
    fn store_error_from_message_has_no_source() {
        let err = StoreError::message("no row with id");
        assert_eq!(err.to_string(), "outbox store error: no row with id");
        assert!(err.source().is_none());
    }

    #[test]
    fn store_error_wraps_driver_error() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "statement timeout");
        let err = StoreError::new(io_err);
        assert!(err.to_string().contains("statement timeout"));
        assert!(err.source().is_some());
    }

    #[test]
    fn publish_error_display_includes_source() {
        let err = PublishError::new("broker rejected batch")
            .with_source(io::Error::new(io::ErrorKind::Other, "not enough replicas"));
        let rendered = err.to_string();
        assert!(rendered.contains("broker rejected batch"));
        assert!(rendered.contains("not enough replicas"));
    }
}
