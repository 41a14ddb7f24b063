//! Error handling for the event log.
//!
//! This module provides:
//! - The [`EventStoreError`] type returned by every store, upcaster and processor operation
//! - Stable machine-readable [`ErrorCode`]s grouped into categories
//! - Severity mapping used to pick a log level
//! - The [`ErrorContext`] extension trait used to attach operation context at layer boundaries
//!
//! Only two kinds of error are meant to be handled programmatically by callers:
//! [`EventStoreError::Concurrency`] (reload, reapply, resave) and
//! [`EventStoreError::StreamNotFound`]. Everything else is fatal to the current operation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use eventlog_core::error::{ErrorContext, Result};
//!
//! async fn load(store: &dyn EventStore, id: &StreamId) -> Result<StreamSlice> {
//!     store
//!         .read_from_stream(id, ReadOptions::forward())
//!         .await
//!         .context("read_from_stream", id)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::events::{EventId, Position, StreamId, StreamVersion};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for event log operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Stream Errors (1000-1099)
    StreamNotFound,
    ConcurrencyConflict,
    DuplicateEventId,
    GlobalStreamNotWritable,
    SubscriptionClosed,
    UnknownEventType,
    InternalStreamProtected,

    // Processing Errors (1100-1199)
    HandlerFailed,
    CheckpointFailed,

    // Backend Errors (2000-2099)
    DatabaseError,
    TransportError,
    LogServerError,
    NotImplemented,
    NotificationFailed,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
}

impl ErrorCode {
    /// Get the numeric code.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::StreamNotFound => 1000,
            Self::ConcurrencyConflict => 1001,
            Self::DuplicateEventId => 1002,
            Self::GlobalStreamNotWritable => 1003,
            Self::SubscriptionClosed => 1004,
            Self::UnknownEventType => 1005,
            Self::InternalStreamProtected => 1006,

            Self::HandlerFailed => 1100,
            Self::CheckpointFailed => 1101,

            Self::DatabaseError => 2000,
            Self::TransportError => 2001,
            Self::LogServerError => 2002,
            Self::NotImplemented => 2003,
            Self::NotificationFailed => 2004,

            Self::SerializationError => 2200,

            Self::ConfigurationError => 5000,
        }
    }

    /// Check if retrying the failed operation can succeed without the caller
    /// changing anything.
    ///
    /// Concurrency conflicts are not listed: they require the caller to reload
    /// the stream before trying again.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError
                | Self::TransportError
                | Self::LogServerError
                | Self::NotificationFailed
                | Self::SubscriptionClosed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "stream",
            1100..=1199 => "processing",
            2000..=2099 => "backend",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes the caller handles (conflicts, missing streams)
    Low,
    /// Operational issues (closed subscriptions, unsupported operations)
    Medium,
    /// Failures of the backing technology or of a processor run
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::StreamNotFound | ErrorCode::ConcurrencyConflict => Self::Low,

            ErrorCode::SubscriptionClosed
            | ErrorCode::NotImplemented
            | ErrorCode::GlobalStreamNotWritable
            | ErrorCode::InternalStreamProtected
            | ErrorCode::DuplicateEventId
            | ErrorCode::UnknownEventType => Self::Medium,

            ErrorCode::HandlerFailed
            | ErrorCode::CheckpointFailed
            | ErrorCode::DatabaseError
            | ErrorCode::TransportError
            | ErrorCode::LogServerError
            | ErrorCode::NotificationFailed
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for all event log operations.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A read, truncate or metadata query targeted a stream that does not exist.
    #[error("stream not found: {stream_id}")]
    StreamNotFound { stream_id: StreamId },

    /// The stream's current version did not match the caller's expectation.
    #[error("concurrency conflict on stream {stream_id}: expected version {expected}, actual version {actual}")]
    Concurrency {
        stream_id: StreamId,
        expected: StreamVersion,
        actual: StreamVersion,
    },

    /// An appended event reused an identifier already present in the store.
    #[error("duplicate event id: {event_id}")]
    DuplicateEventId { event_id: EventId },

    /// Appends, truncation and deletion are not allowed on the global stream.
    #[error("cannot {operation} the global stream")]
    GlobalStreamNotWritable { operation: &'static str },

    /// The technical stream holding truncation and deletion markers cannot
    /// be truncated or deleted by callers.
    #[error("cannot {operation} the internal stream {stream_id}")]
    InternalStreamProtected {
        operation: &'static str,
        stream_id: StreamId,
    },

    /// The backing technology does not support this operation.
    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    /// The subscription was closed, or its producer went away.
    #[error("subscription to {stream_id} closed")]
    SubscriptionClosed { stream_id: StreamId },

    /// A type name had no entry in the event type registry.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// A processing handler failed.
    #[error("processor {processor} failed to handle event at position {position}")]
    Handler {
        processor: String,
        position: Position,
        #[source]
        source: anyhow::Error,
    },

    /// A processor could not load, persist or delete its checkpoint.
    #[error("processor {processor} failed to persist its checkpoint")]
    Checkpoint {
        processor: String,
        #[source]
        source: Box<EventStoreError>,
    },

    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Error from the relational backend.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Error talking to the log server.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The log server answered with an unexpected status.
    #[error("log server returned {status}: {message}")]
    LogServer { status: u16, message: String },

    /// The change feed feeding live subscriptions failed.
    #[error("change notification failed: {0}")]
    Notification(String),

    /// Payload or metadata (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lower-layer error annotated with the operation and stream it happened in.
    #[error("{operation} on stream {stream_id} failed: {source}")]
    Context {
        operation: &'static str,
        stream_id: StreamId,
        #[source]
        source: Box<EventStoreError>,
    },
}

impl EventStoreError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a stream not found error.
    pub fn stream_not_found(stream_id: &StreamId) -> Self {
        Self::StreamNotFound {
            stream_id: stream_id.clone(),
        }
    }

    /// Create a concurrency error.
    pub fn concurrency(stream_id: &StreamId, expected: StreamVersion, actual: StreamVersion) -> Self {
        Self::Concurrency {
            stream_id: stream_id.clone(),
            expected,
            actual,
        }
    }

    /// Create a not implemented error.
    pub fn not_implemented(backend: &'static str, operation: &'static str) -> Self {
        Self::NotImplemented { backend, operation }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wrap this error with the operation and stream it happened in.
    ///
    /// Errors that already name their stream or are meant to be matched on by
    /// callers are returned unchanged.
    pub fn with_context(self, operation: &'static str, stream_id: &StreamId) -> Self {
        match self {
            Self::StreamNotFound { .. }
            | Self::Concurrency { .. }
            | Self::DuplicateEventId { .. }
            | Self::GlobalStreamNotWritable { .. }
            | Self::InternalStreamProtected { .. }
            | Self::NotImplemented { .. }
            | Self::SubscriptionClosed { .. }
            | Self::Context { .. } => self,
            other => Self::Context {
                operation,
                stream_id: stream_id.clone(),
                source: Box::new(other),
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// The innermost error, looking through [`EventStoreError::Context`] wrapping.
    pub fn root(&self) -> &EventStoreError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StreamNotFound { .. } => ErrorCode::StreamNotFound,
            Self::Concurrency { .. } => ErrorCode::ConcurrencyConflict,
            Self::DuplicateEventId { .. } => ErrorCode::DuplicateEventId,
            Self::GlobalStreamNotWritable { .. } => ErrorCode::GlobalStreamNotWritable,
            Self::InternalStreamProtected { .. } => ErrorCode::InternalStreamProtected,
            Self::NotImplemented { .. } => ErrorCode::NotImplemented,
            Self::SubscriptionClosed { .. } => ErrorCode::SubscriptionClosed,
            Self::UnknownEventType(_) => ErrorCode::UnknownEventType,
            Self::Handler { .. } => ErrorCode::HandlerFailed,
            Self::Checkpoint { .. } => ErrorCode::CheckpointFailed,
            Self::Configuration(_) => ErrorCode::ConfigurationError,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Transport(_) => ErrorCode::TransportError,
            Self::LogServer { .. } => ErrorCode::LogServerError,
            Self::Notification(_) => ErrorCode::NotificationFailed,
            Self::Serialization(_) => ErrorCode::SerializationError,
            Self::Context { source, .. } => source.code(),
        }
    }

    /// Check if this is an optimistic concurrency violation.
    pub fn is_concurrency_error(&self) -> bool {
        matches!(self.root(), Self::Concurrency { .. })
    }

    /// Check if this error reports a missing stream.
    pub fn is_stream_not_found(&self) -> bool {
        matches!(self.root(), Self::StreamNotFound { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity and count it.
    pub fn log(&self) {
        let code = self.code();
        let category = code.category();

        counter!(
            "eventlog_errors_total",
            "code" => code.to_string(),
            "category" => category,
        )
        .increment(1);

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    error = %self,
                    "Event log operation failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    error = %self,
                    "Event log operation rejected"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    error = %self,
                    "Event log operation refused"
                );
            }
        }
    }
}

impl From<config::ConfigError> for EventStoreError {
    fn from(error: config::ConfigError) -> Self {
        Self::Configuration(error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding operation context to errors.
pub trait ErrorContext<T> {
    /// Annotate an error with the operation and stream it happened in.
    fn context(self, operation: &'static str, stream_id: &StreamId) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<EventStoreError>,
{
    fn context(self, operation: &'static str, stream_id: &StreamId) -> Result<T> {
        self.map_err(|e| e.into().with_context(operation, stream_id))
    }
}
