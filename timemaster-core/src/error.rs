//! # Error Types
//!
//! Error handling for the timemaster election protocol.

use thiserror::Error;

/// Error types that can occur while electing and heart-beating an active
/// participant.
///
/// Most coordination failures are not errors from the orchestrator's point of
/// view: they arrive as [`OpOutcome`](crate::coordination::OpOutcome) values
/// and are retried in place. This enum covers what does escape: malformed
/// payloads, fatal session loss, unusable configuration and an unavailable
/// time source.
///
/// # Examples
///
/// ```rust
/// use timemaster_core::TimeMasterError;
///
/// let error = TimeMasterError::Timeout { operation: "read /tm".to_string() };
/// assert!(error.is_retryable());
/// ```
#[derive(Error, Debug)]
pub enum TimeMasterError {
    /// Payload could not be encoded or decoded
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Session with the coordination service is gone
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// Operation exceeded its timeout limit
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// Coordination service refused the credentials of this session
    #[error("Authentication failed: {operation}")]
    AuthFailed { operation: String },

    /// No authoritative time could be obtained
    #[error("Time source unavailable: {message}")]
    TimeSourceUnavailable { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A channel between tasks was closed
    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system or network I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in the timemaster crates.
pub type Result<T> = std::result::Result<T, TimeMasterError>;

impl TimeMasterError {
    /// Creates a new codec error with the given message.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a new connection-lost error with the given reason.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Creates a new time source error with the given message.
    pub fn time_source(message: impl Into<String>) -> Self {
        Self::TimeSourceUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new configuration error with the given message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Creates a new internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Determines if this error condition is potentially recoverable.
    ///
    /// Timeouts, authentication hiccups and a missing time source are
    /// transient; everything else needs a fresh process or a fixed input.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use timemaster_core::TimeMasterError;
    ///
    /// assert!(TimeMasterError::time_source("all servers down").is_retryable());
    /// assert!(!TimeMasterError::codec("missing delimiter").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::AuthFailed { .. } | Self::TimeSourceUnavailable { .. }
        )
    }

    /// Whether the error ends this participant's role instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. } | Self::ChannelClosed { .. })
    }
}

impl From<anyhow::Error> for TimeMasterError {
    fn from(err: anyhow::Error) -> Self {
        TimeMasterError::Internal {
            message: err.to_string(),
        }
    }
}
