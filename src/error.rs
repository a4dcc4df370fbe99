//! Error types for trackstream.
//!
//! All errors are strongly typed using thiserror. The core performs no I/O,
//! so the taxonomy is narrow: configuration validation, and execution
//! failures around closed streams, timeouts and terminated components.

use thiserror::Error;

/// Validation errors raised while checking configuration and inputs.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Capacity for '{field}' must be greater than zero")]
    ZeroCapacity {
        field: String,
    },

    #[error("Sensor index {index} is negative")]
    NegativeSensorIndex {
        index: i32,
    },

    #[error("Interest set cannot be empty")]
    EmptyInterestSet,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors raised while streams are running.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Channel '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Component '{component}' has been shut down")]
    ShutDown {
        component: String,
    },

    #[error("Snapshot source failed: {message}")]
    SourceFailed {
        message: String,
    },

    #[error("Engine failed to start: {message}")]
    EngineStart {
        message: String,
    },
}

/// Top-level error type for trackstream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl StreamError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a disconnected channel error.
    #[must_use]
    pub fn disconnected(path: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::Disconnected { path: path.into() })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the error signals a regular end-of-stream.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Disconnected { .. }))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for trackstream operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_sensor_index() {
        let err = ValidationError::NegativeSensorIndex { index: -1 };
        let msg = format!("{err}");
        assert!(msg.contains("-1"));
        assert!(msg.contains("negative"));
    }

    #[test]
    fn test_validation_error_zero_capacity() {
        let err = ValidationError::ZeroCapacity {
            field: "stream_capacity".to_string(),
        };
        assert!(format!("{err}").contains("stream_capacity"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        let msg = format!("{err}");
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn test_stream_error_from_validation() {
        let err: StreamError = ValidationError::EmptyInterestSet.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stream_error_disconnected() {
        let err = StreamError::disconnected("live_stream");
        assert!(err.is_execution());
        assert!(err.is_disconnected());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("live_stream"));
    }

    #[test]
    fn test_stream_error_retryable() {
        let err: StreamError = ExecutionError::Timeout { duration_ms: 10 }.into();
        assert!(err.is_retryable());

        let err: StreamError = ExecutionError::ShutDown {
            component: "dispatcher".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stream_error_internal() {
        let err = StreamError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
