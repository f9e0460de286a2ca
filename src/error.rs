//! Error types for sweepq operations.
//!
//! Defines the error taxonomy shared by every queue backend and the
//! components built on top of them:
//! - Queue backend failures (transient and permanent)
//! - Compute function failures
//! - Configuration loading and validation

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by queue backends and the components driving them.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker connection lost or unreachable. Always retryable.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Channel or consumer group already exists (benign).
    #[error("Channel '{0}' already exists")]
    ChannelAlreadyExists(String),

    /// The delivery handle no longer owns its message.
    #[error("Delivery expired: {0}")]
    DeliveryExpired(String),

    /// The compute function failed for a chunk.
    #[error("Compute failed for chunk {chunk_id}: {reason}")]
    ComputeFailure { chunk_id: String, reason: String },

    /// A message exhausted its retry budget and was dead-lettered.
    #[error("Chunk {chunk_id} exhausted retries after {attempts} attempts")]
    RetriesExhausted { chunk_id: String, attempts: u32 },

    /// The backend has no equivalent for the requested operation.
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Invalid configuration or argument.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Message payload could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker answered with a non-transient protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An operation did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl QueueError {
    /// Returns whether the caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }

    /// Returns whether the error is a benign signal rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ChannelAlreadyExists(_) | Self::DeliveryExpired(_))
    }

    /// Process exit status for a command that failed with this error.
    ///
    /// 69 is `EX_UNAVAILABLE` from sysexits.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::BackendUnavailable(_) | Self::Timeout(_) => 69,
            Self::ComputeFailure { .. } => 70,
            _ => 1,
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP") {
            return QueueError::ChannelAlreadyExists(err.to_string());
        }
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
            || err.is_cluster_error()
        {
            return QueueError::BackendUnavailable(err.to_string());
        }
        QueueError::Protocol(err.to_string())
    }
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};

        match &err {
            lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_) => {
                QueueError::BackendUnavailable(err.to_string())
            }
            lapin::Error::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    QueueError::ChannelAlreadyExists(err.to_string())
                }
                AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => {
                    QueueError::BackendUnavailable(err.to_string())
                }
                _ => QueueError::Protocol(err.to_string()),
            },
            _ => QueueError::Protocol(err.to_string()),
        }
    }
}

/// Errors raised by the per-parameter compute function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("Parameter {param} rejected: {reason}")]
    InvalidParameter { param: u64, reason: String },

    #[error("Computation failed at parameter {param}: {reason}")]
    Failed { param: u64, reason: String },

    #[error("Compute task aborted: {0}")]
    Aborted(String),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::InvalidConfig(err.to_string())
    }
}
