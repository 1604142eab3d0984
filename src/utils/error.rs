//! The `error` module defines the error types surfaced by the bus.
//!
//! Validation errors are returned before any I/O takes place. Connectivity
//! and publish errors are returned to the caller of the failing operation.
//! Errors raised while consuming never leave the consumer task; they are
//! handed to the configured consumer error strategy instead.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the crate.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// Encode or decode failure in a [`crate::serializer::Serializer`].
#[derive(Debug, Error)]
#[error("{operation} failed for {type_name}: {reason}")]
pub struct SerializationError {
    pub operation: &'static str,
    pub type_name: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// No broker link could be established in time.
    #[error("could not connect to the broker: {0}")]
    Connectivity(String),

    /// The operation needs a live connection and there is none.
    #[error("no broker connected")]
    NotConnected,

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("message type is incorrect: expected '{expected}', but was '{actual}'")]
    MessageTypeMismatch { expected: String, actual: String },

    #[error("publish failed: {0}")]
    PublishFailed(#[source] ProtocolError),

    #[error("invalid scheduling configuration ({parameter}): {reason}")]
    SchedulingConfig {
        parameter: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("message handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error("the bus has been shut down")]
    Shutdown,
}

impl BusError {
    pub fn scheduling(parameter: &'static str, reason: impl Into<String>) -> Self {
        BusError::SchedulingConfig {
            parameter,
            reason: reason.into(),
        }
    }

    /// Whether delivering the same message again could succeed. Type
    /// mismatches and undecodable bodies never will.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BusError::MessageTypeMismatch { .. } | BusError::Serialization(_)
        )
    }

    /// Whether the error means the broker link is down.
    pub fn is_connectivity(&self) -> bool {
        match self {
            BusError::Connectivity(_) | BusError::NotConnected => true,
            BusError::PublishFailed(e) | BusError::Protocol(e) => e.is_connectivity(),
            _ => false,
        }
    }

    /// Returns a short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::Connectivity(_) => "connectivity",
            BusError::NotConnected => "not_connected",
            BusError::Serialization(_) => "serialization",
            BusError::MessageTypeMismatch { .. } => "message_type_mismatch",
            BusError::PublishFailed(_) => "publish_failed",
            BusError::SchedulingConfig { .. } => "scheduling_config",
            BusError::Protocol(_) => "protocol",
            BusError::Handler(_) => "handler",
            BusError::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mismatch_is_not_retryable() {
        let err = BusError::MessageTypeMismatch {
            expected: "A".into(),
            actual: "B".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "message type is incorrect: expected 'A', but was 'B'"
        );
    }

    #[test]
    fn handler_failures_are_retryable() {
        let err = BusError::Handler("boom".into());
        assert!(err.is_retryable());
        assert_eq!(err.as_label(), "handler");
    }

    #[test]
    fn publish_failure_on_closed_channel_is_connectivity() {
        assert!(BusError::PublishFailed(ProtocolError::ChannelClosed).is_connectivity());
        assert!(!BusError::PublishFailed(ProtocolError::NotFound("x".into())).is_connectivity());
    }
}
