use thiserror::Error;

/// Faults raised by the wire-protocol client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access refused: {0}")]
    AccessRefused(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

impl ProtocolError {
    /// Whether the fault means the link to the broker is gone, as opposed to a
    /// problem with the request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ProtocolError::Unreachable(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::ChannelClosed
        )
    }
}
