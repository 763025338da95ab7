//! # Error types
//!
//! Two layers:
//!
//! - [`TransportError`]: outcome of `send`/`connect` as seen by the router.
//!   Cheap to clone so one failure can be fanned out to every buffered send.
//! - [`PeerlinkError`]: crate-wide error for configuration, I/O, codecs and
//!   anything else that is not a per-send outcome.

use peerlink_types::{DisconnectReason, HandshakeError};
use thiserror::Error;

/// Failure taxonomy reported to callers of `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DialFailure,
    HandshakeRejected,
    Timeout,
    PeerDisconnected,
    SelfConnectionAttempt,
    CapacityExceeded,
    ProtocolViolation,
}

/// 发送/连接失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("cannot connect to self")]
    CannotConnectToSelf,

    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("port {port} outside configured range {min}-{max}")]
    PortOutOfRange { port: u16, min: u16, max: u16 },

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(HandshakeError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectReason),

    #[error("no connection to {0}")]
    NoConnection(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport stopped")]
    Stopped,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::CannotConnectToSelf => ErrorKind::SelfConnectionAttempt,
            TransportError::CapacityExceeded { .. } | TransportError::PortOutOfRange { .. } => {
                ErrorKind::CapacityExceeded
            }
            TransportError::DialFailed(_) | TransportError::NoConnection(_) => ErrorKind::DialFailure,
            TransportError::HandshakeRejected(_) => ErrorKind::HandshakeRejected,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::PeerDisconnected(_)
            | TransportError::SendFailed(_)
            | TransportError::Stopped => ErrorKind::PeerDisconnected,
            TransportError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// Everything except self-connection and capacity failures may succeed on
    /// a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::SelfConnectionAttempt | ErrorKind::CapacityExceeded
        )
    }

    /// Translate the reason a connection went away into the error seen by
    /// sends that were waiting on it.
    pub fn from_disconnect(reason: DisconnectReason, was_open: bool) -> Self {
        if was_open {
            return TransportError::PeerDisconnected(reason);
        }
        match reason {
            DisconnectReason::DeadConnection => TransportError::Timeout("dial deadline exceeded".into()),
            DisconnectReason::HandshakeTimeout => TransportError::Timeout("no handshake response".into()),
            DisconnectReason::DuplicateConnection => {
                TransportError::HandshakeRejected(HandshakeError::DuplicateConnection)
            }
            DisconnectReason::InvalidVersion => TransportError::HandshakeRejected(HandshakeError::InvalidVersion),
            DisconnectReason::InvalidTargetPeerDescriptor => {
                TransportError::HandshakeRejected(HandshakeError::InvalidTargetPeerDescriptor)
            }
            DisconnectReason::ProtocolViolation => {
                TransportError::ProtocolViolation("connection closed during handshake".into())
            }
            other => TransportError::DialFailed(other.to_string()),
        }
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum PeerlinkError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Simulator error: {0}")]
    Simulator(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PeerlinkError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn websocket(msg: impl Into<String>) -> Self {
        Self::WebSocket(msg.into())
    }

    pub fn webrtc(msg: impl Into<String>) -> Self {
        Self::WebRtc(msg.into())
    }

    pub fn simulator(msg: impl Into<String>) -> Self {
        Self::Simulator(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<bincode::Error> for PeerlinkError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for PeerlinkError {
    fn from(e: toml::de::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PeerlinkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PeerlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!TransportError::CannotConnectToSelf.is_retryable());
        assert!(!TransportError::CapacityExceeded { limit: 4 }.is_retryable());
        assert!(!TransportError::PortOutOfRange { port: 80, min: 40000, max: 40010 }.is_retryable());
        assert!(TransportError::DialFailed("refused".into()).is_retryable());
        assert!(TransportError::HandshakeRejected(HandshakeError::DuplicateConnection).is_retryable());
        assert!(TransportError::PeerDisconnected(DisconnectReason::Closed).is_retryable());
    }

    #[test]
    fn test_from_disconnect_before_and_after_open() {
        assert_eq!(
            TransportError::from_disconnect(DisconnectReason::DuplicateConnection, false).kind(),
            ErrorKind::HandshakeRejected
        );
        assert_eq!(
            TransportError::from_disconnect(DisconnectReason::DeadConnection, false).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            TransportError::from_disconnect(DisconnectReason::DuplicateConnection, true),
            TransportError::PeerDisconnected(DisconnectReason::DuplicateConnection)
        );
    }

    #[test]
    fn test_error_display() {
        let err = PeerlinkError::configuration("port_min > port_max");
        assert_eq!(err.to_string(), "Configuration error: port_min > port_max");
        let err: PeerlinkError = TransportError::CannotConnectToSelf.into();
        assert_eq!(err.to_string(), "cannot connect to self");
    }
}
