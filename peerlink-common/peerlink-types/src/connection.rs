//! 连接类型、断开原因与握手错误码

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport backing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    WebsocketClient,
    WebsocketServer,
    Webrtc,
    Simulator,
    /// Placeholder waiting for the real transport.
    Deferred,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::WebsocketClient => "websocket-client",
            ConnectionType::WebsocketServer => "websocket-server",
            ConnectionType::Webrtc => "webrtc",
            ConnectionType::Simulator => "simulator",
            ConnectionType::Deferred => "deferred",
        };
        f.write_str(name)
    }
}

/// 连接断开原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Closed locally or by the remote side without a specific reason.
    Closed,
    /// The transport never became writable within the dial deadline.
    DeadConnection,
    DuplicateConnection,
    InvalidVersion,
    InvalidTargetPeerDescriptor,
    HandshakeTimeout,
    ProtocolViolation,
    TransportError,
    Other,
}

impl DisconnectReason {
    /// Stable wire code, also used as the WebSocket close-frame reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Closed => "CLOSED",
            DisconnectReason::DeadConnection => "DEAD_CONNECTION",
            DisconnectReason::DuplicateConnection => "DUPLICATE_CONNECTION",
            DisconnectReason::InvalidVersion => "INVALID_VERSION",
            DisconnectReason::InvalidTargetPeerDescriptor => "INVALID_TARGET_PEER_DESCRIPTOR",
            DisconnectReason::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            DisconnectReason::ProtocolViolation => "PROTOCOL_VIOLATION",
            DisconnectReason::TransportError => "TRANSPORT_ERROR",
            DisconnectReason::Other => "OTHER",
        }
    }

    /// Reasons produced by a failed handshake.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            DisconnectReason::DuplicateConnection
                | DisconnectReason::InvalidVersion
                | DisconnectReason::InvalidTargetPeerDescriptor
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisconnectReason {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s {
            "CLOSED" => DisconnectReason::Closed,
            "DEAD_CONNECTION" => DisconnectReason::DeadConnection,
            "DUPLICATE_CONNECTION" => DisconnectReason::DuplicateConnection,
            "INVALID_VERSION" => DisconnectReason::InvalidVersion,
            "INVALID_TARGET_PEER_DESCRIPTOR" => DisconnectReason::InvalidTargetPeerDescriptor,
            "HANDSHAKE_TIMEOUT" => DisconnectReason::HandshakeTimeout,
            "PROTOCOL_VIOLATION" => DisconnectReason::ProtocolViolation,
            "TRANSPORT_ERROR" => DisconnectReason::TransportError,
            "OTHER" => DisconnectReason::Other,
            _ => return Err(()),
        };
        Ok(reason)
    }
}

/// Rejection code carried by a handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeError {
    DuplicateConnection,
    InvalidVersion,
    InvalidTargetPeerDescriptor,
    Other,
}

impl From<HandshakeError> for DisconnectReason {
    fn from(error: HandshakeError) -> Self {
        match error {
            HandshakeError::DuplicateConnection => DisconnectReason::DuplicateConnection,
            HandshakeError::InvalidVersion => DisconnectReason::InvalidVersion,
            HandshakeError::InvalidTargetPeerDescriptor => DisconnectReason::InvalidTargetPeerDescriptor,
            HandshakeError::Other => DisconnectReason::Other,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DisconnectReason::from(*self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_parse_back() {
        for reason in [
            DisconnectReason::Closed,
            DisconnectReason::DeadConnection,
            DisconnectReason::DuplicateConnection,
            DisconnectReason::InvalidTargetPeerDescriptor,
            DisconnectReason::Other,
        ] {
            assert_eq!(reason.as_str().parse::<DisconnectReason>(), Ok(reason));
        }
        assert!("NOPE".parse::<DisconnectReason>().is_err());
    }

    #[test]
    fn test_handshake_error_maps_to_reason() {
        let reason: DisconnectReason = HandshakeError::DuplicateConnection.into();
        assert_eq!(reason, DisconnectReason::DuplicateConnection);
        assert!(reason.is_handshake_rejection());
        assert!(!DisconnectReason::from(HandshakeError::Other).is_handshake_rejection());
    }
}
