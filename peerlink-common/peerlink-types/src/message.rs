//! # Wire messages
//!
//! Everything that travels over an established connection:
//!
//! - [`HandshakeRequest`] / [`HandshakeResponse`]: identity exchange before a
//!   connection is trusted
//! - [`Message`]: routed envelope for payloads, signalling and lock control
//! - [`ConnectivityRequest`] / [`ConnectivityResponse`]: entry point probing

use serde::{Deserialize, Serialize};

use crate::connection::{DisconnectReason, HandshakeError};
use crate::peer::{ConnectivityMethod, PeerDescriptor};

/// Protocol version spoken by this implementation (`major.minor`).
pub const PROTOCOL_VERSION: &str = "1.0";

/// Two versions are compatible when their major components match.
pub fn is_compatible_version(local: &str, remote: &str) -> bool {
    fn major(version: &str) -> Option<u32> {
        version.split('.').next()?.trim().parse().ok()
    }
    match (major(local), major(remote)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Sent by the connecting side once the raw channel is writable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub source_descriptor: PeerDescriptor,
    /// Whom the sender believes it dialled. `None` when unknown, e.g. a dial
    /// to a bare entry point address.
    pub target_descriptor: Option<PeerDescriptor>,
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub source_descriptor: PeerDescriptor,
    pub protocol_version: String,
    pub error: Option<HandshakeError>,
}

impl HandshakeResponse {
    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// Out-of-band signalling relayed through an existing connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    /// Ask the receiver to dial the requester's WebSocket server.
    WebsocketConnectionRequest { requester: PeerDescriptor },
    /// Ask the receiver to start a WebRTC attempt as offerer.
    WebrtcConnectionRequest { requester: PeerDescriptor },
    RtcOffer {
        description: String,
        connection_id: String,
    },
    RtcAnswer {
        description: String,
        connection_id: String,
    },
    IceCandidate {
        candidate: String,
        mid: String,
        connection_id: String,
    },
}

/// 消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Payload(Vec<u8>),
    Signal(Signal),
    LockRequest { lock_id: String },
    UnlockRequest { lock_id: String },
    LockResponse { lock_id: String, accepted: bool },
    DisconnectNotice { reason: DisconnectReason },
}

/// Routed envelope exchanged between connection managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub service_id: String,
    pub source_descriptor: Option<PeerDescriptor>,
    pub target_descriptor: Option<PeerDescriptor>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(service_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            source_descriptor: None,
            target_descriptor: None,
            body,
        }
    }

    pub fn payload(service_id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(service_id, MessageBody::Payload(bytes.into()))
    }

    pub fn to(mut self, target: PeerDescriptor) -> Self {
        self.target_descriptor = Some(target);
        self
    }

    pub fn from_peer(mut self, source: PeerDescriptor) -> Self {
        self.source_descriptor = Some(source);
        self
    }

    pub fn payload_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            MessageBody::Payload(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Sent to an entry point to learn the externally visible address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityRequest {
    /// Port of the requester's WebSocket server, 0 when it has none.
    pub port: u16,
    pub tls: bool,
    /// Host the requester would like to be probed at, if it knows one.
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityResponse {
    /// Address the entry point saw the request come from.
    pub host: String,
    /// Set when the entry point managed to dial back.
    pub websocket: Option<ConnectivityMethod>,
    pub protocol_version: String,
}
