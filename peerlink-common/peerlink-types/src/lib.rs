//! # peerlink-types
//!
//! Data model shared by every peerlink crate: peer identity, connection
//! classification and the messages exchanged over connections.

pub mod connection;
pub mod message;
pub mod peer;

pub use connection::{ConnectionType, DisconnectReason, HandshakeError};
pub use message::{
    is_compatible_version, ConnectivityRequest, ConnectivityResponse, HandshakeRequest,
    HandshakeResponse, Message, MessageBody, Signal, PROTOCOL_VERSION,
};
pub use peer::{ConnectivityMethod, NodeId, NodeIdParseError, NodeType, PeerDescriptor, NODE_ID_LENGTH};
