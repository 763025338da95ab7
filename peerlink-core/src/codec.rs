//! Wire framing. Every transport carries whole frames, so no length prefix
//! is needed.

use bytes::Bytes;
use peerlink_types::{ConnectivityRequest, ConnectivityResponse, HandshakeRequest, HandshakeResponse, Message};
use serde::{Deserialize, Serialize};

use crate::error::{PeerlinkError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Message(Message),
    ConnectivityRequest(ConnectivityRequest),
    ConnectivityResponse(ConnectivityResponse),
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Frame> {
        bincode::deserialize(data)
            .map_err(|e| PeerlinkError::serialization(format!("malformed frame: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::HandshakeRequest(_) => "handshake-request",
            Frame::HandshakeResponse(_) => "handshake-response",
            Frame::Message(_) => "message",
            Frame::ConnectivityRequest(_) => "connectivity-request",
            Frame::ConnectivityResponse(_) => "connectivity-response",
        }
    }
}
