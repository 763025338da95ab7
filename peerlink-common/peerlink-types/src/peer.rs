//! 节点身份与可达性描述

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a node identifier in bytes.
pub const NODE_ID_LENGTH: usize = 20;

/// Error returned when parsing a [`NodeId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeIdParseError {
    #[error("invalid hex in node id: {0}")]
    InvalidHex(String),
    #[error("node id must be {NODE_ID_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
}

/// Fixed-length node identifier. Displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a random node id.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|e| NodeIdParseError::InvalidHex(e.to_string()))?;
        let bytes: [u8; NODE_ID_LENGTH] = raw
            .as_slice()
            .try_into()
            .map_err(|_| NodeIdParseError::InvalidLength(raw.len()))?;
        Ok(Self(bytes))
    }
}

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Node,
    Browser,
}

/// WebSocket 服务端可达地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectivityMethod {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ConnectivityMethod {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// `ws://host:port` or `wss://host:port`
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl fmt::Display for ConnectivityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Immutable identity and reachability record of a peer.
///
/// Equality and hashing only consider the node id, so a descriptor can be
/// used as a map key even when two copies carry different endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub websocket: Option<ConnectivityMethod>,
    #[serde(default)]
    pub region: Option<u32>,
}

impl PeerDescriptor {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            node_type: NodeType::Node,
            websocket: None,
            region: None,
        }
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_websocket(mut self, websocket: ConnectivityMethod) -> Self {
        self.websocket = Some(websocket);
        self
    }

    pub fn with_region(mut self, region: u32) -> Self {
        self.region = Some(region);
        self
    }

    pub fn is_browser(&self) -> bool {
        self.node_type == NodeType::Browser
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.websocket {
            Some(ws) => write!(f, "{}@{}", self.node_id.short(), ws),
            None => f.write_str(&self.node_id.short()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_round_trip() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_node_id_rejects_wrong_length() {
        let err = "abcd".parse::<NodeId>().unwrap_err();
        assert_eq!(err, NodeIdParseError::InvalidLength(2));
        assert!(matches!("zz".parse::<NodeId>(), Err(NodeIdParseError::InvalidHex(_))));
    }

    #[test]
    fn test_descriptor_equality_by_node_id() {
        let id = NodeId::random();
        let plain = PeerDescriptor::new(id);
        let with_ws = PeerDescriptor::new(id).with_websocket(ConnectivityMethod::new("example.org", 443, true));
        assert_eq!(plain, with_ws);
        assert_ne!(plain, PeerDescriptor::new(NodeId::random()));
    }

    #[test]
    fn test_connectivity_url() {
        assert_eq!(ConnectivityMethod::new("127.0.0.1", 40000, false).url(), "ws://127.0.0.1:40000");
        assert_eq!(ConnectivityMethod::new("example.org", 443, true).url(), "wss://example.org:443");
    }
}
