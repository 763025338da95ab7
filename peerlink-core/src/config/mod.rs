//! # Configuration
//!
//! Configuration for a peerlink node, split by concern:
//!
//! - `[node]`: identity and logging
//! - `[websocket]`: server port range, TLS advertisement, entry points
//! - `[webrtc]`: ICE servers, buffer watermarks, timeouts
//! - `[connection]`: handshake timeout, admission control, locking
//!
//! ## Loading
//!
//! ```rust,no_run
//! use peerlink_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load().unwrap();
//! ```
//!
//! Values are merged from defaults, then the TOML file, then `PEERLINK_*`
//! environment variables, and validated last.

mod loader;

pub use loader::ConfigLoader;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use peerlink_types::{ConnectivityMethod, NodeId, NodeType, PeerDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::{PeerlinkError, Result};

pub const DEFAULT_WEBSOCKET_HOST: &str = "127.0.0.1";
pub const DEFAULT_WEBSOCKET_PORT_MIN: u16 = 40200;
pub const DEFAULT_WEBSOCKET_PORT_MAX: u16 = 40300;
pub const DEFAULT_WEBSOCKET_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_WEBRTC_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_WEBRTC_EARLY_TIMEOUT_MS: u64 = 5_000;
/// 2^17 bytes
pub const DEFAULT_BUFFER_THRESHOLD_HIGH: usize = 1 << 17;
/// 2^15 bytes
pub const DEFAULT_BUFFER_THRESHOLD_LOW: usize = 1 << 15;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_DUPLICATE_DETECTOR_CAPACITY: usize = 10_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Validate configuration values
pub trait ValidateConfig {
    fn validate(&self) -> Result<()>;
}

fn validation_error(msg: impl Into<String>) -> PeerlinkError {
    PeerlinkError::configuration(format!("Validation error: {}", msg.into()))
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerlinkConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub webrtc: WebrtcConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl ValidateConfig for PeerlinkConfig {
    fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.websocket.validate()?;
        self.webrtc.validate()?;
        self.connection.validate()?;
        Ok(())
    }
}

impl PeerlinkConfig {
    /// Build the local descriptor from configuration. The websocket endpoint
    /// is filled in later by the server once it has bound a port.
    pub fn local_peer_descriptor(&self) -> Result<PeerDescriptor> {
        let node_id = match &self.node.node_id {
            Some(hex) => hex
                .parse::<NodeId>()
                .map_err(|e| validation_error(format!("node.node_id: {}", e)))?,
            None => NodeId::random(),
        };
        let mut descriptor = PeerDescriptor::new(node_id).with_node_type(self.node.node_type);
        if let Some(region) = self.node.region {
            descriptor = descriptor.with_region(region);
        }
        Ok(descriptor)
    }

    /// Render as TOML, used by `peerlink-node config`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PeerlinkError::serialization(e.to_string()))
    }
}

/// `[node]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hex node id. A random id is generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: NodeType,
    /// Region tag used by the simulator's region latency model.
    #[serde(default)]
    pub region: Option<u32>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_type: NodeType::Node,
            region: None,
            log_level: default_log_level(),
        }
    }
}

impl ValidateConfig for NodeConfig {
    fn validate(&self) -> Result<()> {
        if let Some(hex) = &self.node_id {
            hex.parse::<NodeId>()
                .map_err(|e| validation_error(format!("node.node_id: {}", e)))?;
        }
        Ok(())
    }
}

/// An entry point used for the initial connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointConfig {
    #[serde(default)]
    pub node_id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

impl EntryPointConfig {
    pub fn connectivity_method(&self) -> ConnectivityMethod {
        ConnectivityMethod::new(self.host.clone(), self.port, self.tls)
    }
}

/// `[websocket]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    /// Run a WebSocket server. Ignored in private-client mode.
    #[serde(default = "default_true")]
    pub server_enabled: bool,
    #[serde(default = "default_websocket_host")]
    pub host: String,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Advertise `wss://`. TLS is terminated in front of the node.
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default = "default_websocket_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Accept sockets from private and loopback addresses.
    #[serde(default)]
    pub allow_private_addresses: bool,
    #[serde(default)]
    pub entry_points: Vec<EntryPointConfig>,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            server_enabled: true,
            host: default_websocket_host(),
            port_min: DEFAULT_WEBSOCKET_PORT_MIN,
            port_max: DEFAULT_WEBSOCKET_PORT_MAX,
            tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            connect_timeout_ms: DEFAULT_WEBSOCKET_CONNECT_TIMEOUT_MS,
            allow_private_addresses: false,
            entry_points: Vec::new(),
        }
    }
}

impl WebsocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn port_in_range(&self, port: u16) -> bool {
        (self.port_min..=self.port_max).contains(&port)
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_min = min;
        self.port_max = max;
        self
    }

    pub fn with_private_addresses(mut self, allow: bool) -> Self {
        self.allow_private_addresses = allow;
        self
    }
}

impl ValidateConfig for WebsocketConfig {
    fn validate(&self) -> Result<()> {
        if self.port_min == 0 || self.port_min > self.port_max {
            return Err(validation_error(format!(
                "websocket port range {}-{} is invalid",
                self.port_min, self.port_max
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(validation_error("websocket.connect_timeout_ms must be > 0"));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(validation_error(
                "websocket.tls_cert_path and websocket.tls_key_path must be set together",
            ));
        }
        if self.host.trim().is_empty() {
            return Err(validation_error("websocket.host must not be empty"));
        }
        Ok(())
    }
}

/// STUN/TURN server handed to the WebRTC platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// `[webrtc]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_buffer_threshold_low")]
    pub buffer_threshold_low: usize,
    #[serde(default = "default_buffer_threshold_high")]
    pub buffer_threshold_high: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_webrtc_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for the remote description to arrive.
    #[serde(default = "default_webrtc_early_timeout_ms")]
    pub early_timeout_ms: u64,
    /// Replaces the address of local host candidates.
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub allow_private_addresses: bool,
    #[serde(default)]
    pub port_min: Option<u16>,
    #[serde(default)]
    pub port_max: Option<u16>,
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            buffer_threshold_low: DEFAULT_BUFFER_THRESHOLD_LOW,
            buffer_threshold_high: DEFAULT_BUFFER_THRESHOLD_HIGH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout_ms: DEFAULT_WEBRTC_CONNECT_TIMEOUT_MS,
            early_timeout_ms: DEFAULT_WEBRTC_EARLY_TIMEOUT_MS,
            external_ip: None,
            allow_private_addresses: false,
            port_min: None,
            port_max: None,
        }
    }
}

impl WebrtcConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn early_timeout(&self) -> Duration {
        Duration::from_millis(self.early_timeout_ms)
    }
}

impl ValidateConfig for WebrtcConfig {
    fn validate(&self) -> Result<()> {
        if self.buffer_threshold_low >= self.buffer_threshold_high {
            return Err(validation_error(format!(
                "webrtc.buffer_threshold_low ({}) must be below buffer_threshold_high ({})",
                self.buffer_threshold_low, self.buffer_threshold_high
            )));
        }
        if self.connect_timeout_ms == 0 || self.early_timeout_ms == 0 {
            return Err(validation_error("webrtc timeouts must be > 0"));
        }
        if self.max_message_size == 0 {
            return Err(validation_error("webrtc.max_message_size must be > 0"));
        }
        if let Some(ip) = &self.external_ip {
            ip.parse::<IpAddr>()
                .map_err(|_| validation_error(format!("webrtc.external_ip '{}' is not an IP address", ip)))?;
        }
        if let (Some(min), Some(max)) = (self.port_min, self.port_max) {
            if min > max {
                return Err(validation_error(format!("webrtc port range {}-{} is invalid", min, max)));
            }
        }
        Ok(())
    }
}

/// `[connection]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,
    /// Outbound-only: no server, unsolicited inbound handshakes are rejected.
    #[serde(default)]
    pub private_client_mode: bool,
    /// Grace period between a disconnect notice and the actual close.
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_duplicate_detector_capacity")]
    pub duplicate_detector_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_connections: 0,
            private_client_mode: false,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            duplicate_detector_capacity: DEFAULT_DUPLICATE_DETECTOR_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_private_client_mode(mut self, enabled: bool) -> Self {
        self.private_client_mode = enabled;
        self
    }
}

impl ValidateConfig for ConnectionConfig {
    fn validate(&self) -> Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(validation_error("connection.handshake_timeout_ms must be > 0"));
        }
        if self.duplicate_detector_capacity == 0 {
            return Err(validation_error("connection.duplicate_detector_capacity must be > 0"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_websocket_host() -> String {
    DEFAULT_WEBSOCKET_HOST.to_string()
}

fn default_port_min() -> u16 {
    DEFAULT_WEBSOCKET_PORT_MIN
}

fn default_port_max() -> u16 {
    DEFAULT_WEBSOCKET_PORT_MAX
}

fn default_websocket_connect_timeout_ms() -> u64 {
    DEFAULT_WEBSOCKET_CONNECT_TIMEOUT_MS
}

fn default_buffer_threshold_low() -> usize {
    DEFAULT_BUFFER_THRESHOLD_LOW
}

fn default_buffer_threshold_high() -> usize {
    DEFAULT_BUFFER_THRESHOLD_HIGH
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_webrtc_connect_timeout_ms() -> u64 {
    DEFAULT_WEBRTC_CONNECT_TIMEOUT_MS
}

fn default_webrtc_early_timeout_ms() -> u64 {
    DEFAULT_WEBRTC_EARLY_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_disconnect_timeout_ms() -> u64 {
    DEFAULT_DISCONNECT_TIMEOUT_MS
}

fn default_duplicate_detector_capacity() -> usize {
    DEFAULT_DUPLICATE_DETECTOR_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PeerlinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.webrtc.buffer_threshold_high, 131_072);
        assert_eq!(config.webrtc.buffer_threshold_low, 32_768);
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let ws = WebsocketConfig::default().with_port_range(50000, 40000);
        assert!(ws.validate().is_err());
    }

    #[test]
    fn test_watermarks_must_be_ordered() {
        let webrtc = WebrtcConfig {
            buffer_threshold_low: 1 << 17,
            buffer_threshold_high: 1 << 15,
            ..Default::default()
        };
        assert!(webrtc.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PeerlinkConfig = toml::from_str(
            r#"
            [websocket]
            port_min = 41000
            port_max = 41010

            [connection]
            max_connections = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.websocket.port_min, 41000);
        assert_eq!(config.websocket.host, DEFAULT_WEBSOCKET_HOST);
        assert_eq!(config.connection.max_connections, 32);
        assert_eq!(config.connection.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_descriptor_uses_configured_id() {
        let id = NodeId::random();
        let mut config = PeerlinkConfig::default();
        config.node.node_id = Some(id.to_hex());
        config.node.region = Some(3);
        let descriptor = config.local_peer_descriptor().unwrap();
        assert_eq!(descriptor.node_id, id);
        assert_eq!(descriptor.region, Some(3));
    }

    #[test]
    fn test_config_renders_as_toml() {
        let rendered = PeerlinkConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[websocket]"));
        assert!(rendered.contains("port_min = 40200"));
    }
}
