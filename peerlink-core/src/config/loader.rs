//! # Configuration Loader
//!
//! Loads and merges configuration from multiple sources:
//! 1. Default values (lowest priority)
//! 2. Configuration file (middle priority)
//! 3. Environment variables (highest priority)

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{PeerlinkConfig, ValidateConfig};
use crate::error::{PeerlinkError, Result};

const DEFAULT_ENV_PREFIX: &str = "PEERLINK";

/// Configuration loader with support for file and environment variable overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config loader with a specific config file path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Use a different environment variable prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn default_config_path() -> PathBuf {
        if let Ok(config_path) = env::var("PEERLINK_CONFIG") {
            return PathBuf::from(config_path);
        }

        let possible_paths = [
            PathBuf::from("peerlink.toml"),
            dirs::config_dir()
                .map(|d| d.join("peerlink").join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("/etc/peerlink/config.toml")),
            PathBuf::from("/etc/peerlink/config.toml"),
        ];

        for path in &possible_paths {
            if path.exists() {
                return path.clone();
            }
        }

        possible_paths[0].clone()
    }

    /// Load configuration with full hierarchy and validate the result.
    pub fn load(&self) -> Result<PeerlinkConfig> {
        let config = if self.config_path.exists() {
            debug!("Loading configuration from {}", self.config_path.display());
            self.load_from_file()?
        } else {
            PeerlinkConfig::default()
        };

        let config = self.merge_env_config(config)?;

        config.validate().map_err(|e| {
            PeerlinkError::configuration(format!("Configuration validation failed: {}", e))
        })?;

        Ok(config)
    }

    /// Missing sections and fields fall back to serde defaults.
    fn load_from_file(&self) -> Result<PeerlinkConfig> {
        let content = std::fs::read_to_string(&self.config_path).map_err(|e| {
            PeerlinkError::configuration(format!(
                "Failed to read config file '{}': {}",
                self.config_path.display(),
                e
            ))
        })?;

        toml::from_str(&content).map_err(|e| {
            PeerlinkError::configuration(format!(
                "Failed to parse config file '{}': {}",
                self.config_path.display(),
                e
            ))
        })
    }

    fn var(&self, name: &str) -> Option<String> {
        env::var(format!("{}_{}", self.env_prefix, name)).ok()
    }

    fn merge_env_config(&self, mut config: PeerlinkConfig) -> Result<PeerlinkConfig> {
        // Node
        if let Some(val) = self.var("NODE_ID") {
            config.node.node_id = Some(val);
        }
        if let Some(val) = self.var("NODE_REGION") {
            config.node.region = Some(parse_u64(&val, "NODE_REGION")? as u32);
        }
        if let Some(val) = self.var("LOG_LEVEL") {
            config.node.log_level = val;
        }

        // WebSocket
        if let Some(val) = self.var("WEBSOCKET_HOST") {
            config.websocket.host = val;
        }
        if let Some(val) = self.var("WEBSOCKET_PORT_MIN") {
            config.websocket.port_min = parse_port(&val, "WEBSOCKET_PORT_MIN")?;
        }
        if let Some(val) = self.var("WEBSOCKET_PORT_MAX") {
            config.websocket.port_max = parse_port(&val, "WEBSOCKET_PORT_MAX")?;
        }
        if let Some(val) = self.var("WEBSOCKET_TLS") {
            config.websocket.tls = parse_bool(&val, "WEBSOCKET_TLS")?;
        }
        if let Some(val) = self.var("WEBSOCKET_TLS_CERT_PATH") {
            config.websocket.tls_cert_path = Some(PathBuf::from(val));
        }
        if let Some(val) = self.var("WEBSOCKET_TLS_KEY_PATH") {
            config.websocket.tls_key_path = Some(PathBuf::from(val));
        }
        if let Some(val) = self.var("WEBSOCKET_CONNECT_TIMEOUT_MS") {
            config.websocket.connect_timeout_ms = parse_u64(&val, "WEBSOCKET_CONNECT_TIMEOUT_MS")?;
        }
        if let Some(val) = self.var("WEBSOCKET_ALLOW_PRIVATE_ADDRESSES") {
            config.websocket.allow_private_addresses = parse_bool(&val, "WEBSOCKET_ALLOW_PRIVATE_ADDRESSES")?;
        }

        // WebRTC
        if let Some(val) = self.var("WEBRTC_EXTERNAL_IP") {
            config.webrtc.external_ip = Some(val);
        }
        if let Some(val) = self.var("WEBRTC_CONNECT_TIMEOUT_MS") {
            config.webrtc.connect_timeout_ms = parse_u64(&val, "WEBRTC_CONNECT_TIMEOUT_MS")?;
        }
        if let Some(val) = self.var("WEBRTC_ALLOW_PRIVATE_ADDRESSES") {
            config.webrtc.allow_private_addresses = parse_bool(&val, "WEBRTC_ALLOW_PRIVATE_ADDRESSES")?;
        }

        // Connection management
        if let Some(val) = self.var("CONNECTION_MAX_CONNECTIONS") {
            config.connection.max_connections = parse_u64(&val, "CONNECTION_MAX_CONNECTIONS")? as usize;
        }
        if let Some(val) = self.var("CONNECTION_PRIVATE_CLIENT_MODE") {
            config.connection.private_client_mode = parse_bool(&val, "CONNECTION_PRIVATE_CLIENT_MODE")?;
        }
        if let Some(val) = self.var("CONNECTION_HANDSHAKE_TIMEOUT_MS") {
            config.connection.handshake_timeout_ms = parse_u64(&val, "CONNECTION_HANDSHAKE_TIMEOUT_MS")?;
        }

        Ok(config)
    }
}

fn parse_port(s: &str, name: &str) -> Result<u16> {
    s.parse::<u16>().map_err(|_| {
        PeerlinkError::configuration(format!("Invalid {} '{}': must be a port number", name, s))
    })
}

fn parse_u64(s: &str, name: &str) -> Result<u64> {
    s.parse::<u64>().map_err(|_| {
        PeerlinkError::configuration(format!("Invalid {} '{}': must be a positive integer", name, s))
    })
}

fn parse_bool(s: &str, name: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(PeerlinkError::configuration(format!(
            "Invalid {} '{}': must be 'true' or 'false'",
            name, s
        ))),
    }
}
