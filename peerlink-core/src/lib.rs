//! # Peerlink Core Library
//!
//! Connection substrate for peer-to-peer nodes.
//!
//! ## Architecture
//!
//! - **Connection**: raw bidirectional byte channels and their lifecycle
//! - **WebSocket**: client dials, inbound server, connectivity checks
//! - **WebRTC**: data channels negotiated over signalling
//! - **Handshake**: identity and version exchange on every new connection
//! - **ManagedConnection**: stable handle whose implementation may be replaced
//! - **ConnectionManager**: at most one connection per peer, race resolution
//! - **Simulator**: discrete-event network for socket-free tests
//!
//! ```text
//!  application ──send/subscribe──▶ ConnectionManager ──▶ ManagedConnection ──▶ Connection
//!                                        │                                     ▲
//!                                        └──connect──▶ ConnectorFacade ─────────┘
//!                                                      (WebSocket / WebRTC / Simulator)
//! ```

pub use peerlink_traits::*;
pub use peerlink_types::*;

pub mod error;

// Configuration module - TOML file, defaults and validation
pub mod config;

// Raw connections, addresses and role selection
pub mod connection;

// Wire frames shared by every transport
pub mod codec;

pub mod handshake;

pub mod managed_connection;

pub mod connector;

pub mod connection_manager;

pub mod connection_locker;

pub mod duplicate_detector;

// Signal relay over an existing transport
pub mod signalling;

pub mod transport;

pub mod websocket;

pub mod webrtc;

// Discrete-event network simulator
pub mod simulator;

pub use config::{ConfigLoader, PeerlinkConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionEvents, ConnectionId};
pub use connection_manager::ConnectionManager;
pub use connector::{ConnectorFacade, ConnectorHandler, DefaultConnectorFacade};
pub use error::{PeerlinkError, Result, TransportError};
pub use managed_connection::{Direction, ManagedConnection, ManagedConnectionEvent};
pub use simulator::{Simulator, SimulatorConfig, SimulatorConnector};
pub use transport::{Transport, TransportEvent, TransportEvents};
