//! # Transport
//!
//! Upward-facing interface consumed by routing layers.
//!
//! ## Example
//!
//! ```rust,ignore
//! async fn greet(transport: Arc<dyn Transport>, peer: PeerDescriptor) -> Result<(), TransportError> {
//!     let mut events = transport.subscribe();
//!     transport.send(Message::payload("app/greeter", b"hello".to_vec()).to(peer)).await?;
//!     while let Some(event) = events.recv().await {
//!         if let TransportEvent::Message(message) = event {
//!             println!("{:?}", message.payload_bytes());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use peerlink_types::{DisconnectReason, Message, NodeId, PeerDescriptor};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// 传输层事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A handshake completed and the peer is reachable.
    Connected(PeerDescriptor),
    /// A previously connected peer went away.
    Disconnected {
        peer: PeerDescriptor,
        reason: DisconnectReason,
    },
    /// Application message; `source_descriptor` is always set.
    Message(Message),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to its `target_descriptor`, connecting on demand.
    ///
    /// Fails immediately for the local node and when capacity is exhausted.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// New receiver for every event emitted from now on.
    fn subscribe(&self) -> TransportEvents;

    fn local_peer_descriptor(&self) -> PeerDescriptor;

    /// Peers with an open connection.
    fn connections(&self) -> Vec<PeerDescriptor>;

    fn has_connection(&self, node_id: &NodeId) -> bool;

    async fn stop(&self);
}
