//! # Connection Manager
//!
//! Owns the peer registry: at most one [`ManagedConnection`] per node id.
//!
//! ## Features
//!
//! - Connections are created on demand by `send`; there is no background
//!   reconnect loop
//! - Concurrent attempts from both ends converge on one connection
//! - Received messages are de-duplicated and published as
//!   [`TransportEvent::Message`]
//! - Connection locks keep wanted connections alive; `disconnect` only
//!   tears down unlocked ones
//!
//! ## Race resolution (inbound handshake for peer P)
//!
//! ```text
//!  registry[P]                          action
//!  ─────────────────────────────────    ────────────────────────────────────
//!  none / closed                        accept, register new incoming entry
//!  same raw connection (passive)        accept
//!  open                                 reject DUPLICATE_CONNECTION
//!  pending, our attempt, we offer       reject DUPLICATE_CONNECTION
//!  pending otherwise                    accept, replace, close displaced
//! ```

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_traits::{HealthStatus, Lifecycle, Named};
use peerlink_types::{DisconnectReason, HandshakeError, HandshakeRequest, Message, MessageBody, NodeId, PeerDescriptor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::Frame;
use crate::config::{ConnectionConfig, PeerlinkConfig};
use crate::connection::role::is_offering;
use crate::connection::ConnectionEvents;
use crate::connection_locker::ConnectionLocker;
use crate::connector::{ConnectorFacade, ConnectorHandler, DefaultConnectorFacade};
use crate::duplicate_detector::DuplicateDetector;
use crate::error::{PeerlinkError, Result, TransportError};
use crate::handshake::Handshaker;
use crate::managed_connection::{Direction, ManagedConnection, ManagedConnectionEvent, ManagedConnectionEvents};
use crate::signalling::{SignalRelay, TransportSignalRelay};
use crate::simulator::{Simulator, SimulatorConnector};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::webrtc::RtcPlatform;

/// Service id of lock and disconnect notices.
pub const CONNECTION_LOCKER_SERVICE_ID: &str = "system/connection-locker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Stopped,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    facade: Arc<dyn ConnectorFacade>,
    registry: Mutex<HashMap<NodeId, Arc<ManagedConnection>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    duplicates: Mutex<DuplicateDetector>,
    locks: Mutex<ConnectionLocker>,
    disconnect_timers: Mutex<HashMap<NodeId, CancellationToken>>,
    state: Mutex<RunState>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, facade: Arc<dyn ConnectorFacade>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            duplicates: Mutex::new(DuplicateDetector::new(config.duplicate_detector_capacity)),
            config,
            facade,
            registry: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            locks: Mutex::new(ConnectionLocker::new()),
            disconnect_timers: Mutex::new(HashMap::new()),
            state: Mutex::new(RunState::Created),
            this: this.clone(),
        })
    }

    /// Manager whose connections run over `simulator`.
    pub fn simulated(local: PeerDescriptor, simulator: &Simulator, config: ConnectionConfig) -> Arc<Self> {
        let connector = SimulatorConnector::new(local, simulator.clone(), config.handshake_timeout());
        Self::new(config, connector)
    }

    /// Manager over real transports. `signalling` carries WebRTC and
    /// connection-request signals; without it only direct WebSocket dials
    /// are possible.
    pub fn from_config(config: &PeerlinkConfig, signalling: Option<Arc<dyn Transport>>) -> Result<Arc<Self>> {
        let relay = signalling.map(|carrier| TransportSignalRelay::new(carrier) as Arc<dyn SignalRelay>);
        let facade = DefaultConnectorFacade::new(config, relay)?;
        Ok(Self::new(config.connection.clone(), facade))
    }

    /// Like [`from_config`](Self::from_config), with WebRTC on `platform`.
    pub fn with_rtc_platform(
        config: &PeerlinkConfig,
        signalling: Option<Arc<dyn Transport>>,
        platform: Arc<dyn RtcPlatform>,
    ) -> Result<Arc<Self>> {
        let relay = signalling.map(|carrier| TransportSignalRelay::new(carrier) as Arc<dyn SignalRelay>);
        let facade = DefaultConnectorFacade::with_rtc_platform(config, relay, Some(platform))?;
        Ok(Self::new(config.connection.clone(), facade))
    }

    /// Start the connectors. Inbound connections are accepted from here on.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                RunState::Created => *state = RunState::Running,
                RunState::Running => return Ok(()),
                RunState::Stopped => return Err(PeerlinkError::internal("connection manager already stopped")),
            }
        }
        let handler: Arc<dyn ConnectorHandler> = self
            .this
            .upgrade()
            .ok_or_else(|| PeerlinkError::internal("connection manager dropped"))?;
        if let Err(e) = self.facade.start(handler).await {
            *self.state.lock() = RunState::Stopped;
            return Err(e);
        }
        info!("Connection manager started as {}", self.local_peer_descriptor());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == RunState::Running
    }

    pub fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.facade.local_peer_descriptor()
    }

    pub fn subscribe(&self) -> TransportEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: TransportEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Send `message` to its target, connecting first if needed.
    ///
    /// Resolves once the bytes are handed to the transport; for a new
    /// connection that is after its handshake completes.
    pub async fn send(&self, mut message: Message) -> std::result::Result<(), TransportError> {
        let target = message
            .target_descriptor
            .clone()
            .ok_or_else(|| TransportError::NoConnection("message has no target".into()))?;
        let local = self.local_peer_descriptor();
        if target.node_id == local.node_id {
            return Err(TransportError::CannotConnectToSelf);
        }
        match *self.state.lock() {
            RunState::Running => {}
            RunState::Created => return Err(TransportError::NoConnection("transport not started".into())),
            RunState::Stopped => return Err(TransportError::Stopped),
        }
        if message.source_descriptor.is_none() {
            message.source_descriptor = Some(local.clone());
        }
        trace!("Sending {} ({}) to {}", message.message_id, message.service_id, target);
        let data = Frame::Message(message)
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let managed = self.connection_for(&target, &local)?;
        managed.send(data).await
    }

    pub async fn send_payload(
        &self,
        target: &PeerDescriptor,
        service_id: &str,
        payload: impl Into<Vec<u8>>,
    ) -> std::result::Result<(), TransportError> {
        self.send(Message::payload(service_id, payload).to(target.clone())).await
    }

    /// Live entry for `target`, or a new outgoing one.
    fn connection_for(
        &self,
        target: &PeerDescriptor,
        local: &PeerDescriptor,
    ) -> std::result::Result<Arc<ManagedConnection>, TransportError> {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.get(&target.node_id) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        self.check_capacity(&registry)?;

        let (managed, events) = ManagedConnection::new(local.clone(), target.clone(), Direction::Outgoing);
        if let Err(e) = self.facade.connect(&managed) {
            managed.destroy();
            return Err(e);
        }
        debug!(
            "New outgoing connection {} to {}",
            managed.object_id(),
            target.node_id.short()
        );
        registry.insert(target.node_id, managed.clone());
        self.spawn_observer(managed.clone(), events);
        Ok(managed)
    }

    fn check_capacity(
        &self,
        registry: &HashMap<NodeId, Arc<ManagedConnection>>,
    ) -> std::result::Result<(), TransportError> {
        let limit = self.config.max_connections;
        if limit == 0 {
            return Ok(());
        }
        let live = registry.values().filter(|m| !m.is_closed()).count();
        if live >= limit {
            return Err(TransportError::CapacityExceeded { limit });
        }
        Ok(())
    }

    fn live_connection(&self, node_id: &NodeId) -> Option<Arc<ManagedConnection>> {
        self.registry
            .lock()
            .get(node_id)
            .filter(|m| !m.is_closed())
            .cloned()
    }

    /// Registered and not closed (possibly still connecting).
    pub fn has_connection(&self, node_id: &NodeId) -> bool {
        self.live_connection(node_id).is_some()
    }

    pub fn connection(&self, node_id: &NodeId) -> Option<Arc<ManagedConnection>> {
        self.live_connection(node_id)
    }

    /// Peers whose handshake has completed.
    pub fn connections(&self) -> Vec<PeerDescriptor> {
        self.registry
            .lock()
            .values()
            .filter(|m| m.is_open())
            .map(|m| m.remote_peer_descriptor())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().values().filter(|m| !m.is_closed()).count()
    }

    fn spawn_observer(&self, managed: Arc<ManagedConnection>, mut events: ManagedConnectionEvents) {
        let manager = self.this.clone();
        tokio::spawn(async move {
            let mut connected = false;
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                match event {
                    ManagedConnectionEvent::HandshakeCompleted(peer) => {
                        connected = true;
                        manager.emit(TransportEvent::Connected(peer));
                    }
                    ManagedConnectionEvent::Data(data) => manager.on_data(&managed, data),
                    ManagedConnectionEvent::Disconnected(reason) => {
                        manager.on_managed_disconnected(&managed, reason, connected);
                        break;
                    }
                }
            }
        });
    }

    fn on_managed_disconnected(&self, managed: &Arc<ManagedConnection>, reason: DisconnectReason, connected: bool) {
        let peer = managed.remote_peer_descriptor();
        let evicted = {
            let mut registry = self.registry.lock();
            match registry.get(&peer.node_id) {
                Some(current) if Arc::ptr_eq(current, managed) => {
                    registry.remove(&peer.node_id);
                    true
                }
                _ => false,
            }
        };
        if evicted {
            self.locks.lock().clear(&peer.node_id);
            self.cancel_disconnect(&peer.node_id);
        }
        debug!(
            "Connection {} to {} closed: {} (was connected: {})",
            managed.object_id(),
            peer.node_id.short(),
            reason,
            connected
        );
        if connected {
            self.emit(TransportEvent::Disconnected { peer, reason });
        }
    }

    fn on_data(&self, managed: &Arc<ManagedConnection>, data: Bytes) {
        let mut message = match Frame::decode(&data) {
            Ok(Frame::Message(message)) => message,
            Ok(other) => {
                warn!("Unexpected {} frame on an open connection", other.name());
                return;
            }
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                return;
            }
        };
        let peer = managed.remote_peer_descriptor();
        message.source_descriptor = Some(peer.clone());

        if self.duplicates.lock().check_and_add(&message.message_id) {
            trace!("Duplicate message {} from {}", message.message_id, peer.node_id.short());
            return;
        }

        match &message.body {
            MessageBody::LockRequest { lock_id } => self.on_lock_request(&peer, lock_id.clone()),
            MessageBody::UnlockRequest { lock_id } => self.on_unlock_request(&peer, lock_id),
            MessageBody::LockResponse { lock_id, accepted } => {
                debug!("Lock {} on {} accepted: {}", lock_id, peer.node_id.short(), accepted)
            }
            MessageBody::DisconnectNotice { reason } => self.on_disconnect_notice(&peer, *reason),
            MessageBody::Payload(_) | MessageBody::Signal(_) => self.emit(TransportEvent::Message(message)),
        }
    }

    // ----- connection locking -----

    /// Keep the connection to `peer` and ask the peer to keep it too.
    pub async fn lock_connection(&self, peer: &PeerDescriptor, lock_id: &str) -> std::result::Result<(), TransportError> {
        self.cancel_disconnect(&peer.node_id);
        self.locks.lock().lock_local(peer.node_id, lock_id);
        let request = Message::new(
            CONNECTION_LOCKER_SERVICE_ID,
            MessageBody::LockRequest {
                lock_id: lock_id.to_string(),
            },
        );
        self.send(request.to(peer.clone())).await
    }

    /// Release a lock; an unlocked connection is disconnected.
    pub async fn unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        let unlocked = {
            let mut locks = self.locks.lock();
            locks.unlock_local(&peer.node_id, lock_id);
            !locks.is_locked(&peer.node_id)
        };
        if self.has_connection(&peer.node_id) {
            let request = Message::new(
                CONNECTION_LOCKER_SERVICE_ID,
                MessageBody::UnlockRequest {
                    lock_id: lock_id.to_string(),
                },
            );
            if let Err(e) = self.send(request.to(peer.clone())).await {
                debug!("Unlock notice to {} not delivered: {}", peer.node_id.short(), e);
            }
        }
        if unlocked {
            self.disconnect(peer);
        }
    }

    /// Lock without telling the peer.
    pub fn weak_lock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        self.cancel_disconnect(&peer.node_id);
        self.locks.lock().weak_lock(peer.node_id, lock_id);
    }

    pub fn weak_unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        self.locks.lock().weak_unlock(&peer.node_id, lock_id);
    }

    pub fn is_connection_locked(&self, node_id: &NodeId) -> bool {
        self.locks.lock().is_locked(node_id)
    }

    pub fn has_local_locked_connection(&self, node_id: &NodeId, lock_id: Option<&str>) -> bool {
        self.locks.lock().has_local_lock(node_id, lock_id)
    }

    pub fn has_remote_locked_connection(&self, node_id: &NodeId, lock_id: Option<&str>) -> bool {
        self.locks.lock().has_remote_lock(node_id, lock_id)
    }

    pub fn locked_connection_count(&self) -> usize {
        self.locks.lock().locked_count()
    }

    fn on_lock_request(&self, peer: &PeerDescriptor, lock_id: String) {
        self.cancel_disconnect(&peer.node_id);
        self.locks.lock().lock_remote(peer.node_id, &lock_id);
        let response = Message::new(
            CONNECTION_LOCKER_SERVICE_ID,
            MessageBody::LockResponse { lock_id, accepted: true },
        )
        .to(peer.clone());
        let manager = self.this.clone();
        tokio::spawn(async move {
            if let Some(manager) = manager.upgrade() {
                if let Err(e) = manager.send(response).await {
                    debug!("Lock response not delivered: {}", e);
                }
            }
        });
    }

    fn on_unlock_request(&self, peer: &PeerDescriptor, lock_id: &str) {
        let unlocked = {
            let mut locks = self.locks.lock();
            locks.unlock_remote(&peer.node_id, lock_id);
            !locks.is_locked(&peer.node_id)
        };
        if unlocked {
            self.disconnect(peer);
        }
    }

    fn on_disconnect_notice(&self, peer: &PeerDescriptor, reason: DisconnectReason) {
        debug!("{} is disconnecting: {}", peer.node_id.short(), reason);
        let locked = {
            let mut locks = self.locks.lock();
            locks.clear_remote(&peer.node_id);
            locks.is_locked(&peer.node_id)
        };
        if !locked {
            self.close_connection(&peer.node_id, DisconnectReason::Closed);
        }
    }

    /// Gracefully disconnect an unlocked peer: notify it, then close after
    /// the disconnect timeout unless it closes first or a lock is taken.
    /// Returns false if the peer is locked or not connected.
    pub fn disconnect(&self, peer: &PeerDescriptor) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.locks.lock().is_locked(&peer.node_id) {
            debug!("Not disconnecting locked connection to {}", peer.node_id.short());
            return false;
        }
        let Some(managed) = self.live_connection(&peer.node_id) else {
            return false;
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.disconnect_timers.lock().insert(peer.node_id, token.clone()) {
            previous.cancel();
        }
        let notice = Frame::Message(
            Message::new(
                CONNECTION_LOCKER_SERVICE_ID,
                MessageBody::DisconnectNotice {
                    reason: DisconnectReason::Closed,
                },
            )
            .from_peer(self.local_peer_descriptor())
            .to(peer.clone()),
        )
        .encode();
        let manager = self.this.clone();
        let node_id = peer.node_id;
        let timeout = self.config.disconnect_timeout();
        tokio::spawn(async move {
            if managed.is_open() {
                if let Ok(notice) = notice {
                    let _ = managed.send(notice).await;
                }
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.disconnect_timers.lock().remove(&node_id);
                        if !manager.is_connection_locked(&node_id) {
                            manager.close_connection(&node_id, DisconnectReason::Closed);
                        }
                    }
                }
            }
        });
        true
    }

    fn cancel_disconnect(&self, node_id: &NodeId) {
        if let Some(token) = self.disconnect_timers.lock().remove(node_id) {
            token.cancel();
        }
    }

    fn close_connection(&self, node_id: &NodeId, reason: DisconnectReason) {
        let managed = self.registry.lock().remove(node_id);
        if let Some(managed) = managed {
            self.locks.lock().clear(node_id);
            managed.close(reason);
        }
    }

    /// Close every connection and stop the connectors. Subscribers see the
    /// remaining disconnects and then the end of their stream.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Stopped;
        }
        for (_, token) in self.disconnect_timers.lock().drain() {
            token.cancel();
        }
        let connections: Vec<Arc<ManagedConnection>> = self.registry.lock().drain().map(|(_, m)| m).collect();
        info!("Stopping connection manager, closing {} connections", connections.len());
        for managed in connections {
            managed.close(DisconnectReason::Closed);
        }
        self.facade.stop().await;
        // let observers deliver the final disconnects before the streams end
        tokio::task::yield_now().await;
        self.subscribers.lock().clear();
    }
}

impl ConnectorHandler for ConnectionManager {
    fn on_handshake_request(&self, request: HandshakeRequest, mut handshaker: Handshaker, events: ConnectionEvents) {
        let peer = request.source_descriptor;
        let connection = handshaker.connection().clone();
        let local = self.local_peer_descriptor();

        let mut registry = self.registry.lock();
        if !self.is_running() {
            handshaker.reject(HandshakeError::Other);
            return;
        }
        let existing = registry.get(&peer.node_id).filter(|m| !m.is_closed()).cloned();
        match existing {
            None => {
                if self.config.private_client_mode {
                    debug!("Private client: refusing inbound connection from {}", peer.node_id.short());
                    handshaker.reject(HandshakeError::Other);
                    return;
                }
                if self.check_capacity(&registry).is_err() {
                    warn!("Connection limit reached, refusing {}", peer.node_id.short());
                    handshaker.reject(HandshakeError::Other);
                    return;
                }
                if handshaker.accept().is_err() {
                    return;
                }
                let (managed, managed_events) = ManagedConnection::new(local, peer.clone(), Direction::Incoming);
                debug!("New incoming connection {} from {}", managed.object_id(), peer.node_id.short());
                registry.insert(peer.node_id, managed.clone());
                self.spawn_observer(managed.clone(), managed_events);
                managed.accept_incoming(connection, peer, events);
            }
            Some(managed) if managed.is_implementation(connection.connection_id()) => {
                if handshaker.accept().is_ok() {
                    managed.accept_incoming(connection, peer, events);
                }
            }
            Some(managed) if managed.is_open() => {
                debug!("Already connected to {}, rejecting duplicate", peer.node_id.short());
                handshaker.reject(HandshakeError::DuplicateConnection);
            }
            Some(managed) if managed.has_outgoing_attempt() && is_offering(&local.node_id, &peer.node_id) => {
                debug!(
                    "Keeping our attempt to {} over its concurrent one",
                    peer.node_id.short()
                );
                handshaker.reject(HandshakeError::DuplicateConnection);
            }
            Some(managed) => {
                if handshaker.accept().is_err() {
                    return;
                }
                if let Some(displaced) = managed.accept_incoming(connection, peer, events) {
                    displaced.close(DisconnectReason::DuplicateConnection);
                }
            }
        }
    }

    fn on_connection_request(&self, requester: PeerDescriptor) {
        if !self.is_running() {
            return;
        }
        let local = self.local_peer_descriptor();
        if requester.node_id == local.node_id {
            return;
        }
        if self.has_connection(&requester.node_id) {
            trace!("Ignoring connection request from {}, already connecting", requester.node_id.short());
            return;
        }
        if let Err(e) = self.connection_for(&requester, &local) {
            warn!("Cannot answer connection request from {}: {}", requester.node_id.short(), e);
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send(&self, message: Message) -> std::result::Result<(), TransportError> {
        ConnectionManager::send(self, message).await
    }

    fn subscribe(&self) -> TransportEvents {
        ConnectionManager::subscribe(self)
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        ConnectionManager::local_peer_descriptor(self)
    }

    fn connections(&self) -> Vec<PeerDescriptor> {
        ConnectionManager::connections(self)
    }

    fn has_connection(&self, node_id: &NodeId) -> bool {
        ConnectionManager::has_connection(self, node_id)
    }

    async fn stop(&self) {
        ConnectionManager::stop(self).await
    }
}

#[async_trait]
impl Lifecycle for ConnectionManager {
    async fn start(&self) -> std::result::Result<(), Box<dyn StdError + Send + Sync>> {
        ConnectionManager::start(self).await.map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)
    }

    async fn stop(&self) -> std::result::Result<(), Box<dyn StdError + Send + Sync>> {
        ConnectionManager::stop(self).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        ConnectionManager::is_running(self)
    }

    async fn health_check(&self) -> HealthStatus {
        match *self.state.lock() {
            RunState::Running => HealthStatus::Healthy,
            RunState::Created => HealthStatus::Degraded {
                reason: "not started".to_string(),
            },
            RunState::Stopped => HealthStatus::Unhealthy {
                reason: "stopped".to_string(),
            },
        }
    }
}

impl Named for ConnectionManager {
    fn name(&self) -> &str {
        "connection-manager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use peerlink_types::PROTOCOL_VERSION;

    use crate::connection::testing::RecordingConnection;
    use crate::connection::Connection;
    use crate::simulator::LatencyModel;

    fn manager(simulator: &Simulator) -> Arc<ConnectionManager> {
        ConnectionManager::simulated(
            PeerDescriptor::new(NodeId::random()),
            simulator,
            ConnectionConfig::default(),
        )
    }

    /// A peer for which `local` is (or is not) the offering side.
    fn peer_where_offering(local: &NodeId, offering: bool) -> PeerDescriptor {
        loop {
            let peer = PeerDescriptor::new(NodeId::random());
            if is_offering(local, &peer.node_id) == offering {
                return peer;
            }
        }
    }

    /// Register an entry for `peer` whose outgoing attempt is still waiting
    /// for its channel to open.
    fn pending_attempt(node: &ConnectionManager, peer: &PeerDescriptor) -> (Arc<ManagedConnection>, Arc<RecordingConnection>) {
        let (managed, _events) = ManagedConnection::new(node.local_peer_descriptor(), peer.clone(), Direction::Outgoing);
        let (attempt, attempt_events) = RecordingConnection::new();
        managed.attach_outgoing(attempt.clone(), attempt_events, Duration::from_secs(15));
        node.registry.lock().insert(peer.node_id, managed.clone());
        (managed, attempt)
    }

    /// Run an inbound handshake from `peer` through the manager and return
    /// the raw connection it arrived on.
    fn inbound_from(node: &ConnectionManager, peer: &PeerDescriptor) -> Arc<RecordingConnection> {
        let (raw, events) = RecordingConnection::new();
        raw.open();
        let request = HandshakeRequest {
            source_descriptor: peer.clone(),
            target_descriptor: Some(node.local_peer_descriptor()),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let handshaker = Handshaker::new(node.local_peer_descriptor(), raw.clone());
        node.on_handshake_request(request, handshaker, events);
        raw
    }

    fn response_error(raw: &RecordingConnection) -> Option<HandshakeError> {
        match raw.written_frames().pop() {
            Some(Frame::HandshakeResponse(response)) => response.error,
            other => panic!("expected a handshake response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_rejected_when_already_open() {
        let simulator = Simulator::with_latency(LatencyModel::None);
        let node = manager(&simulator);
        node.start().await.unwrap();
        let peer = PeerDescriptor::new(NodeId::random());

        let (existing, _events) = ManagedConnection::new(node.local_peer_descriptor(), peer.clone(), Direction::Incoming);
        let (first, first_events) = RecordingConnection::new();
        first.open();
        existing.accept_incoming(first.clone(), peer.clone(), first_events);
        node.registry.lock().insert(peer.node_id, existing.clone());

        let raw = inbound_from(&node, &peer);

        assert_eq!(response_error(&raw), Some(HandshakeError::DuplicateConnection));
        assert!(raw.is_closed());
        assert!(existing.is_open());
        assert!(existing.is_implementation(first.connection_id()));
        assert_eq!(node.connection(&peer.node_id).map(|m| m.object_id()), Some(existing.object_id()));
        node.stop().await;
        simulator.stop();
    }

    #[tokio::test]
    async fn test_inbound_rejected_while_offering_attempt_pending() {
        let simulator = Simulator::with_latency(LatencyModel::None);
        let node = manager(&simulator);
        node.start().await.unwrap();
        let peer = peer_where_offering(&node.local_peer_descriptor().node_id, true);
        let (existing, attempt) = pending_attempt(&node, &peer);

        let raw = inbound_from(&node, &peer);

        assert_eq!(response_error(&raw), Some(HandshakeError::DuplicateConnection));
        assert!(raw.is_closed());
        assert!(existing.has_outgoing_attempt());
        assert!(existing.is_implementation(attempt.connection_id()));
        assert!(!attempt.is_closed());
        node.stop().await;
        simulator.stop();
    }

    #[tokio::test]
    async fn test_inbound_replaces_attempt_when_answering() {
        let simulator = Simulator::with_latency(LatencyModel::None);
        let node = manager(&simulator);
        node.start().await.unwrap();
        let peer = peer_where_offering(&node.local_peer_descriptor().node_id, false);
        let (existing, attempt) = pending_attempt(&node, &peer);

        let raw = inbound_from(&node, &peer);

        assert_eq!(response_error(&raw), None);
        assert!(raw.is_open());
        assert!(attempt.is_closed());
        assert!(existing.is_open());
        assert!(existing.is_implementation(raw.connection_id()));
        assert_eq!(node.connection(&peer.node_id).map(|m| m.object_id()), Some(existing.object_id()));
        node.stop().await;
        simulator.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_start_is_refused() {
        let simulator = Simulator::with_latency(LatencyModel::None);
        let node = manager(&simulator);
        let target = PeerDescriptor::new(NodeId::random());
        let result = node.send_payload(&target, "test", b"x".to_vec()).await;
        assert!(matches!(result, Err(TransportError::NoConnection(_))));
        assert_eq!(node.connection_count(), 0);
        simulator.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit_is_synchronous() {
        let simulator = Simulator::with_latency(LatencyModel::fixed_ms(10));
        let node = ConnectionManager::simulated(
            PeerDescriptor::new(NodeId::random()),
            &simulator,
            ConnectionConfig::default().with_max_connections(1),
        );
        node.start().await.unwrap();

        let first = PeerDescriptor::new(NodeId::random());
        let second = PeerDescriptor::new(NodeId::random());
        // unknown peers: the first attempt stays pending until the connect fails
        let pending = {
            let node = node.clone();
            let first = first.clone();
            tokio::spawn(async move { node.send_payload(&first, "test", b"1".to_vec()).await })
        };
        tokio::task::yield_now().await;
        assert!(node.has_connection(&first.node_id));

        let result = node.send_payload(&second, "test", b"2".to_vec()).await;
        assert_eq!(result, Err(TransportError::CapacityExceeded { limit: 1 }));
        assert!(pending.await.unwrap().is_err());
        node.stop().await;
        simulator.stop();
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let simulator = Simulator::with_latency(LatencyModel::None);
        let node = manager(&simulator);
        assert!(!Lifecycle::health_check(node.as_ref()).await.is_healthy());
        Lifecycle::start(node.as_ref()).await.unwrap();
        assert!(Lifecycle::health_check(node.as_ref()).await.is_healthy());
        Lifecycle::stop(node.as_ref()).await.unwrap();
        assert!(matches!(
            Lifecycle::health_check(node.as_ref()).await,
            HealthStatus::Unhealthy { .. }
        ));
        assert_eq!(node.name(), "connection-manager");
        simulator.stop();
    }
}
