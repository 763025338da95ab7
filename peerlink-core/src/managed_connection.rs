//! # Managed Connection
//!
//! Peer-scoped handle held by the connection manager. Wraps at most one raw
//! [`Connection`] (the implementation) and keeps a stable identity across
//! implementation swaps.
//!
//! ## Features
//!
//! - Sends issued before the handshake completes are queued and flushed in
//!   order ahead of any later send
//! - Each queued send resolves when flushed, or fails when the connection is
//!   closed or destroyed first
//! - Loss of the implementation after open is reported upward at once, with
//!   no internal retry
//!
//! ```text
//!            attach_outgoing / set_passive
//!  Pending ─────────────────────────────────▶ Pending (implementation set)
//!     │                                            │ handshake completed
//!     │ close / destroy / implementation lost      ▼
//!     └──────────────────────────────▶ Closed ◀── Open
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_types::{ConnectionType, DisconnectReason, PeerDescriptor};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::connection::{Connection, ConnectionEvent, ConnectionEvents, ConnectionId};
use crate::error::TransportError;
use crate::handshake::Handshaker;

/// Events reported to the owner of a managed connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedConnectionEvent {
    HandshakeCompleted(PeerDescriptor),
    Data(Bytes),
    Disconnected(DisconnectReason),
}

pub type ManagedConnectionEvents = mpsc::UnboundedReceiver<ManagedConnectionEvent>;

/// Who initiated the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Open,
    Closed,
}

struct PendingSend {
    data: Bytes,
    done: oneshot::Sender<Result<(), TransportError>>,
}

struct Slot {
    phase: Phase,
    implementation: Option<Arc<dyn Connection>>,
    /// The implementation is an outgoing attempt still in its handshake.
    outgoing_attempt: bool,
    pending: VecDeque<PendingSend>,
    replacements: u32,
}

pub struct ManagedConnection {
    object_id: u64,
    direction: Direction,
    local_peer_descriptor: PeerDescriptor,
    remote_peer_descriptor: Mutex<PeerDescriptor>,
    created_at: Instant,
    slot: Mutex<Slot>,
    events: mpsc::UnboundedSender<ManagedConnectionEvent>,
    lifetime: CancellationToken,
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("object_id", &self.object_id)
            .field("direction", &self.direction)
            .field("remote", &self.remote_peer_descriptor().node_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ManagedConnection {
    pub fn new(
        local: PeerDescriptor,
        remote: PeerDescriptor,
        direction: Direction,
    ) -> (Arc<Self>, ManagedConnectionEvents) {
        static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            object_id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            local_peer_descriptor: local,
            remote_peer_descriptor: Mutex::new(remote),
            created_at: Instant::now(),
            slot: Mutex::new(Slot {
                phase: Phase::Pending,
                implementation: None,
                outgoing_attempt: false,
                pending: VecDeque::new(),
                replacements: 0,
            }),
            events: tx,
            lifetime: CancellationToken::new(),
        });
        (connection, rx)
    }

    /// Identity of this handle. A reconnect always yields a new id.
    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_peer_descriptor(&self) -> &PeerDescriptor {
        &self.local_peer_descriptor
    }

    pub fn remote_peer_descriptor(&self) -> PeerDescriptor {
        self.remote_peer_descriptor.lock().clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Type of the current implementation, `Deferred` while there is none.
    pub fn connection_type(&self) -> ConnectionType {
        self.slot
            .lock()
            .implementation
            .as_ref()
            .map(|c| c.connection_type())
            .unwrap_or(ConnectionType::Deferred)
    }

    pub fn implementation(&self) -> Option<Arc<dyn Connection>> {
        self.slot.lock().implementation.clone()
    }

    pub fn is_implementation(&self, id: ConnectionId) -> bool {
        self.slot
            .lock()
            .implementation
            .as_ref()
            .map(|c| c.connection_id() == id)
            .unwrap_or(false)
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().phase == Phase::Open
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().phase == Phase::Closed
    }

    /// An outgoing attempt owns the implementation and has not completed.
    pub fn has_outgoing_attempt(&self) -> bool {
        let slot = self.slot.lock();
        slot.phase == Phase::Pending && slot.outgoing_attempt
    }

    pub fn pending_send_count(&self) -> usize {
        self.slot.lock().pending.len()
    }

    /// Send through the implementation, or queue until the handshake
    /// completes. Queued sends resolve when flushed.
    pub async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let waiter = {
            let mut slot = self.slot.lock();
            let phase = slot.phase;
            match phase {
                Phase::Closed => {
                    return Err(TransportError::SendFailed("managed connection closed".into()));
                }
                Phase::Open => {
                    let implementation = slot
                        .implementation
                        .clone()
                        .ok_or_else(|| TransportError::SendFailed("no implementation".into()))?;
                    drop(slot);
                    return implementation.send(data);
                }
                Phase::Pending => {
                    let (done, waiter) = oneshot::channel();
                    slot.pending.push_back(PendingSend { data, done });
                    waiter
                }
            }
        };
        waiter
            .await
            .unwrap_or_else(|_| Err(TransportError::SendFailed("send buffer dropped".into())))
    }

    /// Put `new` into the slot and hand back the previous implementation.
    /// The caller disposes of the returned connection.
    pub fn replace(&self, new: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let mut slot = self.slot.lock();
        Self::replace_locked(&mut slot, new, self.object_id)
    }

    fn replace_locked(slot: &mut Slot, new: Arc<dyn Connection>, object_id: u64) -> Option<Arc<dyn Connection>> {
        let old = slot.implementation.replace(new);
        if let Some(previous) = &old {
            slot.replacements += 1;
            debug!(
                "managed connection {} swapped {} for a new implementation (swap #{})",
                object_id,
                previous.connection_id(),
                slot.replacements
            );
        }
        slot.outgoing_attempt = false;
        old
    }

    /// Start an outgoing attempt: run the handshake on `connection`, then
    /// pump its events. Ignored if the slot is already taken.
    pub fn attach_outgoing(
        self: &Arc<Self>,
        connection: Arc<dyn Connection>,
        events: ConnectionEvents,
        handshake_timeout: Duration,
    ) {
        {
            let mut slot = self.slot.lock();
            if slot.phase != Phase::Pending || slot.implementation.is_some() {
                drop(slot);
                debug!(
                    "managed connection {} already has an implementation, dropping {}",
                    self.object_id,
                    connection.connection_id()
                );
                connection.close(DisconnectReason::DuplicateConnection);
                return;
            }
            slot.implementation = Some(connection.clone());
            slot.outgoing_attempt = true;
        }

        let managed = self.clone();
        let target = self.remote_peer_descriptor();
        tokio::spawn(async move {
            let mut events = events;
            let connection_id = connection.connection_id();
            let mut handshaker = Handshaker::new(managed.local_peer_descriptor.clone(), connection.clone());
            match handshaker
                .run_outgoing(&mut events, Some(&target), handshake_timeout)
                .await
            {
                Ok(remote) => {
                    if managed.complete_handshake(connection_id, remote) {
                        managed.pump(connection_id, events).await;
                    } else {
                        connection.close(DisconnectReason::DuplicateConnection);
                    }
                }
                Err(DisconnectReason::DuplicateConnection) => {
                    managed.on_attempt_superseded(connection_id, handshake_timeout)
                }
                Err(reason) => managed.on_implementation_closed(connection_id, reason, false),
            }
        });
    }

    /// The remote rejected our attempt as a duplicate: it is connecting to
    /// us. Drop the attempt but keep the queue for the inbound connection.
    fn on_attempt_superseded(self: &Arc<Self>, connection_id: ConnectionId, wait: Duration) {
        {
            let mut slot = self.slot.lock();
            let current = slot
                .implementation
                .as_ref()
                .map(|c| c.connection_id() == connection_id)
                .unwrap_or(false);
            if !current || slot.phase != Phase::Pending {
                return;
            }
            slot.implementation = None;
            slot.outgoing_attempt = false;
        }
        debug!(
            "managed connection {} waiting for the remote's own connection",
            self.object_id
        );
        self.arm_open_deadline(wait, DisconnectReason::DuplicateConnection);
    }

    /// Park a connection whose handshake is driven from the other side
    /// (WebRTC answerer). The inbound handshake later calls
    /// [`accept_incoming`](Self::accept_incoming) with the same connection.
    pub fn set_passive(&self, connection: Arc<dyn Connection>) {
        let mut slot = self.slot.lock();
        if slot.phase == Phase::Pending && slot.implementation.is_none() {
            slot.implementation = Some(connection);
        }
    }

    /// Promote an inbound connection whose handshake was just accepted.
    /// Returns the implementation it displaced, if any and if different.
    pub fn accept_incoming(
        self: &Arc<Self>,
        connection: Arc<dyn Connection>,
        remote: PeerDescriptor,
        events: ConnectionEvents,
    ) -> Option<Arc<dyn Connection>> {
        let connection_id = connection.connection_id();
        let displaced = {
            let mut slot = self.slot.lock();
            if slot.phase == Phase::Closed {
                drop(slot);
                connection.close(DisconnectReason::Other);
                return None;
            }
            let same = slot
                .implementation
                .as_ref()
                .map(|c| c.connection_id() == connection_id)
                .unwrap_or(false);
            let displaced = if same {
                slot.outgoing_attempt = false;
                None
            } else {
                Self::replace_locked(&mut slot, connection, self.object_id)
            };
            *self.remote_peer_descriptor.lock() = remote.clone();
            self.open_locked(&mut slot, &remote);
            displaced
        };

        let managed = self.clone();
        tokio::spawn(async move {
            managed.pump(connection_id, events).await;
        });
        displaced
    }

    /// Returns false if `connection_id` is no longer the implementation.
    fn complete_handshake(&self, connection_id: ConnectionId, remote: PeerDescriptor) -> bool {
        let mut slot = self.slot.lock();
        let current = slot
            .implementation
            .as_ref()
            .map(|c| c.connection_id() == connection_id)
            .unwrap_or(false);
        if !current || slot.phase != Phase::Pending {
            return false;
        }
        *self.remote_peer_descriptor.lock() = remote.clone();
        slot.outgoing_attempt = false;
        self.open_locked(&mut slot, &remote);
        true
    }

    /// Flush queued sends in order, then announce. Runs under the slot lock
    /// so no later send can overtake the flush.
    fn open_locked(&self, slot: &mut Slot, remote: &PeerDescriptor) {
        slot.phase = Phase::Open;
        if let Some(implementation) = slot.implementation.clone() {
            let flushed = slot.pending.len();
            while let Some(PendingSend { data, done }) = slot.pending.pop_front() {
                let _ = done.send(implementation.send(data));
            }
            info!(
                "Connection to {} open over {} ({} queued sends flushed)",
                remote,
                implementation.connection_type(),
                flushed
            );
        }
        let _ = self
            .events
            .send(ManagedConnectionEvent::HandshakeCompleted(remote.clone()));
    }

    async fn pump(self: Arc<Self>, connection_id: ConnectionId, mut events: ConnectionEvents) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Data(data) => {
                    if self.is_implementation(connection_id) && self.is_open() {
                        let _ = self.events.send(ManagedConnectionEvent::Data(data));
                    }
                }
                ConnectionEvent::Disconnected(reason) => {
                    self.on_implementation_closed(connection_id, reason, true);
                    break;
                }
                ConnectionEvent::Connected => {}
            }
        }
    }

    fn on_implementation_closed(&self, connection_id: ConnectionId, reason: DisconnectReason, after_handshake: bool) {
        if !self.is_implementation(connection_id) {
            trace!(
                "managed connection {} ignoring close of replaced {}",
                self.object_id,
                connection_id
            );
            return;
        }
        debug!(
            "managed connection {} lost {} ({}, after handshake: {})",
            self.object_id, connection_id, reason, after_handshake
        );
        self.shut(reason, false, true);
    }

    /// Give up if the connection is not open within `deadline`.
    pub fn arm_open_deadline(self: &Arc<Self>, deadline: Duration, reason: DisconnectReason) {
        let managed = Arc::downgrade(self);
        let cancelled = self.lifetime.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if let Some(managed) = managed.upgrade() {
                        if !managed.is_open() && !managed.is_closed() {
                            debug!("managed connection {} not open after {:?}", managed.object_id, deadline);
                            managed.close(reason);
                        }
                    }
                }
            }
        });
    }

    /// Close gracefully: the implementation is closed with `reason`, queued
    /// sends fail and `Disconnected` is emitted.
    pub fn close(&self, reason: DisconnectReason) {
        self.shut(reason, true, true);
    }

    /// Local teardown: queued sends fail immediately, the implementation is
    /// dropped without a close handshake and no event is emitted.
    pub fn destroy(&self) {
        self.shut(DisconnectReason::Other, false, false);
    }

    fn shut(&self, reason: DisconnectReason, graceful: bool, notify: bool) {
        let (implementation, was_open, pending) = {
            let mut slot = self.slot.lock();
            if slot.phase == Phase::Closed {
                return;
            }
            let was_open = slot.phase == Phase::Open;
            slot.phase = Phase::Closed;
            let pending: Vec<PendingSend> = slot.pending.drain(..).collect();
            (slot.implementation.take(), was_open, pending)
        };
        self.lifetime.cancel();

        let error = TransportError::from_disconnect(reason, was_open);
        for PendingSend { done, .. } in pending {
            let _ = done.send(Err(error.clone()));
        }

        if let Some(implementation) = implementation {
            if graceful {
                implementation.close(reason);
            } else {
                implementation.destroy();
            }
        }
        if notify {
            let _ = self.events.send(ManagedConnectionEvent::Disconnected(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_types::NodeId;

    use crate::connection::testing::RecordingConnection;

    fn pair() -> (Arc<ManagedConnection>, ManagedConnectionEvents, PeerDescriptor) {
        let local = PeerDescriptor::new(NodeId::random());
        let remote = PeerDescriptor::new(NodeId::random());
        let (managed, events) = ManagedConnection::new(local, remote.clone(), Direction::Incoming);
        (managed, events, remote)
    }

    #[tokio::test]
    async fn test_queued_sends_flush_in_order_on_accept() {
        let (managed, mut events, remote) = pair();
        let sends = futures::future::join_all((0..3u8).map(|i| {
            let managed = managed.clone();
            async move { managed.send(Bytes::from(vec![i])).await }
        }));
        let sends = tokio::spawn(sends);
        tokio::task::yield_now().await;
        assert_eq!(managed.pending_send_count(), 3);

        let (raw, raw_events) = RecordingConnection::new();
        raw.open();
        assert!(managed.accept_incoming(raw.clone(), remote.clone(), raw_events).is_none());

        for result in sends.await.unwrap() {
            assert!(result.is_ok());
        }
        let written: Vec<u8> = raw.written().iter().map(|b| b[0]).collect();
        assert_eq!(written, vec![0, 1, 2]);
        assert_eq!(
            events.recv().await,
            Some(ManagedConnectionEvent::HandshakeCompleted(remote))
        );
    }

    #[tokio::test]
    async fn test_destroy_fails_queued_sends() {
        let (managed, mut events, _) = pair();
        let pending = {
            let managed = managed.clone();
            tokio::spawn(async move { managed.send(Bytes::from_static(b"x")).await })
        };
        tokio::task::yield_now().await;

        managed.destroy();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TransportError::DialFailed(_))));
        assert!(managed.is_closed());
        assert!(managed.send(Bytes::from_static(b"late")).await.is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replace_returns_previous_implementation() {
        let (managed, _events, remote) = pair();
        let (first, _first_events) = RecordingConnection::new();
        managed.set_passive(first.clone());

        let (second, second_events) = RecordingConnection::new();
        second.open();
        let displaced = managed
            .accept_incoming(second.clone(), remote, second_events)
            .expect("first implementation displaced");
        assert_eq!(displaced.connection_id(), first.connection_id());
        assert!(managed.is_implementation(second.connection_id()));
    }

    #[tokio::test]
    async fn test_implementation_loss_reports_disconnect() {
        let (managed, mut events, remote) = pair();
        let (raw, raw_events) = RecordingConnection::new();
        raw.open();
        managed.accept_incoming(raw.clone(), remote, raw_events);
        assert!(matches!(
            events.recv().await,
            Some(ManagedConnectionEvent::HandshakeCompleted(_))
        ));

        raw.close(DisconnectReason::TransportError);
        assert_eq!(
            events.recv().await,
            Some(ManagedConnectionEvent::Disconnected(DisconnectReason::TransportError))
        );
        assert!(managed.is_closed());
    }

    #[tokio::test]
    async fn test_pending_send_resolves_only_after_accept() {
        let (managed, _events, remote) = pair();
        let mut send = tokio_test::task::spawn(managed.send(Bytes::from_static(b"queued")));
        tokio_test::assert_pending!(send.poll());
        assert_eq!(managed.pending_send_count(), 1);

        let (raw, raw_events) = RecordingConnection::new();
        raw.open();
        managed.accept_incoming(raw.clone(), remote, raw_events);
        assert!(send.is_woken());
        tokio_test::assert_ready_ok!(send.poll());
        assert_eq!(raw.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_deadline_closes_pending_connection() {
        let (managed, mut events, _) = pair();
        managed.arm_open_deadline(Duration::from_secs(5), DisconnectReason::DeadConnection);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            events.recv().await,
            Some(ManagedConnectionEvent::Disconnected(DisconnectReason::DeadConnection))
        );
    }
}
