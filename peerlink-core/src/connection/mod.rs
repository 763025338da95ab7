//! # Connection
//!
//! Transport-independent view of a single bidirectional byte pipe.
//!
//! ## Contract
//!
//! - `send` transmits when open, buffers (in order) while connecting and only
//!   fails once the connection is closed
//! - `close` is idempotent and never fails
//! - events arrive on the [`ConnectionEvents`] receiver handed out when the
//!   connection is created: `Connected` once, `Data` while open,
//!   `Disconnected` once as the terminal event
//!
//! Transport errors never escape `send`; they surface as
//! `Disconnected(reason)`.

pub mod address;
pub mod role;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_types::{ConnectionType, DisconnectReason, PeerDescriptor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::TransportError;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 连接事件
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Data(Bytes),
    Disconnected(DisconnectReason),
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// A raw transport connection.
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn connection_type(&self) -> ConnectionType;

    /// Remote identity, if known. Inbound connections learn it from the
    /// handshake.
    fn remote_peer_descriptor(&self) -> Option<PeerDescriptor>;

    fn set_remote_peer_descriptor(&self, descriptor: PeerDescriptor);

    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Graceful close. The remote side is told when the transport allows it.
    fn close(&self, reason: DisconnectReason);

    /// Hard local teardown. Still emits `Disconnected` locally.
    fn destroy(&self) {
        self.close(DisconnectReason::Other);
    }

    fn is_open(&self) -> bool;

    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.connection_id())
            .field("type", &self.connection_type())
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    Closed,
}

struct CoreState {
    phase: Phase,
    buffer: VecDeque<Bytes>,
    remote: Option<PeerDescriptor>,
}

/// State shared by every transport implementation.
///
/// Owns the phase machine, the pre-open buffer and the event sender, so the
/// exactly-once guarantees live in one place. Transports supply the actual
/// write as a closure.
pub(crate) struct ConnectionCore {
    id: ConnectionId,
    connection_type: ConnectionType,
    state: Mutex<CoreState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// Cancelled on close; parent of every timer owned by the connection.
    lifetime: CancellationToken,
}

impl ConnectionCore {
    pub(crate) fn new(
        connection_type: ConnectionType,
        remote: Option<PeerDescriptor>,
    ) -> (Self, ConnectionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Self {
            id: ConnectionId::next(),
            connection_type,
            state: Mutex::new(CoreState {
                phase: Phase::Connecting,
                buffer: VecDeque::new(),
                remote,
            }),
            events: tx,
            lifetime: CancellationToken::new(),
        };
        (core, rx)
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub(crate) fn remote(&self) -> Option<PeerDescriptor> {
        self.state.lock().remote.clone()
    }

    pub(crate) fn set_remote(&self, descriptor: PeerDescriptor) {
        self.state.lock().remote = Some(descriptor);
    }

    /// Token for timers that must die with the connection.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.lifetime.child_token()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    /// Transition to open, write out the buffer in order and emit
    /// `Connected`. Returns false if the connection was not connecting.
    pub(crate) fn mark_open<F>(&self, mut write: F) -> bool
    where
        F: FnMut(Bytes) -> Result<(), TransportError>,
    {
        let mut state = self.state.lock();
        if state.phase != Phase::Connecting {
            return false;
        }
        state.phase = Phase::Open;
        while let Some(data) = state.buffer.pop_front() {
            if let Err(e) = write(data) {
                trace!("{} flush failed: {}", self.id, e);
                break;
            }
        }
        let _ = self.events.send(ConnectionEvent::Connected);
        true
    }

    /// Write when open, buffer while connecting, fail when closed.
    pub(crate) fn send_or_buffer<F>(&self, data: Bytes, write: F) -> Result<(), TransportError>
    where
        F: FnOnce(Bytes) -> Result<(), TransportError>,
    {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Connecting => {
                state.buffer.push_back(data);
                Ok(())
            }
            Phase::Open => write(data),
            Phase::Closed => Err(TransportError::SendFailed(format!("{} is closed", self.id))),
        }
    }

    pub(crate) fn emit_data(&self, data: Bytes) {
        if self.is_open() {
            let _ = self.events.send(ConnectionEvent::Data(data));
        }
    }

    /// Transition to closed. Returns true only for the call that closed it.
    pub(crate) fn close(&self, reason: DisconnectReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return false;
            }
            state.phase = Phase::Closed;
            state.buffer.clear();
        }
        self.lifetime.cancel();
        trace!("{} closed: {}", self.id, reason);
        let _ = self.events.send(ConnectionEvent::Disconnected(reason));
        true
    }
}
