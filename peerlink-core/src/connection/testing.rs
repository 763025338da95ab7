//! In-memory [`Connection`] for unit tests: records writes, opened and fed
//! by hand.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_types::{ConnectionType, DisconnectReason, PeerDescriptor};

use super::{Connection, ConnectionCore, ConnectionEvents, ConnectionId};
use crate::codec::Frame;
use crate::error::TransportError;

pub(crate) struct RecordingConnection {
    core: ConnectionCore,
    written: Mutex<Vec<Bytes>>,
}

impl RecordingConnection {
    pub(crate) fn new() -> (Arc<Self>, ConnectionEvents) {
        let (core, events) = ConnectionCore::new(ConnectionType::Simulator, None);
        (
            Arc::new(Self {
                core,
                written: Mutex::new(Vec::new()),
            }),
            events,
        )
    }

    pub(crate) fn open(&self) {
        self.core.mark_open(|data| {
            self.written.lock().push(data);
            Ok(())
        });
    }

    /// Deliver `frame` as if the remote had sent it.
    pub(crate) fn receive(&self, frame: Frame) {
        if let Ok(data) = frame.encode() {
            self.core.emit_data(data);
        }
    }

    pub(crate) fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    pub(crate) fn written_frames(&self) -> Vec<Frame> {
        self.written
            .lock()
            .iter()
            .filter_map(|data| Frame::decode(data).ok())
            .collect()
    }
}

impl Connection for RecordingConnection {
    fn connection_id(&self) -> ConnectionId {
        self.core.id()
    }

    fn connection_type(&self) -> ConnectionType {
        self.core.connection_type()
    }

    fn remote_peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.core.remote()
    }

    fn set_remote_peer_descriptor(&self, descriptor: PeerDescriptor) {
        self.core.set_remote(descriptor)
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.core.send_or_buffer(data, |data| {
            self.written.lock().push(data);
            Ok(())
        })
    }

    fn close(&self, reason: DisconnectReason) {
        self.core.close(reason);
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
