//! Simulated connection: one end of a pair of associations.

use std::sync::Arc;

use bytes::Bytes;
use peerlink_types::{ConnectionType, DisconnectReason, PeerDescriptor};

use super::Simulator;
use crate::connection::{Connection, ConnectionCore, ConnectionEvents, ConnectionId};
use crate::error::TransportError;

pub struct SimulatorConnection {
    core: ConnectionCore,
    local: PeerDescriptor,
    simulator: Simulator,
}

impl SimulatorConnection {
    pub fn new(
        local: PeerDescriptor,
        remote: Option<PeerDescriptor>,
        simulator: Simulator,
    ) -> (Arc<Self>, ConnectionEvents) {
        let (core, events) = ConnectionCore::new(ConnectionType::Simulator, remote);
        (Arc::new(Self { core, local, simulator }), events)
    }

    pub fn local_peer_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    /// The association is linked; flush buffered sends.
    pub(crate) fn handle_connected(&self) {
        let id = self.core.id();
        self.core.mark_open(|data| {
            self.simulator.send(id, data);
            Ok(())
        });
    }

    pub(crate) fn handle_connect_failed(&self) {
        self.core.close(DisconnectReason::Other);
    }

    pub(crate) fn handle_incoming_data(&self, data: Bytes) {
        self.core.emit_data(data);
    }

    /// The remote closed; the simulator mirrors the close on our pipe.
    pub(crate) fn handle_incoming_disconnection(&self) {
        self.core.close(DisconnectReason::Closed);
    }
}

impl Connection for SimulatorConnection {
    fn connection_id(&self) -> ConnectionId {
        self.core.id()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulator
    }

    fn remote_peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.core.remote()
    }

    fn set_remote_peer_descriptor(&self, descriptor: PeerDescriptor) {
        self.core.set_remote(descriptor);
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let id = self.core.id();
        self.core.send_or_buffer(data, |data| {
            self.simulator.send(id, data);
            Ok(())
        })
    }

    fn close(&self, reason: DisconnectReason) {
        if self.core.close(reason) {
            self.simulator.close(self.core.id());
        }
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
