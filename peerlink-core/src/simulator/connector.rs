//! Connector facade over the simulator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_types::PeerDescriptor;
use tracing::{debug, info};

use super::{Simulator, SimulatorConnection};
use crate::connection::Connection;
use crate::connector::{ConnectorFacade, ConnectorHandler};
use crate::error::{Result, TransportError};
use crate::handshake::spawn_incoming;
use crate::managed_connection::ManagedConnection;

/// 模拟连接器
pub struct SimulatorConnector {
    local: PeerDescriptor,
    simulator: Simulator,
    handshake_timeout: Duration,
    handler: Mutex<Option<Arc<dyn ConnectorHandler>>>,
    stopped: AtomicBool,
    this: Weak<SimulatorConnector>,
}

impl SimulatorConnector {
    pub fn new(local: PeerDescriptor, simulator: Simulator, handshake_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            simulator,
            handshake_timeout,
            handler: Mutex::new(None),
            stopped: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    /// Called by the simulator when a connect operation reaches this node.
    /// Returns false if the connect is refused.
    pub(crate) fn handle_incoming_connection(&self, source: &Arc<SimulatorConnection>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let Some(handler) = self.handler.lock().clone() else {
            debug!("{} not started, refusing simulated connection", self.local.node_id.short());
            return false;
        };

        let (target, events) = SimulatorConnection::new(
            self.local.clone(),
            Some(source.local_peer_descriptor().clone()),
            self.simulator.clone(),
        );
        self.simulator.accept(source, &target);
        spawn_incoming(
            self.local.clone(),
            target as Arc<dyn Connection>,
            events,
            handler,
            self.handshake_timeout,
        );
        true
    }
}

#[async_trait]
impl ConnectorFacade for SimulatorConnector {
    async fn start(&self, handler: Arc<dyn ConnectorHandler>) -> Result<()> {
        *self.handler.lock() = Some(handler);
        self.simulator.register(self.local.node_id, self.this.clone());
        info!("Simulated connector for {} registered", self.local.node_id.short());
        Ok(())
    }

    fn connect(&self, managed: &Arc<ManagedConnection>) -> std::result::Result<(), TransportError> {
        let remote = managed.remote_peer_descriptor();
        if remote.node_id == self.local.node_id {
            return Err(TransportError::CannotConnectToSelf);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        let (connection, events) =
            SimulatorConnection::new(self.local.clone(), Some(remote.clone()), self.simulator.clone());
        self.simulator.connect(&connection, remote);
        managed.attach_outgoing(connection, events, self.handshake_timeout);
        Ok(())
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.local.clone()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.simulator.unregister(&self.local.node_id);
        self.handler.lock().take();
    }
}
