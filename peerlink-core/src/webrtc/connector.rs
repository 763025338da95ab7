//! WebRTC connector: negotiation over the signalling relay.
//!
//! The side that [`is_offering`](crate::connection::role::is_offering)
//! creates the data channel and runs the outgoing handshake. The other
//! side (the answerer) parks its connection on the managed connection,
//! asks the offerer to connect and then waits for the offer.
//!
//! Every offer, answer and candidate carries the offerer's negotiation
//! id. Signals whose id matches no ongoing negotiation are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_types::{DisconnectReason, NodeId, PeerDescriptor, Signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{RtcPlatform, SdpType, WebrtcConnection};
use crate::config::WebrtcConfig;
use crate::connection::Connection;
use crate::connector::{ConnectorHandler, SharedDescriptor};
use crate::error::TransportError;
use crate::handshake::spawn_incoming;
use crate::managed_connection::ManagedConnection;
use crate::signalling::{IncomingSignal, SignalReceiver, SignalRelay, WEBRTC_SIGNAL_SERVICE_ID};

/// WebRTC 连接器
pub struct WebrtcConnector {
    config: WebrtcConfig,
    handshake_timeout: Duration,
    local: SharedDescriptor,
    platform: Option<Arc<dyn RtcPlatform>>,
    relay: Option<Arc<dyn SignalRelay>>,
    handler: Mutex<Option<Arc<dyn ConnectorHandler>>>,
    /// Negotiations in progress, one per remote node.
    ongoing: Mutex<HashMap<NodeId, Arc<WebrtcConnection>>>,
    shutdown: CancellationToken,
    this: Weak<WebrtcConnector>,
}

impl WebrtcConnector {
    pub fn new(
        config: WebrtcConfig,
        handshake_timeout: Duration,
        local: SharedDescriptor,
        platform: Option<Arc<dyn RtcPlatform>>,
        relay: Option<Arc<dyn SignalRelay>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            handshake_timeout,
            local,
            platform,
            relay,
            handler: Mutex::new(None),
            ongoing: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn start(&self, handler: Arc<dyn ConnectorHandler>) {
        *self.handler.lock() = Some(handler);
        let Some(relay) = &self.relay else {
            info!("No signalling relay, WebRTC connections disabled");
            return;
        };
        if self.platform.is_none() {
            info!("No WebRTC platform, WebRTC connections disabled");
        }
        let signals = relay.subscribe(WEBRTC_SIGNAL_SERVICE_ID);
        tokio::spawn(signal_loop(signals, self.this.clone(), self.shutdown.clone()));
    }

    /// Begin a WebRTC connection for `managed`, as offerer or answerer.
    pub fn connect(&self, managed: &Arc<ManagedConnection>, offerer: bool) -> Result<(), TransportError> {
        let remote = managed.remote_peer_descriptor();
        if remote.node_id == self.local.read().node_id {
            return Err(TransportError::CannotConnectToSelf);
        }
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Stopped);
        }
        let (Some(platform), Some(relay)) = (&self.platform, &self.relay) else {
            return Err(TransportError::DialFailed("WebRTC is not available".into()));
        };
        let Some(handler) = self.handler.lock().clone() else {
            return Err(TransportError::DialFailed("WebRTC connector not started".into()));
        };

        if let Some(existing) = self.ongoing_for(&remote.node_id) {
            if !existing.is_offerer() && !existing.is_open() {
                // the remote's offer got here first
                debug!("Reusing inbound negotiation {} with {}", existing.connection_id(), remote.node_id.short());
                managed.set_passive(existing as Arc<dyn Connection>);
                return Ok(());
            }
            existing.close(DisconnectReason::Other);
        }

        let (connection, events) = WebrtcConnection::new(remote.clone(), offerer, platform.as_ref(), &self.config, relay.clone())
            .map_err(|e| TransportError::DialFailed(e.to_string()))?;
        self.ongoing.lock().insert(remote.node_id, connection.clone());

        if offerer {
            managed.attach_outgoing(connection as Arc<dyn Connection>, events, self.handshake_timeout);
        } else {
            managed.set_passive(connection.clone() as Arc<dyn Connection>);
            let local = self.local.read().clone();
            spawn_incoming(local.clone(), connection as Arc<dyn Connection>, events, handler, self.handshake_timeout);
            debug!("Asking {} to offer a WebRTC connection", remote.node_id.short());
            relay.send_signal(&remote, WEBRTC_SIGNAL_SERVICE_ID, Signal::WebrtcConnectionRequest { requester: local });
        }
        Ok(())
    }

    fn ongoing_for(&self, node_id: &NodeId) -> Option<Arc<WebrtcConnection>> {
        let mut ongoing = self.ongoing.lock();
        ongoing.retain(|_, connection| !connection.is_closed());
        ongoing.get(node_id).cloned()
    }

    /// Negotiation with `node_id` tagged `connection_id`, if any.
    fn negotiation(&self, node_id: &NodeId, connection_id: &str) -> Option<Arc<WebrtcConnection>> {
        self.ongoing_for(node_id)
            .filter(|connection| connection.negotiation_id() == connection_id)
    }

    fn on_signal(&self, incoming: IncomingSignal) {
        let IncomingSignal { source, signal } = incoming;
        match signal {
            Signal::WebrtcConnectionRequest { requester } => {
                if requester.node_id != source.node_id {
                    warn!("Connection request for {} relayed by {}", requester.node_id.short(), source.node_id.short());
                    return;
                }
                let handler = self.handler.lock().clone();
                if let Some(handler) = handler {
                    handler.on_connection_request(requester);
                }
            }
            Signal::RtcOffer {
                description,
                connection_id,
            } => self.on_offer(source, &description, &connection_id),
            Signal::RtcAnswer {
                description,
                connection_id,
            } => match self.negotiation(&source.node_id, &connection_id) {
                Some(connection) if connection.is_offerer() => {
                    connection.set_remote_description(&description, SdpType::Answer)
                }
                _ => trace!("Dropping answer {} from {}", connection_id, source.node_id.short()),
            },
            Signal::IceCandidate {
                candidate,
                mid,
                connection_id,
            } => match self.negotiation(&source.node_id, &connection_id) {
                Some(connection) => connection.add_remote_candidate(&candidate, &mid),
                None => trace!("Dropping candidate {} from {}", connection_id, source.node_id.short()),
            },
            other => debug!("Unexpected signal on the WebRTC service: {:?}", other),
        }
    }

    fn on_offer(&self, source: PeerDescriptor, description: &str, connection_id: &str) {
        match self.ongoing_for(&source.node_id) {
            Some(existing) if existing.is_offerer() => {
                warn!(
                    "Offer from {} while we are offering to it, ignoring",
                    source.node_id.short()
                );
                return;
            }
            Some(existing) if !existing.has_remote_description() => {
                existing.set_negotiation_id(connection_id);
                existing.set_remote_description(description, SdpType::Offer);
                return;
            }
            Some(existing) if existing.negotiation_id() == connection_id => {
                trace!("Duplicate offer {} from {}", connection_id, source.node_id.short());
                return;
            }
            _ => {}
        }

        // a fresh negotiation started by the remote
        let (Some(platform), Some(relay)) = (&self.platform, &self.relay) else {
            return;
        };
        let Some(handler) = self.handler.lock().clone() else {
            return;
        };
        let (connection, events) =
            match WebrtcConnection::new(source.clone(), false, platform.as_ref(), &self.config, relay.clone()) {
                Ok(created) => created,
                Err(e) => {
                    warn!("Could not answer {}: {}", source.node_id.short(), e);
                    return;
                }
            };
        connection.set_negotiation_id(connection_id);
        let previous = self.ongoing.lock().insert(source.node_id, connection.clone());
        if let Some(previous) = previous {
            previous.close(DisconnectReason::Other);
        }
        spawn_incoming(
            self.local.read().clone(),
            connection.clone() as Arc<dyn Connection>,
            events,
            handler,
            self.handshake_timeout,
        );
        connection.set_remote_description(description, SdpType::Offer);
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        let ongoing: Vec<_> = self.ongoing.lock().drain().map(|(_, c)| c).collect();
        for connection in ongoing {
            connection.close(DisconnectReason::Other);
        }
    }
}

async fn signal_loop(mut signals: SignalReceiver, connector: Weak<WebrtcConnector>, shutdown: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = signals.recv() => incoming,
        };
        let Some(incoming) = incoming else { break };
        let Some(connector) = connector.upgrade() else { break };
        connector.on_signal(incoming);
    }
}
