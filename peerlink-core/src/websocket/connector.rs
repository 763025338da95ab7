//! WebSocket connector: client dials, the inbound server loop and
//! connection requests over signalling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_types::{ConnectionType, ConnectivityMethod, ConnectivityRequest, DisconnectReason, Signal};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connectivity::{check_connectivity, serve_connectivity_probe, serve_connectivity_request};
use super::{ServerAction, ServerConnection, WebsocketConnection, WebsocketServer};
use crate::config::WebsocketConfig;
use crate::connection::Connection;
use crate::connector::{ConnectorHandler, SharedDescriptor};
use crate::error::{Result, TransportError};
use crate::handshake::spawn_incoming;
use crate::managed_connection::ManagedConnection;
use crate::signalling::{SignalReceiver, SignalRelay, WEBSOCKET_SIGNAL_SERVICE_ID};

/// WebSocket 连接器
pub struct WebsocketConnector {
    config: WebsocketConfig,
    run_server: bool,
    handshake_timeout: Duration,
    local: SharedDescriptor,
    relay: Option<Arc<dyn SignalRelay>>,
    server: Mutex<Option<WebsocketServer>>,
    shutdown: CancellationToken,
}

impl WebsocketConnector {
    pub fn new(
        config: WebsocketConfig,
        private_client_mode: bool,
        handshake_timeout: Duration,
        local: SharedDescriptor,
        relay: Option<Arc<dyn SignalRelay>>,
    ) -> Self {
        Self {
            run_server: config.server_enabled && !private_client_mode,
            config,
            handshake_timeout,
            local,
            relay,
            server: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the server (unless disabled) and listen for connection
    /// requests. Returns the endpoint to advertise, if any.
    pub async fn start(&self, handler: Arc<dyn ConnectorHandler>) -> Result<Option<ConnectivityMethod>> {
        if let Some(relay) = &self.relay {
            let requests = relay.subscribe(WEBSOCKET_SIGNAL_SERVICE_ID);
            tokio::spawn(connection_requests(requests, handler.clone(), self.shutdown.clone()));
        }
        if !self.run_server {
            info!("WebSocket server disabled, running as client only");
            return Ok(None);
        }

        let (server, connections) = WebsocketServer::start(&self.config, None).await?;
        let port = server.port();
        *self.server.lock() = Some(server);
        tokio::spawn(serve(
            connections,
            self.local.clone(),
            handler,
            self.handshake_timeout,
            self.shutdown.clone(),
        ));

        if self.config.entry_points.is_empty() {
            return Ok(Some(ConnectivityMethod::new(self.config.host.clone(), port, self.config.tls)));
        }
        let entry_points: Vec<ConnectivityMethod> = self
            .config
            .entry_points
            .iter()
            .map(|entry| entry.connectivity_method())
            .collect();
        let request = ConnectivityRequest {
            port,
            tls: self.config.tls,
            host: None,
        };
        let response = check_connectivity(&entry_points, &request, self.config.connect_timeout()).await?;
        if response.websocket.is_none() {
            warn!("Entry points could not reach our server on port {}, not advertising it", port);
        }
        Ok(response.websocket)
    }

    /// Dial the remote's server.
    pub fn connect_as_client(&self, managed: &Arc<ManagedConnection>) -> std::result::Result<(), TransportError> {
        let remote = managed.remote_peer_descriptor();
        let Some(method) = remote.websocket.clone() else {
            return Err(TransportError::DialFailed(format!("{} has no WebSocket server", remote.node_id.short())));
        };
        let (connection, events) = WebsocketConnection::new(ConnectionType::WebsocketClient, Some(remote));
        managed.attach_outgoing(connection.clone(), events, self.handshake_timeout);

        let url = method.url();
        let timeout = self.config.connect_timeout();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            debug!("Dialling {}", url);
            let dial = tokio::time::timeout(timeout, connect_async(url.as_str()));
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => {
                    connection.fail(DisconnectReason::Other);
                    return;
                }
                outcome = dial => outcome,
            };
            match outcome {
                Ok(Ok((socket, _))) => {
                    if connection.is_closed() {
                        trace!("Dial to {} finished after the connection was closed", url);
                        return;
                    }
                    connection.attach(socket);
                }
                Ok(Err(e)) => {
                    debug!("Dial to {} failed: {}", url, e);
                    connection.fail(DisconnectReason::TransportError);
                }
                Err(_) => {
                    debug!("Dial to {} timed out after {:?}", url, timeout);
                    connection.fail(DisconnectReason::DeadConnection);
                }
            }
        });
        Ok(())
    }

    /// Ask the remote to dial our server. The managed connection stays a
    /// placeholder until the remote's handshake arrives.
    pub fn request_connection(&self, managed: &Arc<ManagedConnection>) -> std::result::Result<(), TransportError> {
        let Some(relay) = &self.relay else {
            return Err(TransportError::DialFailed("no signalling relay for a connection request".into()));
        };
        if self.server.lock().is_none() {
            return Err(TransportError::DialFailed("WebSocket server not running".into()));
        }
        let remote = managed.remote_peer_descriptor();
        let requester = self.local.read().clone();
        debug!("Asking {} to connect to {}", remote.node_id.short(), requester);
        relay.send_signal(&remote, WEBSOCKET_SIGNAL_SERVICE_ID, Signal::WebsocketConnectionRequest { requester });
        managed.arm_open_deadline(self.config.connect_timeout(), DisconnectReason::DeadConnection);
        Ok(())
    }

    pub fn is_server_running(&self) -> bool {
        self.server.lock().is_some()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
    }
}

async fn serve(
    mut connections: mpsc::UnboundedReceiver<ServerConnection>,
    local: SharedDescriptor,
    handler: Arc<dyn ConnectorHandler>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = connections.recv() => incoming,
        };
        let Some(ServerConnection {
            action,
            remote_addr,
            socket,
        }) = incoming
        else {
            break;
        };
        match action {
            ServerAction::Peer => {
                trace!("Inbound peer socket from {}", remote_addr);
                let (connection, events) = WebsocketConnection::new(ConnectionType::WebsocketServer, None);
                connection.attach(socket);
                spawn_incoming(
                    local.read().clone(),
                    connection as Arc<dyn Connection>,
                    events,
                    handler.clone(),
                    handshake_timeout,
                );
            }
            ServerAction::ConnectivityRequest => {
                tokio::spawn(serve_connectivity_request(socket, remote_addr));
            }
            ServerAction::ConnectivityProbe => {
                tokio::spawn(serve_connectivity_probe(socket, remote_addr));
            }
        }
    }
}

async fn connection_requests(mut requests: SignalReceiver, handler: Arc<dyn ConnectorHandler>, shutdown: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = requests.recv() => incoming,
        };
        let Some(incoming) = incoming else { break };
        match incoming.signal {
            Signal::WebsocketConnectionRequest { requester } => {
                if requester.websocket.is_none() {
                    warn!("Connection request from {} without a server to dial", requester.node_id.short());
                    continue;
                }
                debug!("{} asks us to connect", requester);
                handler.on_connection_request(requester);
            }
            other => debug!("Unexpected signal on the WebSocket service: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_HANDSHAKE_TIMEOUT_MS;
    use crate::managed_connection::{Direction, ManagedConnectionEvent};
    use parking_lot::RwLock;
    use peerlink_types::{NodeId, PeerDescriptor};

    fn connector(private_client_mode: bool) -> WebsocketConnector {
        let local = Arc::new(RwLock::new(PeerDescriptor::new(NodeId::random())));
        WebsocketConnector::new(
            WebsocketConfig::default().with_port_range(41150, 41160),
            private_client_mode,
            Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            local,
            None,
        )
    }

    #[tokio::test]
    async fn test_dial_without_endpoint_fails_synchronously() {
        let connector = connector(true);
        let local = PeerDescriptor::new(NodeId::random());
        let (managed, _events) = ManagedConnection::new(local, PeerDescriptor::new(NodeId::random()), Direction::Outgoing);
        assert!(matches!(
            connector.connect_as_client(&managed),
            Err(TransportError::DialFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_dial_closes_managed_connection() {
        let connector = connector(true);
        let local = PeerDescriptor::new(NodeId::random());
        let remote = PeerDescriptor::new(NodeId::random()).with_websocket(ConnectivityMethod::new("127.0.0.1", 41169, false));
        let (managed, mut events) = ManagedConnection::new(local, remote, Direction::Outgoing);
        connector.connect_as_client(&managed).unwrap();
        assert_eq!(
            events.recv().await,
            Some(ManagedConnectionEvent::Disconnected(DisconnectReason::TransportError))
        );
        assert!(managed.is_closed());
    }

    #[tokio::test]
    async fn test_connection_request_needs_relay() {
        let connector = connector(false);
        let local = PeerDescriptor::new(NodeId::random());
        let (managed, _events) = ManagedConnection::new(local, PeerDescriptor::new(NodeId::random()), Direction::Outgoing);
        assert!(connector.request_connection(&managed).is_err());
        assert!(!connector.is_server_running());
    }
}
