//! # Connector facade
//!
//! Single entry point the connection manager uses to open raw connections.
//! A facade either drives the simulator or the real transports.
//!
//! ```text
//!  ConnectionManager ──connect(mc)──▶ ConnectorFacade
//!         ▲                              │ select_role(local, remote)
//!         │ on_handshake_request         ├── WebsocketClient  ─▶ dial remote server
//!         │ on_connection_request        ├── WebsocketServer  ─▶ ask remote to dial us
//!         └──────────────────────────────└── Webrtc{offerer}  ─▶ signalled data channel
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use peerlink_types::{HandshakeRequest, PeerDescriptor};
use tracing::{debug, info};

use crate::config::PeerlinkConfig;
use crate::connection::role::{select_role, ConnectionRole};
use crate::connection::ConnectionEvents;
use crate::error::{Result, TransportError};
use crate::handshake::Handshaker;
use crate::managed_connection::ManagedConnection;
use crate::signalling::SignalRelay;
use crate::webrtc::{RtcPlatform, WebrtcConnector, WebrtcRsPlatform};
use crate::websocket::WebsocketConnector;

/// Local descriptor shared by the connectors. Written once the WebSocket
/// endpoint is known.
pub type SharedDescriptor = Arc<RwLock<PeerDescriptor>>;

/// Receives inbound activity from connectors.
pub trait ConnectorHandler: Send + Sync {
    /// A validated handshake request arrived on an inbound connection. The
    /// handler either accepts (and takes over `events`) or rejects.
    fn on_handshake_request(&self, request: HandshakeRequest, handshaker: Handshaker, events: ConnectionEvents);

    /// `requester` wants a connection it cannot open itself and asks us to
    /// open it.
    fn on_connection_request(&self, requester: PeerDescriptor);
}

#[async_trait]
pub trait ConnectorFacade: Send + Sync {
    async fn start(&self, handler: Arc<dyn ConnectorHandler>) -> Result<()>;

    /// Begin connecting `managed` to its remote peer. Only failures that
    /// need no I/O to detect are returned; everything else surfaces as a
    /// disconnect of `managed`.
    fn connect(&self, managed: &Arc<ManagedConnection>) -> std::result::Result<(), TransportError>;

    /// Current local descriptor. May change during `start` (bound port,
    /// connectivity check).
    fn local_peer_descriptor(&self) -> PeerDescriptor;

    async fn stop(&self);
}

/// Facade over the WebSocket and WebRTC connectors.
pub struct DefaultConnectorFacade {
    local: SharedDescriptor,
    websocket: WebsocketConnector,
    webrtc: Arc<WebrtcConnector>,
    relay: Option<Arc<dyn SignalRelay>>,
    stopped: AtomicBool,
}

impl DefaultConnectorFacade {
    /// Facade with WebRTC on [`WebrtcRsPlatform`].
    pub fn new(config: &PeerlinkConfig, relay: Option<Arc<dyn SignalRelay>>) -> Result<Arc<Self>> {
        Self::with_rtc_platform(config, relay, Some(Arc::new(WebrtcRsPlatform::new())))
    }

    pub fn with_rtc_platform(
        config: &PeerlinkConfig,
        relay: Option<Arc<dyn SignalRelay>>,
        platform: Option<Arc<dyn RtcPlatform>>,
    ) -> Result<Arc<Self>> {
        let local: SharedDescriptor = Arc::new(RwLock::new(config.local_peer_descriptor()?));
        let handshake_timeout = config.connection.handshake_timeout();
        let websocket = WebsocketConnector::new(
            config.websocket.clone(),
            config.connection.private_client_mode,
            handshake_timeout,
            local.clone(),
            relay.clone(),
        );
        let webrtc = WebrtcConnector::new(
            config.webrtc.clone(),
            handshake_timeout,
            local.clone(),
            platform,
            relay.clone(),
        );
        Ok(Arc::new(Self {
            local,
            websocket,
            webrtc,
            relay,
            stopped: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl ConnectorFacade for DefaultConnectorFacade {
    async fn start(&self, handler: Arc<dyn ConnectorHandler>) -> Result<()> {
        let advertised = self.websocket.start(handler.clone()).await?;
        if let Some(method) = advertised {
            info!("Advertising WebSocket server at {}", method.url());
            self.local.write().websocket = Some(method);
        }
        self.webrtc.start(handler);
        Ok(())
    }

    fn connect(&self, managed: &Arc<ManagedConnection>) -> std::result::Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        let remote = managed.remote_peer_descriptor();
        let local = self.local.read().clone();
        if remote.node_id == local.node_id {
            return Err(TransportError::CannotConnectToSelf);
        }
        let role = select_role(&local, &remote);
        debug!("Connecting to {} as {:?}", remote.node_id.short(), role);
        match role {
            ConnectionRole::WebsocketClient => self.websocket.connect_as_client(managed),
            ConnectionRole::WebsocketServer => self.websocket.request_connection(managed),
            ConnectionRole::Webrtc { offerer } => self.webrtc.connect(managed, offerer),
        }
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.local.read().clone()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.webrtc.stop();
        self.websocket.stop();
        if let Some(relay) = &self.relay {
            relay.stop();
        }
    }
}
