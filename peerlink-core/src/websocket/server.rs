//! WebSocket server: port-range binding, inbound address filter and
//! upgrade classification.

use std::io::ErrorKind as IoErrorKind;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ServerAction;
use crate::config::WebsocketConfig;
use crate::connection::address::is_private_address;
use crate::error::{PeerlinkError, Result, TransportError};

/// An upgraded inbound socket.
pub struct ServerConnection {
    pub action: ServerAction,
    pub remote_addr: SocketAddr,
    pub socket: WebSocketStream<TcpStream>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("action", &self.action)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// WebSocket 服务器
#[derive(Debug)]
pub struct WebsocketServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl WebsocketServer {
    /// Bind `requested`, or the first free port of the configured range.
    /// Upgraded sockets are delivered on the returned receiver.
    pub async fn start(
        config: &WebsocketConfig,
        requested: Option<u16>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerConnection>)> {
        let listener = bind(config, requested).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        info!("WebSocket server listening on {}", local_addr);
        tokio::spawn(accept_loop(
            listener,
            config.allow_private_addresses,
            tx,
            shutdown.clone(),
        ));
        Ok((Self { local_addr, shutdown }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("WebSocket server on {} stopping", self.local_addr);
            self.shutdown.cancel();
        }
    }
}

impl Drop for WebsocketServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bind(config: &WebsocketConfig, requested: Option<u16>) -> Result<TcpListener> {
    if let Some(port) = requested {
        if !config.port_in_range(port) {
            return Err(TransportError::PortOutOfRange {
                port,
                min: config.port_min,
                max: config.port_max,
            }
            .into());
        }
        return Ok(TcpListener::bind((config.host.as_str(), port)).await?);
    }

    for port in config.port_min..=config.port_max {
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == IoErrorKind::AddrInUse => {
                debug!("Port {} in use, trying next", port);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(PeerlinkError::websocket(format!(
        "no free port in range {}-{} on {}",
        config.port_min, config.port_max, config.host
    )))
}

async fn accept_loop(
    listener: TcpListener,
    allow_private: bool,
    connections: mpsc::UnboundedSender<ServerConnection>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    if !allow_private && is_private_address(&remote_addr.ip()) {
                        warn!("Refusing WebSocket connection from private address {}", remote_addr);
                        continue;
                    }
                    let connections = connections.clone();
                    tokio::spawn(async move {
                        if let Some(upgraded) = upgrade(stream, remote_addr).await {
                            let _ = connections.send(upgraded);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
        }
    }
}

async fn upgrade(stream: TcpStream, remote_addr: SocketAddr) -> Option<ServerConnection> {
    let mut action = ServerAction::Peer;
    let callback = |request: &Request, response: Response| {
        action = ServerAction::from_query(request.uri().query());
        Ok::<Response, ErrorResponse>(response)
    };
    let upgraded = accept_hdr_async(stream, callback).await;
    match upgraded {
        Ok(socket) => {
            debug!("Upgraded {} connection from {}", action.as_str().unwrap_or("peer"), remote_addr);
            Some(ServerConnection {
                action,
                remote_addr,
                socket,
            })
        }
        Err(e) => {
            debug!("WebSocket upgrade from {} failed: {}", remote_addr, e);
            None
        }
    }
}
