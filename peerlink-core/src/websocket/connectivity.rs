//! Connectivity check against entry points.
//!
//! A node that runs a server asks an entry point to dial it back. The
//! entry point answers with the address it saw and, if the probe got
//! through, the endpoint the node can advertise.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerlink_types::{ConnectivityMethod, ConnectivityRequest, ConnectivityResponse, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::{action_url, ServerAction};
use crate::codec::Frame;
use crate::error::{PeerlinkError, Result, TransportError};

/// Entry points tried before giving up.
pub const ENTRY_POINT_CONNECTION_ATTEMPTS: usize = 5;
pub const CONNECTIVITY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECTIVITY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Ask the first answering entry point how it sees us.
pub async fn check_connectivity(
    entry_points: &[ConnectivityMethod],
    request: &ConnectivityRequest,
    timeout: Duration,
) -> Result<ConnectivityResponse> {
    for entry_point in entry_points.iter().take(ENTRY_POINT_CONNECTION_ATTEMPTS) {
        match request_connectivity(entry_point, request, timeout).await {
            Ok(response) => {
                info!(
                    "Entry point {} sees us as {} (reachable: {})",
                    entry_point,
                    response.host,
                    response.websocket.is_some()
                );
                return Ok(response);
            }
            Err(e) => warn!("Connectivity check via {} failed: {}", entry_point, e),
        }
    }
    Err(PeerlinkError::websocket("no entry point answered the connectivity check"))
}

async fn request_connectivity(
    entry_point: &ConnectivityMethod,
    request: &ConnectivityRequest,
    timeout: Duration,
) -> Result<ConnectivityResponse> {
    let url = action_url(entry_point, ServerAction::ConnectivityRequest);
    let exchange = async {
        let (mut socket, _) = connect_async(url.as_str()).await?;
        let frame = Frame::ConnectivityRequest(request.clone()).encode()?;
        socket.send(WsMessage::Binary(frame.to_vec())).await?;
        trace!("Connectivity request sent to {}", url);

        while let Some(incoming) = socket.next().await {
            match incoming? {
                WsMessage::Binary(data) => match Frame::decode(&data) {
                    Ok(Frame::ConnectivityResponse(response)) => {
                        let _ = socket.close(None).await;
                        return Ok(response);
                    }
                    Ok(other) => debug!("Ignoring {} frame from entry point", other.name()),
                    Err(e) => debug!("Undecodable frame from entry point: {}", e),
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Err::<ConnectivityResponse, PeerlinkError>(PeerlinkError::websocket(format!(
            "{} closed before responding",
            entry_point
        )))
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout(format!("connectivity check via {}", entry_point)))?
}

/// Serve a `connectivityRequest` upgrade: read the request, try to dial the
/// requester back and report what happened.
pub(crate) async fn serve_connectivity_request(
    mut socket: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
) {
    let request = match tokio::time::timeout(CONNECTIVITY_CHECK_TIMEOUT, read_request(&mut socket)).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("{} closed without a connectivity request", remote_addr);
            return;
        }
        Err(_) => {
            debug!("No connectivity request from {} in time", remote_addr);
            let _ = socket.close(None).await;
            return;
        }
    };

    let host = request.host.clone().unwrap_or_else(|| remote_addr.ip().to_string());
    let websocket = if request.port == 0 {
        None
    } else {
        let method = ConnectivityMethod::new(host.clone(), request.port, request.tls);
        probe(&method).await.then_some(method)
    };
    let response = ConnectivityResponse {
        host,
        websocket,
        protocol_version: PROTOCOL_VERSION.to_string(),
    };
    debug!("Connectivity response for {}: {:?}", remote_addr, response);
    match Frame::ConnectivityResponse(response).encode() {
        Ok(frame) => {
            let _ = socket.send(WsMessage::Binary(frame.to_vec())).await;
        }
        Err(e) => warn!("Failed to encode connectivity response: {}", e),
    }
    let _ = socket.close(None).await;
}

/// A probe only proves the server is reachable; close it at once.
pub(crate) async fn serve_connectivity_probe(mut socket: WebSocketStream<TcpStream>, remote_addr: SocketAddr) {
    trace!("Connectivity probe from {}", remote_addr);
    let _ = socket.close(None).await;
}

async fn read_request(socket: &mut WebSocketStream<TcpStream>) -> Option<ConnectivityRequest> {
    while let Some(Ok(incoming)) = socket.next().await {
        match incoming {
            WsMessage::Binary(data) => match Frame::decode(&data) {
                Ok(Frame::ConnectivityRequest(request)) => return Some(request),
                Ok(other) => debug!("Expected connectivity request, got {}", other.name()),
                Err(e) => debug!("Undecodable connectivity request: {}", e),
            },
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn probe(method: &ConnectivityMethod) -> bool {
    let url = action_url(method, ServerAction::ConnectivityProbe);
    match tokio::time::timeout(CONNECTIVITY_PROBE_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((mut socket, _))) => {
            let _ = socket.close(None).await;
            true
        }
        Ok(Err(e)) => {
            debug!("Probe to {} failed: {}", url, e);
            false
        }
        Err(_) => {
            debug!("Probe to {} timed out", url);
            false
        }
    }
}
