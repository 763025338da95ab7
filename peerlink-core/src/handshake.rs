//! # Handshake
//!
//! Identity and version exchange run on a raw connection before it is
//! trusted with routed traffic.
//!
//! ```text
//!  outgoing side                          incoming side
//!  ─────────────                          ─────────────
//!  Initial                                Initial
//!    │ channel writable                     │
//!    ├── HandshakeRequest ───────────────▶  │ validate version / target
//!  AwaitingResponse                         │ ask registry (duplicates)
//!    │  ◀──────────────── HandshakeResponse ┤
//!  Completed | Rejected                   Completed | Rejected
//! ```
//!
//! A rejected or timed out handshake always closes the raw connection.

use std::sync::Arc;
use std::time::Duration;

use peerlink_types::{
    is_compatible_version, DisconnectReason, HandshakeError, HandshakeRequest, HandshakeResponse,
    PeerDescriptor, PROTOCOL_VERSION,
};
use tracing::{debug, trace, warn};

use crate::codec::Frame;
use crate::connector::ConnectorHandler;
use crate::connection::{Connection, ConnectionEvent, ConnectionEvents};
use crate::error::TransportError;

/// 握手状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    AwaitingResponse,
    Completed,
    Rejected,
}

/// Drives one handshake over one raw connection.
pub struct Handshaker {
    local: PeerDescriptor,
    connection: Arc<dyn Connection>,
    state: HandshakeState,
}

impl Handshaker {
    pub fn new(local: PeerDescriptor, connection: Arc<dyn Connection>) -> Self {
        Self {
            local,
            connection,
            state: HandshakeState::Initial,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    fn fail(&mut self, reason: DisconnectReason) -> DisconnectReason {
        self.state = HandshakeState::Rejected;
        self.connection.close(reason);
        reason
    }

    /// Outgoing side: wait for the channel to open, send our request and
    /// wait up to `timeout` for the response.
    ///
    /// Frames after the response stay queued in `events`.
    pub async fn run_outgoing(
        &mut self,
        events: &mut ConnectionEvents,
        target: Option<&PeerDescriptor>,
        timeout: Duration,
    ) -> Result<PeerDescriptor, DisconnectReason> {
        match events.recv().await {
            Some(ConnectionEvent::Connected) => {}
            Some(ConnectionEvent::Disconnected(reason)) => return Err(self.fail(reason)),
            Some(ConnectionEvent::Data(_)) => return Err(self.fail(DisconnectReason::ProtocolViolation)),
            None => return Err(self.fail(DisconnectReason::Other)),
        }

        let request = Frame::HandshakeRequest(HandshakeRequest {
            source_descriptor: self.local.clone(),
            target_descriptor: target.cloned(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        });
        let encoded = match request.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode handshake request: {}", e);
                return Err(self.fail(DisconnectReason::Other));
            }
        };
        if self.connection.send(encoded).is_err() {
            return Err(self.fail(DisconnectReason::Other));
        }
        self.state = HandshakeState::AwaitingResponse;
        trace!("{} handshake request sent", self.connection.connection_id());

        let response = match tokio::time::timeout(timeout, next_frame(events)).await {
            Err(_) => {
                debug!("{} handshake timed out", self.connection.connection_id());
                return Err(self.fail(DisconnectReason::HandshakeTimeout));
            }
            Ok(Err(reason)) => return Err(self.fail(reason)),
            Ok(Ok(Frame::HandshakeResponse(response))) => response,
            Ok(Ok(other)) => {
                warn!("Expected handshake response, got {}", other.name());
                return Err(self.fail(DisconnectReason::ProtocolViolation));
            }
        };

        if let Some(error) = response.error {
            debug!(
                "{} handshake rejected by {}: {}",
                self.connection.connection_id(),
                response.source_descriptor,
                error
            );
            return Err(self.fail(error.into()));
        }
        if !is_compatible_version(PROTOCOL_VERSION, &response.protocol_version) {
            return Err(self.fail(DisconnectReason::InvalidVersion));
        }
        if let Some(expected) = target {
            if expected.node_id != response.source_descriptor.node_id {
                warn!(
                    "Handshake answered by {} instead of {}",
                    response.source_descriptor, expected
                );
                return Err(self.fail(DisconnectReason::InvalidTargetPeerDescriptor));
            }
        }

        self.state = HandshakeState::Completed;
        self.connection
            .set_remote_peer_descriptor(response.source_descriptor.clone());
        Ok(response.source_descriptor)
    }

    /// Incoming side: wait for the channel to open and for the request.
    /// The deadline starts once the channel is open.
    pub async fn await_request(
        &mut self,
        events: &mut ConnectionEvents,
        timeout: Duration,
    ) -> Result<HandshakeRequest, DisconnectReason> {
        match events.recv().await {
            Some(ConnectionEvent::Connected) => {}
            Some(ConnectionEvent::Disconnected(reason)) => return Err(self.fail(reason)),
            Some(ConnectionEvent::Data(_)) => return Err(self.fail(DisconnectReason::ProtocolViolation)),
            None => return Err(self.fail(DisconnectReason::Other)),
        }

        match tokio::time::timeout(timeout, next_frame(events)).await {
            Err(_) => Err(self.fail(DisconnectReason::HandshakeTimeout)),
            Ok(Err(reason)) => Err(self.fail(reason)),
            Ok(Ok(Frame::HandshakeRequest(request))) => {
                self.connection
                    .set_remote_peer_descriptor(request.source_descriptor.clone());
                Ok(request)
            }
            Ok(Ok(other)) => {
                warn!("Expected handshake request, got {}", other.name());
                Err(self.fail(DisconnectReason::ProtocolViolation))
            }
        }
    }

    /// Incoming side: send a positive response.
    pub fn accept(&mut self) -> Result<(), TransportError> {
        let response = self.response(None)?;
        self.connection.send(response)?;
        self.state = HandshakeState::Completed;
        Ok(())
    }

    /// Incoming side: send a negative response and close the connection.
    pub fn reject(&mut self, error: HandshakeError) {
        debug!("{} rejecting handshake: {}", self.connection.connection_id(), error);
        if let Ok(response) = self.response(Some(error)) {
            let _ = self.connection.send(response);
        }
        self.fail(error.into());
    }

    fn response(&self, error: Option<HandshakeError>) -> Result<bytes::Bytes, TransportError> {
        Frame::HandshakeResponse(HandshakeResponse {
            source_descriptor: self.local.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            error,
        })
        .encode()
        .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Check a request against the local node before consulting the registry.
pub fn validate_request(request: &HandshakeRequest, local: &PeerDescriptor) -> Result<(), HandshakeError> {
    if !is_compatible_version(PROTOCOL_VERSION, &request.protocol_version) {
        return Err(HandshakeError::InvalidVersion);
    }
    if let Some(target) = &request.target_descriptor {
        if target.node_id != local.node_id {
            return Err(HandshakeError::InvalidTargetPeerDescriptor);
        }
    }
    if request.source_descriptor.node_id == local.node_id {
        return Err(HandshakeError::Other);
    }
    Ok(())
}

/// Run the incoming side of a handshake on a freshly accepted connection.
pub(crate) fn spawn_incoming(
    local: PeerDescriptor,
    connection: Arc<dyn Connection>,
    mut events: ConnectionEvents,
    handler: Arc<dyn ConnectorHandler>,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let mut handshaker = Handshaker::new(local.clone(), connection);
        match handshaker.await_request(&mut events, timeout).await {
            Ok(request) => match validate_request(&request, &local) {
                Ok(()) => handler.on_handshake_request(request, handshaker, events),
                Err(error) => handshaker.reject(error),
            },
            Err(reason) => {
                debug!("Inbound handshake ended before a request arrived: {}", reason);
            }
        }
    });
}

async fn next_frame(events: &mut ConnectionEvents) -> Result<Frame, DisconnectReason> {
    loop {
        match events.recv().await {
            Some(ConnectionEvent::Data(data)) => {
                return Frame::decode(&data).map_err(|e| {
                    warn!("Dropping connection after malformed handshake frame: {}", e);
                    DisconnectReason::ProtocolViolation
                })
            }
            Some(ConnectionEvent::Connected) => continue,
            Some(ConnectionEvent::Disconnected(reason)) => return Err(reason),
            None => return Err(DisconnectReason::Other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_types::NodeId;

    use crate::connection::testing::RecordingConnection;

    fn open() -> (Arc<RecordingConnection>, ConnectionEvents) {
        let (connection, events) = RecordingConnection::new();
        connection.open();
        (connection, events)
    }

    fn sent_request(connection: &RecordingConnection) -> HandshakeRequest {
        match connection.written_frames().into_iter().next() {
            Some(Frame::HandshakeRequest(request)) => request,
            other => panic!("expected a handshake request, got {:?}", other),
        }
    }

    fn response(source: &PeerDescriptor, version: &str, error: Option<HandshakeError>) -> Frame {
        Frame::HandshakeResponse(HandshakeResponse {
            source_descriptor: source.clone(),
            protocol_version: version.to_string(),
            error,
        })
    }

    async fn outgoing(
        connection: &Arc<RecordingConnection>,
        events: &mut ConnectionEvents,
        target: &PeerDescriptor,
    ) -> (Handshaker, Result<PeerDescriptor, DisconnectReason>) {
        let local = PeerDescriptor::new(NodeId::random());
        let mut handshaker = Handshaker::new(local, connection.clone());
        let result = handshaker
            .run_outgoing(events, Some(target), Duration::from_secs(15))
            .await;
        (handshaker, result)
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_times_out_without_response() {
        let (connection, mut events) = open();
        let target = PeerDescriptor::new(NodeId::random());

        let (handshaker, result) = outgoing(&connection, &mut events, &target).await;

        assert_eq!(result, Err(DisconnectReason::HandshakeTimeout));
        assert_eq!(handshaker.state(), HandshakeState::Rejected);
        assert!(connection.is_closed());
        assert_eq!(sent_request(&connection).target_descriptor, Some(target));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Disconnected(DisconnectReason::HandshakeTimeout))
        ));
    }

    #[tokio::test]
    async fn test_outgoing_completes_with_target_descriptor() {
        let (connection, mut events) = open();
        let target = PeerDescriptor::new(NodeId::random());
        connection.receive(response(&target, PROTOCOL_VERSION, None));

        let (handshaker, result) = outgoing(&connection, &mut events, &target).await;

        assert_eq!(result.map(|d| d.node_id), Ok(target.node_id));
        assert_eq!(handshaker.state(), HandshakeState::Completed);
        assert!(connection.is_open());
        assert_eq!(
            connection.remote_peer_descriptor().map(|d| d.node_id),
            Some(target.node_id)
        );
    }

    #[tokio::test]
    async fn test_outgoing_rejection_maps_error() {
        let (connection, mut events) = open();
        let target = PeerDescriptor::new(NodeId::random());
        connection.receive(response(
            &target,
            PROTOCOL_VERSION,
            Some(HandshakeError::DuplicateConnection),
        ));

        let (handshaker, result) = outgoing(&connection, &mut events, &target).await;

        assert_eq!(result, Err(DisconnectReason::DuplicateConnection));
        assert_eq!(handshaker.state(), HandshakeState::Rejected);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_outgoing_rejects_incompatible_version() {
        let (connection, mut events) = open();
        let target = PeerDescriptor::new(NodeId::random());
        connection.receive(response(&target, "2.0", None));

        let (handshaker, result) = outgoing(&connection, &mut events, &target).await;

        assert_eq!(result, Err(DisconnectReason::InvalidVersion));
        assert_eq!(handshaker.state(), HandshakeState::Rejected);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_outgoing_rejects_wrong_responder() {
        let (connection, mut events) = open();
        let target = PeerDescriptor::new(NodeId::random());
        let impostor = PeerDescriptor::new(NodeId::random());
        connection.receive(response(&impostor, PROTOCOL_VERSION, None));

        let (handshaker, result) = outgoing(&connection, &mut events, &target).await;

        assert_eq!(result, Err(DisconnectReason::InvalidTargetPeerDescriptor));
        assert_eq!(handshaker.state(), HandshakeState::Rejected);
        assert!(connection.is_closed());
        assert!(connection.remote_peer_descriptor().is_none());
    }

    fn request(version: &str, target: Option<PeerDescriptor>) -> HandshakeRequest {
        HandshakeRequest {
            source_descriptor: PeerDescriptor::new(NodeId::random()),
            target_descriptor: target,
            protocol_version: version.to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_same_major() {
        let local = PeerDescriptor::new(NodeId::random());
        assert_eq!(validate_request(&request("1.7", Some(local.clone())), &local), Ok(()));
        assert_eq!(validate_request(&request("1.0", None), &local), Ok(()));
    }

    #[test]
    fn test_validate_rejects_other_major() {
        let local = PeerDescriptor::new(NodeId::random());
        assert_eq!(
            validate_request(&request("2.0", None), &local),
            Err(HandshakeError::InvalidVersion)
        );
    }

    #[test]
    fn test_validate_rejects_wrong_target() {
        let local = PeerDescriptor::new(NodeId::random());
        let someone_else = PeerDescriptor::new(NodeId::random());
        assert_eq!(
            validate_request(&request("1.0", Some(someone_else)), &local),
            Err(HandshakeError::InvalidTargetPeerDescriptor)
        );
    }
}
