//! In-memory [`RtcPlatform`] for tests and the simulator binary.
//!
//! Peer connections created by the same platform instance can reach each
//! other. Negotiation is faithful enough for the connector logic: the offer
//! comes from creating the data channel, applying an offer yields the
//! answer, candidates are only accepted after the remote description, and
//! the channel opens once both sides hold a description and a candidate.
//!
//! Delivery can be paused to build up a send buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::platform::{PeerConnectionState, RtcConfiguration, RtcEvent, RtcEvents, RtcPeerConnection, RtcPlatform, SdpType};
use crate::error::{PeerlinkError, Result};

const DEFAULT_CANDIDATE_ADDRESS: &str = "203.0.113.10";

struct Endpoint {
    events: mpsc::UnboundedSender<RtcEvent>,
    peer: Option<u64>,
    remote_description: bool,
    remote_candidate: bool,
    connected: bool,
    closed: bool,
    buffered: usize,
    low_threshold: usize,
}

impl Endpoint {
    fn emit(&self, event: RtcEvent) {
        if !self.closed {
            let _ = self.events.send(event);
        }
    }
}

struct InFlight {
    from: u64,
    to: u64,
    data: Bytes,
}

#[derive(Default)]
struct Network {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    paused: bool,
    in_flight: VecDeque<InFlight>,
}

impl Network {
    fn local_description(id: u64) -> String {
        format!("v=0\r\no=loopback {} 0 IN IP4 0.0.0.0\r\ns=-\r\n", id)
    }

    fn candidate(id: u64, address: &str) -> String {
        format!("candidate:{} 1 udp 2122260223 {} {} typ host", id, address, 50_000 + id % 10_000)
    }

    fn try_connect(&mut self, id: u64) {
        let Some(peer) = self.endpoints.get(&id).and_then(|e| e.peer) else {
            return;
        };
        let ready = |e: &Endpoint, other: u64| {
            e.peer == Some(other) && e.remote_description && e.remote_candidate && !e.connected && !e.closed
        };
        let both_ready = match (self.endpoints.get(&id), self.endpoints.get(&peer)) {
            (Some(a), Some(b)) => ready(a, peer) && ready(b, id),
            _ => false,
        };
        if !both_ready {
            return;
        }
        for endpoint_id in [id, peer] {
            if let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) {
                endpoint.connected = true;
                endpoint.emit(RtcEvent::StateChanged(PeerConnectionState::Connected));
                endpoint.emit(RtcEvent::ChannelOpen);
            }
        }
        trace!("loopback endpoints {} and {} connected", id, peer);
    }

    fn deliver(&mut self, packet: InFlight) {
        if let Some(sender) = self.endpoints.get_mut(&packet.from) {
            sender.buffered = sender.buffered.saturating_sub(packet.data.len());
        }
        if let Some(receiver) = self.endpoints.get(&packet.to) {
            receiver.emit(RtcEvent::ChannelMessage(packet.data));
        }
    }
}

/// 内存回环 WebRTC 平台
#[derive(Clone)]
pub struct LoopbackRtcPlatform {
    network: Arc<Mutex<Network>>,
    candidate_address: String,
}

impl Default for LoopbackRtcPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRtcPlatform {
    pub fn new() -> Self {
        Self {
            network: Arc::new(Mutex::new(Network::default())),
            candidate_address: DEFAULT_CANDIDATE_ADDRESS.to_string(),
        }
    }

    /// Same network, but local candidates carry `address`.
    pub fn with_candidate_address(&self, address: impl Into<String>) -> Self {
        Self {
            network: self.network.clone(),
            candidate_address: address.into(),
        }
    }

    /// Hold sent data in the sender's buffer until resumed.
    pub fn pause_delivery(&self) {
        self.network.lock().paused = true;
    }

    pub fn resume_delivery(&self) {
        let mut network = self.network.lock();
        network.paused = false;
        let mut drained = Vec::new();
        while let Some(packet) = network.in_flight.pop_front() {
            if !drained.contains(&packet.from) {
                drained.push(packet.from);
            }
            network.deliver(packet);
        }
        for id in drained {
            if let Some(endpoint) = network.endpoints.get(&id) {
                if endpoint.buffered <= endpoint.low_threshold {
                    endpoint.emit(RtcEvent::BufferedAmountLow);
                }
            }
        }
    }

    /// Report `Failed` on every connected peer connection.
    pub fn fail_all(&self) {
        let network = self.network.lock();
        for endpoint in network.endpoints.values().filter(|e| e.connected) {
            endpoint.emit(RtcEvent::StateChanged(PeerConnectionState::Failed));
        }
    }

    /// Peer connections not yet closed.
    pub fn open_peer_connections(&self) -> usize {
        self.network.lock().endpoints.values().filter(|e| !e.closed).count()
    }
}

impl RtcPlatform for LoopbackRtcPlatform {
    fn create_peer_connection(&self, _config: &RtcConfiguration) -> Result<(Arc<dyn RtcPeerConnection>, RtcEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut network = self.network.lock();
            network.next_id += 1;
            let id = network.next_id;
            network.endpoints.insert(
                id,
                Endpoint {
                    events: tx,
                    peer: None,
                    remote_description: false,
                    remote_candidate: false,
                    connected: false,
                    closed: false,
                    buffered: 0,
                    low_threshold: 0,
                },
            );
            id
        };
        let connection = LoopbackPeerConnection {
            id,
            network: self.network.clone(),
            candidate_address: self.candidate_address.clone(),
        };
        Ok((Arc::new(connection), rx))
    }
}

struct LoopbackPeerConnection {
    id: u64,
    network: Arc<Mutex<Network>>,
    candidate_address: String,
}

fn parse_endpoint(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=loopback "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

impl RtcPeerConnection for LoopbackPeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<()> {
        let network = self.network.lock();
        let endpoint = network
            .endpoints
            .get(&self.id)
            .ok_or_else(|| PeerlinkError::webrtc("peer connection is gone"))?;
        trace!("loopback endpoint {} created channel {}", self.id, label);
        endpoint.emit(RtcEvent::StateChanged(PeerConnectionState::Connecting));
        endpoint.emit(RtcEvent::LocalDescription {
            sdp: Network::local_description(self.id),
            sdp_type: SdpType::Offer,
        });
        endpoint.emit(RtcEvent::LocalCandidate {
            candidate: Network::candidate(self.id, &self.candidate_address),
            mid: "0".into(),
        });
        Ok(())
    }

    fn set_remote_description(&self, sdp: &str, sdp_type: SdpType) -> Result<()> {
        let peer = parse_endpoint(sdp).ok_or_else(|| PeerlinkError::webrtc("unparseable session description"))?;
        let mut network = self.network.lock();
        let endpoint = network
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(|| PeerlinkError::webrtc("peer connection is gone"))?;
        if endpoint.closed {
            return Err(PeerlinkError::webrtc("peer connection is closed"));
        }
        endpoint.peer = Some(peer);
        endpoint.remote_description = true;
        if sdp_type == SdpType::Offer {
            endpoint.emit(RtcEvent::StateChanged(PeerConnectionState::Connecting));
            endpoint.emit(RtcEvent::LocalDescription {
                sdp: Network::local_description(self.id),
                sdp_type: SdpType::Answer,
            });
            endpoint.emit(RtcEvent::LocalCandidate {
                candidate: Network::candidate(self.id, &self.candidate_address),
                mid: "0".into(),
            });
        }
        network.try_connect(self.id);
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: &str, _mid: &str) -> Result<()> {
        if !candidate.starts_with("candidate:") {
            return Err(PeerlinkError::webrtc(format!("malformed candidate '{}'", candidate)));
        }
        let mut network = self.network.lock();
        let endpoint = network
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(|| PeerlinkError::webrtc("peer connection is gone"))?;
        if !endpoint.remote_description {
            return Err(PeerlinkError::webrtc("candidate before remote description"));
        }
        endpoint.remote_candidate = true;
        network.try_connect(self.id);
        Ok(())
    }

    fn send(&self, data: Bytes) -> Result<()> {
        let mut network = self.network.lock();
        let (to, connected) = match network.endpoints.get(&self.id) {
            Some(endpoint) => (endpoint.peer, endpoint.connected && !endpoint.closed),
            None => (None, false),
        };
        let Some(to) = to.filter(|_| connected) else {
            return Err(PeerlinkError::webrtc("data channel is not open"));
        };
        let packet = InFlight {
            from: self.id,
            to,
            data,
        };
        if let Some(endpoint) = network.endpoints.get_mut(&self.id) {
            endpoint.buffered += packet.data.len();
        }
        if network.paused {
            network.in_flight.push_back(packet);
        } else {
            network.deliver(packet);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.network
            .lock()
            .endpoints
            .get(&self.id)
            .map(|e| e.buffered)
            .unwrap_or(0)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        if let Some(endpoint) = self.network.lock().endpoints.get_mut(&self.id) {
            endpoint.low_threshold = threshold;
        }
    }

    fn close(&self) {
        let mut network = self.network.lock();
        let peer = match network.endpoints.get_mut(&self.id) {
            Some(endpoint) if !endpoint.closed => {
                endpoint.closed = true;
                endpoint.peer
            }
            _ => return,
        };
        if let Some(peer) = peer.and_then(|p| network.endpoints.get(&p)) {
            if peer.peer == Some(self.id) && peer.connected {
                peer.emit(RtcEvent::ChannelClosed);
            }
        }
        network.in_flight.retain(|packet| packet.from != self.id && packet.to != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: Vec::new(),
            max_message_size: 1024,
            port_min: None,
            port_max: None,
            include_loopback: false,
        }
    }

    fn drain(events: &mut RtcEvents) -> Vec<RtcEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn description(events: &[RtcEvent]) -> Option<(String, SdpType)> {
        events.iter().find_map(|e| match e {
            RtcEvent::LocalDescription { sdp, sdp_type } => Some((sdp.clone(), *sdp_type)),
            _ => None,
        })
    }

    fn candidate(events: &[RtcEvent]) -> Option<String> {
        events.iter().find_map(|e| match e {
            RtcEvent::LocalCandidate { candidate, .. } => Some(candidate.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_negotiation_opens_both_channels() {
        let platform = LoopbackRtcPlatform::new();
        let (offerer, mut offerer_events) = platform.create_peer_connection(&config()).unwrap();
        let (answerer, mut answerer_events) = platform.create_peer_connection(&config()).unwrap();

        offerer.create_data_channel("peerlink").unwrap();
        let offered = drain(&mut offerer_events);
        let (offer, kind) = description(&offered).unwrap();
        assert_eq!(kind, SdpType::Offer);

        answerer.set_remote_description(&offer, SdpType::Offer).unwrap();
        let answered = drain(&mut answerer_events);
        let (answer, kind) = description(&answered).unwrap();
        assert_eq!(kind, SdpType::Answer);

        offerer.set_remote_description(&answer, SdpType::Answer).unwrap();
        offerer.add_remote_candidate(&candidate(&answered).unwrap(), "0").unwrap();
        answerer.add_remote_candidate(&candidate(&offered).unwrap(), "0").unwrap();

        assert!(drain(&mut offerer_events).contains(&RtcEvent::ChannelOpen));
        assert!(drain(&mut answerer_events).contains(&RtcEvent::ChannelOpen));

        offerer.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(
            drain(&mut answerer_events),
            vec![RtcEvent::ChannelMessage(Bytes::from_static(b"ping"))]
        );
    }

    #[test]
    fn test_candidate_before_description_is_refused() {
        let platform = LoopbackRtcPlatform::new();
        let (pc, _events) = platform.create_peer_connection(&config()).unwrap();
        assert!(pc.add_remote_candidate("candidate:1 1 udp 1 203.0.113.1 5000 typ host", "0").is_err());
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint(&Network::local_description(42)), Some(42));
        assert_eq!(parse_endpoint("v=0\r\n"), None);
    }
}
