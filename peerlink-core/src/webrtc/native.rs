//! [`RtcPlatform`] over the `webrtc` crate.
//!
//! Each peer connection is driven by one task that owns the native
//! `RTCPeerConnection`. Calls on the handle are queued as commands and
//! applied in order; native callbacks are forwarded as [`RtcEvent`]s.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ::webrtc::api::setting_engine::SettingEngine;
use ::webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use ::webrtc::api::APIBuilder;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::platform::{PeerConnectionState, RtcConfiguration, RtcEvent, RtcEvents, RtcPeerConnection, RtcPlatform, SdpType};
use crate::error::{PeerlinkError, Result};

/// WebRTC 平台 (webrtc-rs)
#[derive(Debug, Clone, Default)]
pub struct WebrtcRsPlatform;

impl WebrtcRsPlatform {
    pub fn new() -> Self {
        Self
    }
}

fn setting_engine(config: &RtcConfiguration) -> Result<SettingEngine> {
    let mut engine = SettingEngine::default();
    engine.set_include_loopback_candidate(config.include_loopback);
    if let (Some(min), Some(max)) = (config.port_min, config.port_max) {
        let ephemeral = EphemeralUDP::new(min, max)
            .map_err(|e| PeerlinkError::webrtc(format!("invalid port range {}-{}: {}", min, max, e)))?;
        engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }
    Ok(engine)
}

fn rtc_configuration(config: &RtcConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            _ => PeerConnectionState::New,
        }
    }
}

impl RtcPlatform for WebrtcRsPlatform {
    fn create_peer_connection(&self, config: &RtcConfiguration) -> Result<(Arc<dyn RtcPeerConnection>, RtcEvents)> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PeerlinkError::webrtc(format!("no tokio runtime: {}", e)))?;
        let api = APIBuilder::new().with_setting_engine(setting_engine(config)?).build();

        let (events, rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let buffers = Arc::new(Buffers::default());
        let driver = Driver {
            events,
            buffers: buffers.clone(),
        };
        let configuration = rtc_configuration(config);
        runtime.spawn(async move {
            match api.new_peer_connection(configuration).await {
                Ok(peer) => driver.run(Arc::new(peer), command_rx).await,
                Err(e) => {
                    warn!("Could not create peer connection: {}", e);
                    driver.emit(RtcEvent::ChannelError(e.to_string()));
                }
            }
        });
        Ok((Arc::new(NativePeerConnection { commands, buffers }), rx))
    }
}

enum Command {
    CreateDataChannel(String),
    SetRemoteDescription { sdp: String, sdp_type: SdpType },
    AddCandidate { candidate: String, mid: String },
    Send(Bytes),
    Close,
}

/// Byte accounting shared by the handle and the driver task.
#[derive(Default)]
struct Buffers {
    /// Queued on the command channel, not yet handed to the data channel.
    queued: AtomicUsize,
    /// Last buffered amount reported by the data channel.
    native: AtomicUsize,
    low_threshold: AtomicUsize,
    /// Set once the total went above the low threshold.
    above_low: AtomicBool,
}

impl Buffers {
    fn total(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.native.load(Ordering::SeqCst)
    }

    /// `true` exactly once per drain below the low threshold.
    fn drained(&self) -> bool {
        self.total() <= self.low_threshold.load(Ordering::SeqCst) && self.above_low.swap(false, Ordering::SeqCst)
    }
}

struct NativePeerConnection {
    commands: mpsc::UnboundedSender<Command>,
    buffers: Arc<Buffers>,
}

impl NativePeerConnection {
    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PeerlinkError::webrtc("peer connection closed"))
    }
}

impl RtcPeerConnection for NativePeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<()> {
        self.submit(Command::CreateDataChannel(label.to_string()))
    }

    fn set_remote_description(&self, sdp: &str, sdp_type: SdpType) -> Result<()> {
        self.submit(Command::SetRemoteDescription {
            sdp: sdp.to_string(),
            sdp_type,
        })
    }

    fn add_remote_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        self.submit(Command::AddCandidate {
            candidate: candidate.to_string(),
            mid: mid.to_string(),
        })
    }

    fn send(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.buffers.queued.fetch_add(len, Ordering::SeqCst);
        if self.buffers.total() > self.buffers.low_threshold.load(Ordering::SeqCst) {
            self.buffers.above_low.store(true, Ordering::SeqCst);
        }
        self.submit(Command::Send(data)).map_err(|e| {
            self.buffers.queued.fetch_sub(len, Ordering::SeqCst);
            e
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffers.total()
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffers.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

#[derive(Clone)]
struct Driver {
    events: mpsc::UnboundedSender<RtcEvent>,
    buffers: Arc<Buffers>,
}

impl Driver {
    fn emit(&self, event: RtcEvent) {
        let _ = self.events.send(event);
    }

    async fn run(self, peer: Arc<RTCPeerConnection>, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (channel_tx, mut channel_rx) = mpsc::unbounded_channel::<Arc<RTCDataChannel>>();
        self.register_peer_callbacks(&peer, channel_tx);

        let mut channel: Option<Arc<RTCDataChannel>> = None;
        loop {
            tokio::select! {
                biased;
                Some(incoming) = channel_rx.recv() => {
                    trace!("Remote data channel '{}' announced", incoming.label());
                    channel = Some(incoming);
                }
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(Command::CreateDataChannel(label)) => {
                        match self.create_channel(&peer, &label).await {
                            Ok(created) => channel = Some(created),
                            Err(e) => self.emit(RtcEvent::ChannelError(e.to_string())),
                        }
                    }
                    Some(Command::SetRemoteDescription { sdp, sdp_type }) => {
                        if let Err(e) = self.apply_remote_description(&peer, sdp, sdp_type).await {
                            self.emit(RtcEvent::ChannelError(e.to_string()));
                        }
                    }
                    Some(Command::AddCandidate { candidate, mid }) => {
                        let init = RTCIceCandidateInit {
                            candidate,
                            sdp_mid: Some(mid),
                            ..Default::default()
                        };
                        if let Err(e) = peer.add_ice_candidate(init).await {
                            debug!("Remote candidate rejected: {}", e);
                        }
                    }
                    Some(Command::Send(data)) => {
                        // sends follow ChannelOpen, so an announced channel is on its way
                        if channel.is_none() {
                            channel = channel_rx.recv().await;
                        }
                        self.send(channel.as_ref(), data).await;
                    }
                },
            }
        }

        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        if let Err(e) = peer.close().await {
            debug!("Closing peer connection failed: {}", e);
        }
    }

    fn register_peer_callbacks(&self, peer: &RTCPeerConnection, channel_tx: mpsc::UnboundedSender<Arc<RTCDataChannel>>) {
        let driver = self.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                driver.emit(RtcEvent::LocalCandidate {
                    candidate: init.candidate,
                    mid: init.sdp_mid.unwrap_or_default(),
                });
            }
            Box::pin(async {})
        }));

        let driver = self.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            driver.emit(RtcEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let driver = self.clone();
        peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let driver = driver.clone();
            let channel_tx = channel_tx.clone();
            Box::pin(async move {
                driver.wire_channel(&channel).await;
                let _ = channel_tx.send(channel);
            })
        }));
    }

    /// Forward channel callbacks as events.
    async fn wire_channel(&self, channel: &Arc<RTCDataChannel>) {
        let driver = self.clone();
        channel.on_open(Box::new(move || {
            driver.emit(RtcEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let driver = self.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            driver.emit(RtcEvent::ChannelMessage(message.data));
            Box::pin(async {})
        }));

        let driver = self.clone();
        channel.on_close(Box::new(move || {
            driver.emit(RtcEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let driver = self.clone();
        channel.on_error(Box::new(move |e: ::webrtc::Error| {
            driver.emit(RtcEvent::ChannelError(e.to_string()));
            Box::pin(async {})
        }));

        channel
            .set_buffered_amount_low_threshold(self.buffers.low_threshold.load(Ordering::SeqCst))
            .await;
        let driver = self.clone();
        let watched = Arc::downgrade(channel);
        channel
            .on_buffered_amount_low(Box::new(move || {
                let driver = driver.clone();
                let watched = watched.clone();
                Box::pin(async move {
                    if let Some(channel) = watched.upgrade() {
                        driver.buffers.native.store(channel.buffered_amount().await, Ordering::SeqCst);
                    }
                    if driver.buffers.drained() {
                        driver.emit(RtcEvent::BufferedAmountLow);
                    }
                })
            }))
            .await;
    }

    async fn create_channel(&self, peer: &RTCPeerConnection, label: &str) -> Result<Arc<RTCDataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = peer
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| PeerlinkError::webrtc(e.to_string()))?;
        self.wire_channel(&channel).await;

        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| PeerlinkError::webrtc(e.to_string()))?;
        self.set_local_description(peer, offer, SdpType::Offer).await?;
        Ok(channel)
    }

    async fn apply_remote_description(&self, peer: &RTCPeerConnection, sdp: String, sdp_type: SdpType) -> Result<()> {
        let description = match sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| PeerlinkError::webrtc(e.to_string()))?;
        peer.set_remote_description(description)
            .await
            .map_err(|e| PeerlinkError::webrtc(e.to_string()))?;

        if sdp_type == SdpType::Offer {
            let answer = peer
                .create_answer(None)
                .await
                .map_err(|e| PeerlinkError::webrtc(e.to_string()))?;
            self.set_local_description(peer, answer, SdpType::Answer).await?;
        }
        Ok(())
    }

    /// Applying the local description starts candidate gathering.
    async fn set_local_description(
        &self,
        peer: &RTCPeerConnection,
        description: RTCSessionDescription,
        sdp_type: SdpType,
    ) -> Result<()> {
        let sdp = description.sdp.clone();
        peer.set_local_description(description)
            .await
            .map_err(|e| PeerlinkError::webrtc(e.to_string()))?;
        self.emit(RtcEvent::LocalDescription { sdp, sdp_type });
        Ok(())
    }

    async fn send(&self, channel: Option<&Arc<RTCDataChannel>>, data: Bytes) {
        let len = data.len();
        let result = match channel {
            Some(channel) => {
                let sent = channel.send(&data).await;
                self.buffers.native.store(channel.buffered_amount().await, Ordering::SeqCst);
                sent.map(|_| ()).map_err(|e| e.to_string())
            }
            None => Err("data channel not ready".to_string()),
        };
        self.buffers.queued.fetch_sub(len, Ordering::SeqCst);
        match result {
            Ok(()) => {
                if self.buffers.drained() {
                    self.emit(RtcEvent::BufferedAmountLow);
                }
            }
            Err(e) => self.emit(RtcEvent::ChannelError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IceServer, WebrtcConfig};

    #[test]
    fn test_ice_servers_carry_credentials() {
        let config = WebrtcConfig {
            ice_servers: vec![
                IceServer {
                    url: "stun:stun.l.google.com:19302".to_string(),
                    username: None,
                    credential: None,
                },
                IceServer {
                    url: "turn:turn.example.org:3478".to_string(),
                    username: Some("peer".to_string()),
                    credential: Some("secret".to_string()),
                },
            ],
            ..WebrtcConfig::default()
        };
        let native = rtc_configuration(&RtcConfiguration::from(&config));
        assert_eq!(native.ice_servers.len(), 2);
        assert_eq!(native.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert_eq!(native.ice_servers[1].username, "peer");
        assert_eq!(native.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_drain_reported_once() {
        let buffers = Buffers::default();
        buffers.low_threshold.store(16, Ordering::SeqCst);
        buffers.queued.store(100, Ordering::SeqCst);
        buffers.above_low.store(true, Ordering::SeqCst);
        assert!(!buffers.drained());

        buffers.queued.store(0, Ordering::SeqCst);
        buffers.native.store(8, Ordering::SeqCst);
        assert!(buffers.drained());
        assert!(!buffers.drained());
    }

    #[test]
    fn test_terminal_states_map_across() {
        assert_eq!(PeerConnectionState::from(RTCPeerConnectionState::Failed), PeerConnectionState::Failed);
        assert!(PeerConnectionState::from(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(!PeerConnectionState::from(RTCPeerConnectionState::Connecting).is_terminal());
    }

    #[tokio::test]
    async fn test_offer_is_produced_for_data_channel() {
        let platform = WebrtcRsPlatform::new();
        let (peer, mut events) = platform
            .create_peer_connection(&RtcConfiguration::from(&WebrtcConfig::default()))
            .unwrap();
        peer.create_data_channel("peerlink").unwrap();

        let offer = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(RtcEvent::LocalDescription { sdp, sdp_type }) => return Some((sdp, sdp_type)),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .unwrap();
        let (sdp, sdp_type) = offer.expect("local offer");
        assert_eq!(sdp_type, SdpType::Offer);
        assert!(sdp.contains("webrtc-datachannel"));
        peer.close();
    }

    #[test]
    fn test_requires_runtime() {
        let platform = WebrtcRsPlatform::new();
        assert!(platform
            .create_peer_connection(&RtcConfiguration::from(&WebrtcConfig::default()))
            .is_err());
    }
}
