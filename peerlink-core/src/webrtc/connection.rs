//! WebRTC data channel connection.
//!
//! ```text
//!  new ──▶ negotiating ──ChannelOpen──▶ open ──▶ closed
//!             │  early timeout (no remote description)  → OTHER
//!             │  connect timeout (not open)              → OTHER
//!             │  candidate before remote description     → OTHER
//!             └─ peer state closed/disconnected/failed   → closed
//! ```
//!
//! Backpressure is published on a `watch` channel: `false` once the
//! buffered amount passes the high watermark, `true` again when the
//! platform reports it fell to the low watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_types::{ConnectionType, DisconnectReason, PeerDescriptor, Signal};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::candidate::CandidatePolicy;
use super::platform::{PeerConnectionState, RtcConfiguration, RtcEvent, RtcEvents, RtcPeerConnection, RtcPlatform, SdpType};
use crate::config::WebrtcConfig;
use crate::connection::{Connection, ConnectionCore, ConnectionEvents, ConnectionId};
use crate::error::{Result, TransportError};
use crate::signalling::{SignalRelay, WEBRTC_SIGNAL_SERVICE_ID};

pub const DATA_CHANNEL_LABEL: &str = "peerlink";

pub struct WebrtcConnection {
    core: ConnectionCore,
    remote: PeerDescriptor,
    offerer: bool,
    /// Tags every signal of one negotiation. The answerer adopts the
    /// offerer's id.
    negotiation_id: Mutex<String>,
    peer: Arc<dyn RtcPeerConnection>,
    remote_description_set: AtomicBool,
    relay: Arc<dyn SignalRelay>,
    policy: CandidatePolicy,
    max_message_size: usize,
    buffer_threshold_high: usize,
    writable: watch::Sender<bool>,
}

impl WebrtcConnection {
    /// Create the peer connection and start negotiating. The offerer
    /// creates the data channel right away; the answerer waits for an
    /// offer.
    pub fn new(
        remote: PeerDescriptor,
        offerer: bool,
        platform: &dyn RtcPlatform,
        config: &WebrtcConfig,
        relay: Arc<dyn SignalRelay>,
    ) -> Result<(Arc<Self>, ConnectionEvents)> {
        let (peer, rtc_events) = platform.create_peer_connection(&RtcConfiguration::from(config))?;
        peer.set_buffered_amount_low_threshold(config.buffer_threshold_low);

        let (core, events) = ConnectionCore::new(ConnectionType::Webrtc, Some(remote.clone()));
        let (writable, _) = watch::channel(true);
        let connection = Arc::new(Self {
            core,
            remote,
            offerer,
            negotiation_id: Mutex::new(uuid::Uuid::new_v4().to_string()),
            peer,
            remote_description_set: AtomicBool::new(false),
            relay,
            policy: CandidatePolicy {
                allow_private_addresses: config.allow_private_addresses,
                external_ip: config.external_ip.clone(),
            },
            max_message_size: config.max_message_size,
            buffer_threshold_high: config.buffer_threshold_high,
            writable,
        });

        tokio::spawn(connection.clone().run(rtc_events, config.early_timeout(), config.connect_timeout()));
        if offerer {
            if let Err(e) = connection.peer.create_data_channel(DATA_CHANNEL_LABEL) {
                connection.close(DisconnectReason::Other);
                return Err(e);
            }
        }
        debug!(
            "{} negotiating with {} as {}",
            connection.core.id(),
            connection.remote.node_id.short(),
            if offerer { "offerer" } else { "answerer" }
        );
        Ok((connection, events))
    }

    pub fn is_offerer(&self) -> bool {
        self.offerer
    }

    pub fn negotiation_id(&self) -> String {
        self.negotiation_id.lock().clone()
    }

    pub(crate) fn set_negotiation_id(&self, id: &str) {
        *self.negotiation_id.lock() = id.to_string();
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set.load(Ordering::SeqCst)
    }

    pub(crate) fn set_remote_description(&self, sdp: &str, sdp_type: SdpType) {
        if self.core.is_closed() {
            return;
        }
        match self.peer.set_remote_description(sdp, sdp_type) {
            Ok(()) => {
                self.remote_description_set.store(true, Ordering::SeqCst);
                trace!("{} remote {} applied", self.core.id(), sdp_type);
            }
            Err(e) => debug!("{} could not apply remote {}: {}", self.core.id(), sdp_type, e),
        }
    }

    pub(crate) fn add_remote_candidate(&self, candidate: &str, mid: &str) {
        if self.core.is_closed() {
            return;
        }
        if !self.has_remote_description() {
            debug!("{} got a candidate before the remote description", self.core.id());
            self.close(DisconnectReason::Other);
            return;
        }
        if !self.policy.accepts(candidate) {
            trace!("{} dropping private candidate {}", self.core.id(), candidate);
            return;
        }
        if let Err(e) = self.peer.add_remote_candidate(candidate, mid) {
            debug!("{} could not add remote candidate: {}", self.core.id(), e);
        }
    }

    /// `true` while sends may proceed without piling up.
    pub fn writable(&self) -> watch::Receiver<bool> {
        self.writable.subscribe()
    }

    pub fn is_writable(&self) -> bool {
        *self.writable.borrow()
    }

    pub fn buffered_amount(&self) -> usize {
        self.peer.buffered_amount()
    }

    async fn run(self: Arc<Self>, mut events: RtcEvents, early_timeout: Duration, connect_timeout: Duration) {
        let lifetime = self.core.child_token();
        let early = tokio::time::sleep(early_timeout);
        let connect = tokio::time::sleep(connect_timeout);
        tokio::pin!(early);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                _ = &mut early, if !self.has_remote_description() => {
                    debug!("{} remote description not set within {:?}", self.core.id(), early_timeout);
                    self.close(DisconnectReason::Other);
                    break;
                }
                _ = &mut connect, if !self.core.is_open() => {
                    debug!("{} not open within {:?}", self.core.id(), connect_timeout);
                    self.close(DisconnectReason::Other);
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        self.close(DisconnectReason::Other);
                        break;
                    }
                },
            }
        }
    }

    fn on_event(&self, event: RtcEvent) {
        match event {
            RtcEvent::LocalDescription { sdp, sdp_type } => {
                let connection_id = self.negotiation_id();
                let signal = match sdp_type {
                    SdpType::Offer => Signal::RtcOffer {
                        description: sdp,
                        connection_id,
                    },
                    SdpType::Answer => Signal::RtcAnswer {
                        description: sdp,
                        connection_id,
                    },
                };
                self.relay.send_signal(&self.remote, WEBRTC_SIGNAL_SERVICE_ID, signal);
            }
            RtcEvent::LocalCandidate { candidate, mid } => {
                let signal = Signal::IceCandidate {
                    candidate: self.policy.outgoing(candidate),
                    mid,
                    connection_id: self.negotiation_id(),
                };
                self.relay.send_signal(&self.remote, WEBRTC_SIGNAL_SERVICE_ID, signal);
            }
            RtcEvent::StateChanged(state) => {
                trace!("{} peer connection {:?}", self.core.id(), state);
                if state.is_terminal() {
                    let reason = if state == PeerConnectionState::Failed {
                        DisconnectReason::TransportError
                    } else {
                        DisconnectReason::Closed
                    };
                    self.close(reason);
                }
            }
            RtcEvent::ChannelOpen => {
                self.core.mark_open(|data| self.write(data));
            }
            RtcEvent::ChannelMessage(data) => self.core.emit_data(data),
            RtcEvent::ChannelClosed => self.close(DisconnectReason::Closed),
            RtcEvent::ChannelError(e) => {
                warn!("{} data channel error: {}", self.core.id(), e);
                self.close(DisconnectReason::TransportError);
            }
            RtcEvent::BufferedAmountLow => {
                let resumed = self.writable.send_if_modified(|writable| !std::mem::replace(writable, true));
                if resumed {
                    debug!("{} drained, resuming sends", self.core.id());
                }
            }
        }
    }

    fn write(&self, data: Bytes) -> std::result::Result<(), TransportError> {
        if data.len() > self.max_message_size {
            return Err(TransportError::SendFailed(format!(
                "message of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_message_size
            )));
        }
        self.peer
            .send(data)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if self.peer.buffered_amount() > self.buffer_threshold_high {
            let paused = self.writable.send_if_modified(|writable| std::mem::replace(writable, false));
            if paused {
                debug!("{} buffer above {} bytes, pausing sends", self.core.id(), self.buffer_threshold_high);
            }
        }
        Ok(())
    }
}

impl Connection for WebrtcConnection {
    fn connection_id(&self) -> ConnectionId {
        self.core.id()
    }

    fn connection_type(&self) -> ConnectionType {
        self.core.connection_type()
    }

    fn remote_peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.core.remote()
    }

    fn set_remote_peer_descriptor(&self, descriptor: PeerDescriptor) {
        self.core.set_remote(descriptor);
    }

    fn send(&self, data: Bytes) -> std::result::Result<(), TransportError> {
        self.core.send_or_buffer(data, |data| self.write(data))
    }

    fn close(&self, reason: DisconnectReason) {
        if self.core.close(reason) {
            self.peer.close();
        }
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
