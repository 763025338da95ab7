//! Native WebRTC seam.
//!
//! A platform creates peer connections and reports everything they do as
//! [`RtcEvent`]s on a channel, the way callback-style bindings
//! (libdatachannel and friends) surface them.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{IceServer, WebrtcConfig};
use crate::error::Result;

/// SDP 描述类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the peer connection is unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed | PeerConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtcEvent {
    LocalDescription { sdp: String, sdp_type: SdpType },
    LocalCandidate { candidate: String, mid: String },
    StateChanged(PeerConnectionState),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
    ChannelError(String),
    /// Buffered amount fell to the low threshold.
    BufferedAmountLow,
}

pub type RtcEvents = mpsc::UnboundedReceiver<RtcEvent>;

/// Options handed to the platform for one peer connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub max_message_size: usize,
    pub port_min: Option<u16>,
    pub port_max: Option<u16>,
    /// Gather loopback candidates too.
    pub include_loopback: bool,
}

impl From<&WebrtcConfig> for RtcConfiguration {
    fn from(config: &WebrtcConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            max_message_size: config.max_message_size,
            port_min: config.port_min,
            port_max: config.port_max,
            include_loopback: config.allow_private_addresses,
        }
    }
}

pub trait RtcPeerConnection: Send + Sync {
    /// Offerer only: create the data channel, which starts negotiation and
    /// yields the local offer.
    fn create_data_channel(&self, label: &str) -> Result<()>;

    /// Apply the remote description. Applying an offer yields the local
    /// answer.
    fn set_remote_description(&self, sdp: &str, sdp_type: SdpType) -> Result<()>;

    fn add_remote_candidate(&self, candidate: &str, mid: &str) -> Result<()>;

    /// Queue `data` on the data channel.
    fn send(&self, data: Bytes) -> Result<()>;

    /// Bytes queued on the data channel and not yet sent.
    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    fn close(&self);
}

pub trait RtcPlatform: Send + Sync {
    fn create_peer_connection(&self, config: &RtcConfiguration) -> Result<(Arc<dyn RtcPeerConnection>, RtcEvents)>;
}
