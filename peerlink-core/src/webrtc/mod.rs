//! # WebRTC transport
//!
//! Data channel connections negotiated over the signalling relay. The
//! native stack sits behind [`RtcPlatform`]: [`WebrtcRsPlatform`] runs on
//! the `webrtc` crate, and [`LoopbackRtcPlatform`] is an in-process
//! implementation that negotiates and delivers between peer connections
//! created from the same platform value.
//!
//! ## Features
//!
//! - Offer/answer and trickled candidates tagged with a negotiation id
//! - Early timeout when no remote description arrives
//! - Connect timeout when the channel never opens
//! - Local `host` candidates rewritten to a configured external IP
//! - Private remote candidates filtered unless allowed
//! - Send backpressure between low and high buffer watermarks

pub mod candidate;
pub mod connection;
pub mod connector;
pub mod loopback;
pub mod native;
pub mod platform;

pub use candidate::CandidatePolicy;
pub use connection::{WebrtcConnection, DATA_CHANNEL_LABEL};
pub use connector::WebrtcConnector;
pub use loopback::LoopbackRtcPlatform;
pub use native::WebrtcRsPlatform;
pub use platform::{PeerConnectionState, RtcConfiguration, RtcEvent, RtcEvents, RtcPeerConnection, RtcPlatform, SdpType};
