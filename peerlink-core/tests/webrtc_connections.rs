//! WebRTC 连接集成测试
//!
//! Each node pairs a WebRTC manager with a simulated carrier manager under
//! the same node id; the carrier relays the negotiation signals. Data
//! channels run on the in-memory loopback platform, or on the `webrtc`
//! crate when no platform is given.

use std::sync::Arc;
use std::time::Duration;

use peerlink_core::config::ConnectionConfig;
use peerlink_core::simulator::LatencyModel;
use peerlink_core::webrtc::LoopbackRtcPlatform;
use peerlink_core::{
    ConnectionManager, ConnectionType, NodeId, PeerDescriptor, PeerlinkConfig, Simulator, Transport,
    TransportEvent, TransportEvents,
};

struct RtcNode {
    manager: Arc<ConnectionManager>,
    carrier: Arc<ConnectionManager>,
    descriptor: PeerDescriptor,
}

impl RtcNode {
    async fn start(simulator: &Simulator, platform: Option<&LoopbackRtcPlatform>) -> Self {
        let node_id = NodeId::random();
        let carrier = ConnectionManager::simulated(PeerDescriptor::new(node_id), simulator, ConnectionConfig::default());
        carrier.start().await.unwrap();

        let mut config = PeerlinkConfig::default();
        config.node.node_id = Some(node_id.to_hex());
        config.websocket.server_enabled = false;
        // both ends live on this host
        config.webrtc.allow_private_addresses = true;
        let signalling = Some(carrier.clone() as Arc<dyn Transport>);
        let manager = match platform {
            Some(platform) => ConnectionManager::with_rtc_platform(&config, signalling, Arc::new(platform.clone())),
            None => ConnectionManager::from_config(&config, signalling),
        }
        .unwrap();
        manager.start().await.unwrap();
        let descriptor = manager.local_peer_descriptor();
        assert!(descriptor.websocket.is_none());
        Self {
            manager,
            carrier,
            descriptor,
        }
    }

    async fn stop(&self) {
        self.manager.stop().await;
        self.carrier.stop().await;
    }
}

async fn next_payload(events: &mut TransportEvents) -> Vec<u8> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Message(message)) => {
                if let Some(bytes) = message.payload_bytes() {
                    return bytes.to_vec();
                }
            }
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_data_channel_carries_messages_both_ways() {
    let simulator = Simulator::with_latency(LatencyModel::fixed_ms(5));
    let platform = LoopbackRtcPlatform::new();
    let alice = RtcNode::start(&simulator, Some(&platform)).await;
    let bob = RtcNode::start(&simulator, Some(&platform)).await;
    let mut alice_inbox = alice.manager.subscribe();
    let mut bob_inbox = bob.manager.subscribe();

    alice.manager.send_payload(&bob.descriptor, "test/rtc", b"ping".to_vec()).await.unwrap();
    assert_eq!(next_payload(&mut bob_inbox).await, b"ping".to_vec());

    bob.manager.send_payload(&alice.descriptor, "test/rtc", b"pong".to_vec()).await.unwrap();
    assert_eq!(next_payload(&mut alice_inbox).await, b"pong".to_vec());

    let managed = alice.manager.connection(&bob.descriptor.node_id).unwrap();
    assert_eq!(managed.connection_type(), ConnectionType::Webrtc);
    assert_eq!(alice.manager.connection_count(), 1);
    assert_eq!(bob.manager.connection_count(), 1);

    alice.stop().await;
    bob.stop().await;
    simulator.stop();
}

#[tokio::test(start_paused = true)]
async fn test_either_side_may_initiate() {
    let simulator = Simulator::with_latency(LatencyModel::fixed_ms(5));
    let platform = LoopbackRtcPlatform::new();
    let nodes = [
        RtcNode::start(&simulator, Some(&platform)).await,
        RtcNode::start(&simulator, Some(&platform)).await,
        RtcNode::start(&simulator, Some(&platform)).await,
    ];
    let hub = &nodes[0];
    let mut inbox = hub.manager.subscribe();

    // whichever side the pair hash elects as offerer, the hub is reached
    for node in &nodes[1..] {
        node.manager.send_payload(&hub.descriptor, "test/rtc", b"hello".to_vec()).await.unwrap();
        assert_eq!(next_payload(&mut inbox).await, b"hello".to_vec());
    }
    assert_eq!(hub.manager.connection_count(), 2);

    for node in &nodes {
        node.stop().await;
    }
    simulator.stop();
}

#[tokio::test(start_paused = true)]
async fn test_channel_failure_disconnects() {
    let simulator = Simulator::with_latency(LatencyModel::fixed_ms(5));
    let platform = LoopbackRtcPlatform::new();
    let alice = RtcNode::start(&simulator, Some(&platform)).await;
    let bob = RtcNode::start(&simulator, Some(&platform)).await;
    let mut alice_events = alice.manager.subscribe();

    alice.manager.send_payload(&bob.descriptor, "test/rtc", b"x".to_vec()).await.unwrap();
    platform.fail_all();

    loop {
        match alice_events.recv().await {
            Some(TransportEvent::Disconnected { peer, .. }) => {
                assert_eq!(peer.node_id, bob.descriptor.node_id);
                break;
            }
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    }
    assert!(!alice.manager.has_connection(&bob.descriptor.node_id));

    alice.stop().await;
    bob.stop().await;
    simulator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_platform_connects_over_native_stack() {
    let simulator = Simulator::with_latency(LatencyModel::None);
    let alice = RtcNode::start(&simulator, None).await;
    let bob = RtcNode::start(&simulator, None).await;
    let mut bob_inbox = bob.manager.subscribe();

    let send = alice.manager.send_payload(&bob.descriptor, "test/rtc", b"native".to_vec());
    tokio::time::timeout(Duration::from_secs(30), send).await.unwrap().unwrap();
    let received = tokio::time::timeout(Duration::from_secs(10), next_payload(&mut bob_inbox)).await.unwrap();
    assert_eq!(received, b"native".to_vec());

    let managed = alice.manager.connection(&bob.descriptor.node_id).unwrap();
    assert_eq!(managed.connection_type(), ConnectionType::Webrtc);

    alice.stop().await;
    bob.stop().await;
    simulator.stop();
}
