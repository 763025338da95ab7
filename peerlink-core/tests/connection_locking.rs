//! Connection locks across two simulated nodes.

use std::sync::Arc;
use std::time::Duration;

use peerlink_core::config::ConnectionConfig;
use peerlink_core::simulator::LatencyModel;
use peerlink_core::{ConnectionManager, NodeId, PeerDescriptor, Simulator};

async fn node(simulator: &Simulator) -> (Arc<ConnectionManager>, PeerDescriptor) {
    let descriptor = PeerDescriptor::new(NodeId::random());
    let manager = ConnectionManager::simulated(descriptor.clone(), simulator, ConnectionConfig::default());
    manager.start().await.unwrap();
    (manager, descriptor)
}

#[tokio::test(start_paused = true)]
async fn test_lock_is_mirrored_on_remote() {
    let simulator = Simulator::with_latency(LatencyModel::fixed_ms(10));
    let (alice, alice_descriptor) = node(&simulator).await;
    let (bob, bob_descriptor) = node(&simulator).await;

    alice.lock_connection(&bob_descriptor, "dht").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(alice.has_local_locked_connection(&bob_descriptor.node_id, Some("dht")));
    assert!(bob.has_remote_locked_connection(&alice_descriptor.node_id, Some("dht")));
    assert!(bob.is_connection_locked(&alice_descriptor.node_id));

    // a locked connection survives a disconnect attempt
    assert!(!alice.disconnect(&bob_descriptor));
    assert!(!bob.disconnect(&alice_descriptor));

    alice.stop().await;
    bob.stop().await;
    simulator.stop();
}

#[tokio::test(start_paused = true)]
async fn test_unlock_releases_connection() {
    let simulator = Simulator::with_latency(LatencyModel::fixed_ms(10));
    let (alice, alice_descriptor) = node(&simulator).await;
    let (bob, bob_descriptor) = node(&simulator).await;

    alice.lock_connection(&bob_descriptor, "dht").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.unlock_connection(&bob_descriptor, "dht").await;

    tokio::time::sleep(ConnectionConfig::default().disconnect_timeout() + Duration::from_secs(1)).await;
    assert!(!alice.has_connection(&bob_descriptor.node_id));
    assert!(!bob.has_connection(&alice_descriptor.node_id));
    assert_eq!(alice.locked_connection_count(), 0);
    assert_eq!(bob.locked_connection_count(), 0);

    alice.stop().await;
    bob.stop().await;
    simulator.stop();
}

#[tokio::test(start_paused = true)]
async fn test_weak_lock_stays_local() {
    let simulator = Simulator::with_latency(LatencyModel::fixed_ms(10));
    let (alice, alice_descriptor) = node(&simulator).await;
    let (bob, bob_descriptor) = node(&simulator).await;

    alice.send_payload(&bob_descriptor, "test", b"x".to_vec()).await.unwrap();
    alice.weak_lock_connection(&bob_descriptor, "cache");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(alice.is_connection_locked(&bob_descriptor.node_id));
    assert!(!bob.is_connection_locked(&alice_descriptor.node_id));
    assert!(!alice.disconnect(&bob_descriptor));

    alice.weak_unlock_connection(&bob_descriptor, "cache");
    assert!(alice.disconnect(&bob_descriptor));

    alice.stop().await;
    bob.stop().await;
    simulator.stop();
}
