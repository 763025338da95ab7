//! WebSocket 连接集成测试
//!
//! Real sockets on 127.0.0.1. Each test uses its own port range so the
//! tests can run in parallel.

use std::sync::Arc;
use std::time::Duration;

use peerlink_core::config::ConnectionConfig;
use peerlink_core::simulator::LatencyModel;
use peerlink_core::{
    Connection, ConnectionManager, ConnectionType, DisconnectReason, NodeId, PeerDescriptor, PeerlinkConfig, Simulator, Transport,
    TransportEvent, TransportEvents,
};

fn server_config(node_id: NodeId, port_min: u16) -> PeerlinkConfig {
    let mut config = PeerlinkConfig::default();
    config.node.node_id = Some(node_id.to_hex());
    config.websocket = config
        .websocket
        .with_port_range(port_min, port_min + 9)
        .with_private_addresses(true);
    config
}

fn client_config(node_id: NodeId) -> PeerlinkConfig {
    let mut config = PeerlinkConfig::default();
    config.node.node_id = Some(node_id.to_hex());
    config.connection = config.connection.with_private_client_mode(true);
    config
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

async fn next_disconnect(events: &mut TransportEvents) -> (PeerDescriptor, DisconnectReason) {
    loop {
        match events.recv().await {
            Some(TransportEvent::Disconnected { peer, reason }) => return (peer, reason),
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    }
}

#[tokio::test]
async fn test_client_dials_server() {
    let server = ConnectionManager::from_config(&server_config(NodeId::random(), 41300), None).unwrap();
    server.start().await.unwrap();
    let server_descriptor = server.local_peer_descriptor();
    let endpoint = server_descriptor.websocket.clone().expect("server endpoint advertised");
    assert!((41300..=41309).contains(&endpoint.port));

    let client = ConnectionManager::from_config(&client_config(NodeId::random()), None).unwrap();
    client.start().await.unwrap();
    assert!(client.local_peer_descriptor().websocket.is_none());
    let mut inbox = server.subscribe();

    for i in 0..3u8 {
        client.send_payload(&server_descriptor, "test/ws", vec![i]).await.unwrap();
    }
    for i in 0..3u8 {
        assert_eq!(next_payload(&mut inbox).await, vec![i]);
    }

    let managed = client.connection(&server_descriptor.node_id).unwrap();
    assert_eq!(managed.connection_type(), ConnectionType::WebsocketClient);
    let inbound = server.connection(&client.local_peer_descriptor().node_id).unwrap();
    assert_eq!(inbound.connection_type(), ConnectionType::WebsocketServer);

    // the server answers over the connection the client opened
    let mut client_inbox = client.subscribe();
    server
        .send_payload(&client.local_peer_descriptor(), "test/ws", b"ack".to_vec())
        .await
        .unwrap();
    assert_eq!(next_payload(&mut client_inbox).await, b"ack".to_vec());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_after_forced_close_is_new_object() {
    let server = ConnectionManager::from_config(&server_config(NodeId::random(), 41310), None).unwrap();
    server.start().await.unwrap();
    let server_descriptor = server.local_peer_descriptor();
    let client = ConnectionManager::from_config(&client_config(NodeId::random()), None).unwrap();
    client.start().await.unwrap();
    let client_descriptor = client.local_peer_descriptor();
    let mut server_events = server.subscribe();

    client.send_payload(&server_descriptor, "test/ws", b"one".to_vec()).await.unwrap();
    assert_eq!(next_payload(&mut server_events).await, b"one".to_vec());
    let first = client.connection(&server_descriptor.node_id).unwrap();
    first.close(DisconnectReason::Closed);

    let (peer, _) = next_disconnect(&mut server_events).await;
    assert_eq!(peer.node_id, client_descriptor.node_id);

    client.send_payload(&server_descriptor, "test/ws", b"two".to_vec()).await.unwrap();
    let second = client.connection(&server_descriptor.node_id).unwrap();
    assert_ne!(first.object_id(), second.object_id());
    assert!(first.is_closed());
    assert!(second.is_open());
    assert_eq!(next_payload(&mut server_events).await, b"two".to_vec());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_socket_dropped_by_server_disconnects_client() {
    let server = ConnectionManager::from_config(&server_config(NodeId::random(), 41330), None).unwrap();
    server.start().await.unwrap();
    let server_descriptor = server.local_peer_descriptor();
    let client = ConnectionManager::from_config(&client_config(NodeId::random()), None).unwrap();
    client.start().await.unwrap();
    let client_descriptor = client.local_peer_descriptor();
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    client.send_payload(&server_descriptor, "test/ws", b"one".to_vec()).await.unwrap();
    assert_eq!(next_payload(&mut server_events).await, b"one".to_vec());
    let first = client.connection(&server_descriptor.node_id).unwrap();

    // tear the socket down on the server without a close frame
    let inbound = server.connection(&client_descriptor.node_id).unwrap();
    inbound.implementation().expect("inbound socket").destroy();

    let (peer, reason) = tokio::time::timeout(Duration::from_secs(10), next_disconnect(&mut client_events))
        .await
        .expect("client noticed the dropped socket");
    assert_eq!(peer.node_id, server_descriptor.node_id);
    assert!(matches!(reason, DisconnectReason::TransportError | DisconnectReason::Closed));
    assert!(first.is_closed());
    assert!(!client.has_connection(&server_descriptor.node_id));

    client.send_payload(&server_descriptor, "test/ws", b"two".to_vec()).await.unwrap();
    let second = client.connection(&server_descriptor.node_id).unwrap();
    assert_ne!(first.object_id(), second.object_id());
    assert_eq!(next_payload(&mut server_events).await, b"two".to_vec());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_side_asks_client_to_connect() {
    let simulator = Simulator::with_latency(LatencyModel::None);
    let server_id = NodeId::random();
    let client_id = NodeId::random();
    let server_carrier =
        ConnectionManager::simulated(PeerDescriptor::new(server_id), &simulator, ConnectionConfig::default());
    let client_carrier =
        ConnectionManager::simulated(PeerDescriptor::new(client_id), &simulator, ConnectionConfig::default());
    server_carrier.start().await.unwrap();
    client_carrier.start().await.unwrap();

    let server = ConnectionManager::from_config(
        &server_config(server_id, 41320),
        Some(server_carrier.clone() as Arc<dyn Transport>),
    )
    .unwrap();
    let client = ConnectionManager::from_config(
        &client_config(client_id),
        Some(client_carrier.clone() as Arc<dyn Transport>),
    )
    .unwrap();
    server.start().await.unwrap();
    client.start().await.unwrap();
    let mut client_inbox = client.subscribe();

    // the client has no server: the request travels over signalling and
    // the client dials back
    let client_descriptor = client.local_peer_descriptor();
    let send = server.send_payload(&client_descriptor, "test/ws", b"dial me".to_vec());
    tokio::time::timeout(Duration::from_secs(10), send).await.unwrap().unwrap();
    assert_eq!(next_payload(&mut client_inbox).await, b"dial me".to_vec());

    let managed = client.connection(&server_id).unwrap();
    assert_eq!(managed.connection_type(), ConnectionType::WebsocketClient);

    client.stop().await;
    server.stop().await;
    client_carrier.stop().await;
    server_carrier.stop().await;
    simulator.stop();
}
