//! Symmetric role selection for a peer pair.
//!
//! Both sides evaluate the same rules with the arguments swapped and reach
//! complementary answers without talking to each other.

use peerlink_types::{NodeId, PeerDescriptor};
use sha2::{Digest, Sha256};

use super::address::can_open_connection_from_browser;

/// How the local side establishes a connection to a given remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Dial the remote's WebSocket server.
    WebsocketClient,
    /// Ask the remote to dial our WebSocket server.
    WebsocketServer,
    /// WebRTC, as offerer or answerer.
    Webrtc { offerer: bool },
}

fn pair_hash(first: &NodeId, second: &NodeId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    hasher.finalize().into()
}

/// True when `hash(local + remote) < hash(remote + local)`.
///
/// Exactly one of `is_offering(a, b)` and `is_offering(b, a)` holds for
/// distinct ids. Also used as the tie-break when both sides race to connect.
pub fn is_offering(local: &NodeId, remote: &NodeId) -> bool {
    pair_hash(local, remote) < pair_hash(remote, local)
}

fn can_dial(from: &PeerDescriptor, to: &PeerDescriptor) -> bool {
    match &to.websocket {
        Some(server) => !from.is_browser() || can_open_connection_from_browser(server),
        None => false,
    }
}

/// Pick the transport and role for connecting `local` to `remote`.
///
/// - only one side can be dialled: that side is the server
/// - both can be dialled: the offering side dials
/// - neither: WebRTC with the hash-elected offerer
pub fn select_role(local: &PeerDescriptor, remote: &PeerDescriptor) -> ConnectionRole {
    let offering = is_offering(&local.node_id, &remote.node_id);
    match (can_dial(local, remote), can_dial(remote, local)) {
        (true, true) if offering => ConnectionRole::WebsocketClient,
        (true, true) => ConnectionRole::WebsocketServer,
        (true, false) => ConnectionRole::WebsocketClient,
        (false, true) => ConnectionRole::WebsocketServer,
        (false, false) => ConnectionRole::Webrtc { offerer: offering },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_types::{ConnectivityMethod, NodeType};

    fn server(host: &str, tls: bool) -> ConnectivityMethod {
        ConnectivityMethod::new(host, 40200, tls)
    }

    #[test]
    fn test_exactly_one_side_offers() {
        for _ in 0..200 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_ne!(is_offering(&a, &b), is_offering(&b, &a));
            assert_eq!(is_offering(&a, &b), is_offering(&a, &b));
        }
    }

    #[test]
    fn test_one_server_side_is_dialled() {
        let with_server = PeerDescriptor::new(NodeId::random()).with_websocket(server("203.0.113.5", false));
        let without = PeerDescriptor::new(NodeId::random());
        assert_eq!(select_role(&without, &with_server), ConnectionRole::WebsocketClient);
        assert_eq!(select_role(&with_server, &without), ConnectionRole::WebsocketServer);
    }

    #[test]
    fn test_both_servers_agree_on_single_dialer() {
        let a = PeerDescriptor::new(NodeId::random()).with_websocket(server("203.0.113.5", false));
        let b = PeerDescriptor::new(NodeId::random()).with_websocket(server("203.0.113.6", false));
        let roles = (select_role(&a, &b), select_role(&b, &a));
        assert!(
            roles == (ConnectionRole::WebsocketClient, ConnectionRole::WebsocketServer)
                || roles == (ConnectionRole::WebsocketServer, ConnectionRole::WebsocketClient)
        );
    }

    #[test]
    fn test_browser_cannot_reach_plain_public_server() {
        let browser = PeerDescriptor::new(NodeId::random()).with_node_type(NodeType::Browser);
        let plain = PeerDescriptor::new(NodeId::random()).with_websocket(server("203.0.113.5", false));
        let tls = PeerDescriptor::new(NodeId::random()).with_websocket(server("example.org", true));

        assert!(matches!(select_role(&browser, &plain), ConnectionRole::Webrtc { .. }));
        assert!(matches!(select_role(&plain, &browser), ConnectionRole::Webrtc { .. }));
        assert_eq!(select_role(&browser, &tls), ConnectionRole::WebsocketClient);
        assert_eq!(select_role(&tls, &browser), ConnectionRole::WebsocketServer);
    }

    #[test]
    fn test_webrtc_roles_are_complementary() {
        let a = PeerDescriptor::new(NodeId::random());
        let b = PeerDescriptor::new(NodeId::random());
        match (select_role(&a, &b), select_role(&b, &a)) {
            (ConnectionRole::Webrtc { offerer: x }, ConnectionRole::Webrtc { offerer: y }) => assert_ne!(x, y),
            other => panic!("unexpected roles {:?}", other),
        }
    }
}
