//! # WebSocket transport
//!
//! ## Features
//!
//! - Client dial with connect timeout (`DEAD_CONNECTION` on expiry)
//! - Server bound to the first free port of a configured range
//! - Inbound filter for private/loopback peers
//! - Upgrade path classification:
//!
//! | Path                               | Purpose                              |
//! |------------------------------------|--------------------------------------|
//! | `/`                                | peer connection, handshake follows   |
//! | `/?action=connectivityRequest`     | entry point connectivity check       |
//! | `/?action=connectivityProbe`       | reachability probe from entry point  |
//!
//! - Connection requests: a peer that can only be reached through our
//!   server is asked, over signalling, to dial us

pub mod connection;
pub mod connectivity;
pub mod connector;
pub mod server;

pub use connection::WebsocketConnection;
pub use connectivity::{check_connectivity, ENTRY_POINT_CONNECTION_ATTEMPTS};
pub use connector::WebsocketConnector;
pub use server::{ServerConnection, WebsocketServer};

use peerlink_types::ConnectivityMethod;

/// What an upgrade request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Peer,
    ConnectivityRequest,
    ConnectivityProbe,
}

impl ServerAction {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            ServerAction::Peer => None,
            ServerAction::ConnectivityRequest => Some("connectivityRequest"),
            ServerAction::ConnectivityProbe => Some("connectivityProbe"),
        }
    }

    /// Classify by the `action` query parameter. Unknown actions are
    /// treated as peer connections.
    pub fn from_query(query: Option<&str>) -> Self {
        let action = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "action")
                .map(|(_, value)| value)
        });
        match action {
            Some("connectivityRequest") => ServerAction::ConnectivityRequest,
            Some("connectivityProbe") => ServerAction::ConnectivityProbe,
            _ => ServerAction::Peer,
        }
    }
}

/// URL for `action` on the server at `method`.
pub fn action_url(method: &ConnectivityMethod, action: ServerAction) -> String {
    match action.as_str() {
        Some(action) => format!("{}/?action={}", method.url(), action),
        None => method.url(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_classification() {
        assert_eq!(ServerAction::from_query(None), ServerAction::Peer);
        assert_eq!(
            ServerAction::from_query(Some("action=connectivityRequest")),
            ServerAction::ConnectivityRequest
        );
        assert_eq!(
            ServerAction::from_query(Some("x=1&action=connectivityProbe")),
            ServerAction::ConnectivityProbe
        );
        assert_eq!(ServerAction::from_query(Some("action=bogus")), ServerAction::Peer);
    }

    #[test]
    fn test_action_url() {
        let method = ConnectivityMethod::new("example.org", 40200, true);
        assert_eq!(
            action_url(&method, ServerAction::ConnectivityRequest),
            "wss://example.org:40200/?action=connectivityRequest"
        );
        assert_eq!(action_url(&method, ServerAction::Peer), "wss://example.org:40200");
    }
}
