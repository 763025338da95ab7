//! Address classification used by the inbound filter and the browser
//! reachability rule.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use peerlink_types::ConnectivityMethod;

pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Private, loopback, link-local or unspecified.
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_ipv4(&v4),
            None => is_private_ipv6(v6),
        },
    }
}

/// Host names are treated as public unless they are `localhost`.
pub fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map(|ip| is_private_address(&ip))
        .unwrap_or(false)
}

/// A browser may only open `wss://` or a server on a private/localhost
/// address (mixed-content rules).
pub fn can_open_connection_from_browser(server: &ConnectivityMethod) -> bool {
    server.tls || is_private_host(&server.host)
}
