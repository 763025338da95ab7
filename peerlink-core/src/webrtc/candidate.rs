//! ICE candidate rewriting and filtering.
//!
//! Candidate lines follow RFC 5245:
//! `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...`

use std::net::IpAddr;

use crate::connection::address::is_private_address;

const ADDRESS_FIELD: usize = 4;
const TYPE_FIELD: usize = 7;

/// Address of a candidate, if it is an IP literal (mDNS names are not).
pub fn candidate_address(candidate: &str) -> Option<IpAddr> {
    candidate.split(' ').nth(ADDRESS_FIELD)?.parse().ok()
}

/// Replace the address of a `host` candidate with `external_ip`. Other
/// candidate types are returned unchanged.
pub fn replace_internal_ip(candidate: &str, external_ip: &str) -> String {
    let mut fields: Vec<&str> = candidate.split(' ').collect();
    if fields.get(TYPE_FIELD) == Some(&"host") && fields.len() > ADDRESS_FIELD {
        fields[ADDRESS_FIELD] = external_ip;
    }
    fields.join(" ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub allow_private_addresses: bool,
    pub external_ip: Option<String>,
}

impl CandidatePolicy {
    /// Local candidate as it should be sent to the remote.
    pub fn outgoing(&self, candidate: String) -> String {
        match &self.external_ip {
            Some(ip) => replace_internal_ip(&candidate, ip),
            None => candidate,
        }
    }

    /// Whether a remote candidate may be applied.
    pub fn accepts(&self, candidate: &str) -> bool {
        if self.allow_private_addresses {
            return true;
        }
        candidate_address(candidate)
            .map(|ip| !is_private_address(&ip))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "candidate:1 1 udp 2122260223 192.168.1.20 54400 typ host generation 0";
    const SRFLX: &str = "candidate:2 1 udp 1686052607 198.51.100.7 54400 typ srflx raddr 192.168.1.20 rport 54400";

    #[test]
    fn test_host_candidate_gets_external_ip() {
        assert_eq!(
            replace_internal_ip(HOST, "203.0.113.9"),
            "candidate:1 1 udp 2122260223 203.0.113.9 54400 typ host generation 0"
        );
        assert_eq!(replace_internal_ip(SRFLX, "203.0.113.9"), SRFLX);
    }

    #[test]
    fn test_private_candidates_filtered() {
        let strict = CandidatePolicy::default();
        assert!(!strict.accepts(HOST));
        assert!(strict.accepts(SRFLX));
        assert!(strict.accepts("candidate:3 1 udp 1 abcd.local 5000 typ host"));

        let permissive = CandidatePolicy {
            allow_private_addresses: true,
            external_ip: None,
        };
        assert!(permissive.accepts(HOST));
    }
}
