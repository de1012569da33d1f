//! Record parsing, domain validation and normalization.

use libp2p::Multiaddr;
use libp2p::multiaddr::Protocol;
use strand_api::PeerInfo;

use crate::error::DnsDiscoveryError;

/// Literal every TXT record must begin with.
pub const RECORD_PREFIX: &str = "dnsaddr=";

/// Label prepended to a domain to form the TXT query name.
pub const QUERY_PREFIX: &str = "_dnsaddr.";

/// One parsed TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAddrEntry {
    /// A concrete peer with one transport address.
    Peer(PeerInfo),
    /// A nested `/dnsaddr/<domain>` reference to resolve recursively.
    Nested(String),
}

/// Parse a single `dnsaddr=` TXT record.
pub fn parse_dnsaddr(record: &str) -> Result<DnsAddrEntry, DnsDiscoveryError> {
    let value = record
        .strip_prefix(RECORD_PREFIX)
        .ok_or(DnsDiscoveryError::MissingPrefix)?;

    if let Some(nested) = value.strip_prefix("/dnsaddr/") {
        if nested.is_empty() {
            return Err(DnsDiscoveryError::EmptyNestedDomain);
        }
        return Ok(DnsAddrEntry::Nested(nested.to_string()));
    }

    let addr: Multiaddr = value
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| DnsDiscoveryError::MalformedAddr(e.to_string()))?;

    let mut transport = Multiaddr::empty();
    let mut peer_id = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2p(id) => peer_id = Some(id),
            other => transport.push(other),
        }
    }
    let peer_id = peer_id.ok_or(DnsDiscoveryError::MissingPeerId)?;

    Ok(DnsAddrEntry::Peer(PeerInfo::new(peer_id, vec![transport])))
}

/// Strip trailing dots and prepend the `_dnsaddr.` query label when missing.
pub fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.starts_with(QUERY_PREFIX) {
        trimmed.to_string()
    } else {
        format!("{QUERY_PREFIX}{trimmed}")
    }
}

/// DNS-shaped name check: total length ≤ 253, labels of 1–63 ASCII
/// alphanumerics plus `-`/`_`, starting alphanumeric, not ending with `-`.
pub fn validate_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    domain.split('.').all(|label| {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if !label.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return false;
        }
        if label.ends_with('-') {
            return false;
        }
        label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use strand_test_utils::test_peer_id;

    use super::*;

    #[test]
    fn test_parse_direct_peer_record() {
        let peer = test_peer_id(1);
        let record = format!("dnsaddr=/ip4/1.2.3.4/tcp/4001/p2p/{peer}");

        match parse_dnsaddr(&record).unwrap() {
            DnsAddrEntry::Peer(info) => {
                assert_eq!(info.peer_id, peer);
                assert_eq!(
                    info.addrs,
                    vec!["/ip4/1.2.3.4/tcp/4001".parse::<Multiaddr>().unwrap()]
                );
            }
            other => panic!("expected peer entry, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_nested_reference() {
        assert_eq!(
            parse_dnsaddr("dnsaddr=/dnsaddr/leaf.test").unwrap(),
            DnsAddrEntry::Nested("leaf.test".to_string())
        );
    }

    #[test]
    fn test_parse_empty_nested_domain_fails() {
        assert!(matches!(
            parse_dnsaddr("dnsaddr=/dnsaddr/"),
            Err(DnsDiscoveryError::EmptyNestedDomain)
        ));
    }

    #[test]
    fn test_parse_requires_prefix() {
        assert!(matches!(
            parse_dnsaddr("/ip4/1.2.3.4/tcp/4001"),
            Err(DnsDiscoveryError::MissingPrefix)
        ));
    }

    #[test]
    fn test_parse_requires_peer_id() {
        assert!(matches!(
            parse_dnsaddr("dnsaddr=/ip4/1.2.3.4/tcp/4001"),
            Err(DnsDiscoveryError::MissingPeerId)
        ));
    }

    #[test]
    fn test_parse_rejects_garbage_addr() {
        assert!(matches!(
            parse_dnsaddr("dnsaddr=not-a-multiaddr"),
            Err(DnsDiscoveryError::MalformedAddr(_))
        ));
    }

    #[test]
    fn test_normalize_adds_query_label() {
        assert_eq!(normalize_domain("example.com"), "_dnsaddr.example.com");
        assert_eq!(normalize_domain("example.com."), "_dnsaddr.example.com");
        assert_eq!(
            normalize_domain("_dnsaddr.example.com"),
            "_dnsaddr.example.com"
        );
    }

    #[test]
    fn test_validate_domain_accepts_common_shapes() {
        assert!(validate_domain("example.com"));
        assert!(validate_domain("boot-1.strand.example"));
        assert!(validate_domain("x.y"));
        assert!(validate_domain("snake_label.example"));
    }

    #[test]
    fn test_validate_domain_rejects_bad_shapes() {
        assert!(!validate_domain(""));
        assert!(!validate_domain("double..dot"));
        assert!(!validate_domain("-leading.example"));
        assert!(!validate_domain("trailing-.example"));
        assert!(!validate_domain("has space.example"));
        assert!(!validate_domain(&"a".repeat(254)));
        assert!(!validate_domain(&format!("{}.example", "a".repeat(64))));
    }
}
