//! Discovery errors.

#[derive(Debug, Clone, thiserror::Error)]
pub enum DnsDiscoveryError {
    #[error("record does not start with dnsaddr=")]
    MissingPrefix,

    /// A stray `dnsaddr=/dnsaddr/` would otherwise trigger a useless query.
    #[error("empty nested dnsaddr domain")]
    EmptyNestedDomain,

    #[error("malformed multiaddr in record: {0}")]
    MalformedAddr(String),

    #[error("record address carries no /p2p/ peer id")]
    MissingPeerId,

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("max recursion depth must be at most {0}")]
    MaxDepthOutOfRange(usize),

    #[error("invalid resolver address: {0}")]
    InvalidResolver(String),

    #[error("no dnsaddr records found for {0}")]
    NoRecordsFound(String),

    #[error("maximum dnsaddr recursion depth exceeded")]
    MaxDepthExceeded,

    #[error("dns lookup failed: {0}")]
    Lookup(String),

    #[error("dns lookup timed out")]
    Timeout,
}
