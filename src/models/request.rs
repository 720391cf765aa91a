use std::fmt;

/// Resolved identity of the client behind a request.
///
/// Built once per request by the proxy resolver and threaded explicitly
/// through every chain stage. Never shared between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Address used as the ban-tracking key.
    pub remote_ip: String,

    /// The immediate peer, when `remote_ip` was taken from a trusted header.
    pub via_trusted_proxy: Option<String>,
}

impl ClientIdentity {
    /// Identity of a client that connected directly.
    pub fn direct(remote_ip: impl Into<String>) -> Self {
        Self {
            remote_ip: remote_ip.into(),
            via_trusted_proxy: None,
        }
    }

    /// Identity taken from a header set by the trusted proxy `proxy`.
    pub fn proxied(remote_ip: impl Into<String>, proxy: impl Into<String>) -> Self {
        Self {
            remote_ip: remote_ip.into(),
            via_trusted_proxy: Some(proxy.into()),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.via_trusted_proxy {
            Some(proxy) => write!(f, "{} (via {})", self.remote_ip, proxy),
            None => write!(f, "{}", self.remote_ip),
        }
    }
}

/// The parts of an inbound request the chain stages look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    /// Full request URL as received (path and query).
    pub url: &'a str,
}

impl<'a> RequestView<'a> {
    pub fn new(url: &'a str) -> Self {
        Self { url }
    }
}
