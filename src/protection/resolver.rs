//! Client identity resolution behind trusted reverse proxies.

use http::header::HeaderName;
use http::HeaderMap;
use tracing::debug;

use crate::config::settings::TrustedProxiesConfig;
use crate::error::{ConfigError, ConfigResult, ResolveError};
use crate::models::request::ClientIdentity;
use crate::storage::blocklist::IpList;

/// Peers allowed to speak for the client, and the headers they speak in.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    headers: Vec<HeaderName>,
    peers: IpList,
}

impl TrustedProxies {
    pub fn new<I, S, H, T>(peers: I, headers: H) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        H: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let headers = headers
            .into_iter()
            .map(|name| {
                let name = name.as_ref().trim();
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ConfigError::InvalidHeader(name.to_string()))
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            headers,
            peers: IpList::new(peers)?,
        })
    }

    pub fn from_config(config: &TrustedProxiesConfig) -> ConfigResult<Self> {
        Self::new(&config.ips, &config.headers)
    }

    /// Work out who is behind `conn_addr` (`host:port`).
    ///
    /// Headers are only believed when the connecting peer is trusted. The
    /// first configured header carrying a non-empty value wins; for list
    /// headers such as `X-Forwarded-For` the left-most entry is used.
    pub fn resolve(
        &self,
        conn_addr: &str,
        headers: &HeaderMap,
    ) -> Result<ClientIdentity, ResolveError> {
        let peer = split_host(conn_addr)?;

        if self.headers.is_empty() || !self.peers.contains(peer) {
            return Ok(ClientIdentity::direct(peer));
        }

        for name in &self.headers {
            let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            let client = value.split(',').next().unwrap_or_default().trim();
            if client.is_empty() {
                continue;
            }
            debug!(client_ip = %client, proxy = %peer, header = %name, "Client resolved from trusted header");
            return Ok(ClientIdentity::proxied(client, peer));
        }

        Ok(ClientIdentity::direct(peer))
    }
}

/// Host part of `host:port`. IPv6 hosts must be bracketed.
fn split_host(addr: &str) -> Result<&str, ResolveError> {
    let malformed = || ResolveError::MalformedAddress(addr.to_string());

    let host = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(malformed)?;
        if !tail.starts_with(':') {
            return Err(malformed());
        }
        host
    } else {
        let (host, _port) = addr.rsplit_once(':').ok_or_else(malformed)?;
        if host.contains(':') {
            return Err(malformed());
        }
        host
    };

    if host.is_empty() {
        return Err(malformed());
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn real_ip_proxy() -> TrustedProxies {
        TrustedProxies::new(["203.0.113.5"], ["X-Real-IP"]).unwrap()
    }

    #[test]
    fn test_trusted_peer_header_is_used() {
        let id = real_ip_proxy()
            .resolve("203.0.113.5:41000", &headers(&[("x-real-ip", "192.0.2.9")]))
            .unwrap();
        assert_eq!(id, ClientIdentity::proxied("192.0.2.9", "203.0.113.5"));
    }

    #[test]
    fn test_untrusted_peer_header_is_ignored() {
        let id = real_ip_proxy()
            .resolve("192.0.2.50:41000", &headers(&[("x-real-ip", "192.0.2.9")]))
            .unwrap();
        assert_eq!(id, ClientIdentity::direct("192.0.2.50"));
    }

    #[test]
    fn test_header_order_and_empty_values() {
        let proxies =
            TrustedProxies::new(["10.0.0.0/8"], ["X-Real-IP", "X-Forwarded-For"]).unwrap();

        let id = proxies
            .resolve(
                "10.1.2.3:80",
                &headers(&[("x-real-ip", ""), ("x-forwarded-for", " 198.51.100.4 , 10.1.2.3")]),
            )
            .unwrap();
        assert_eq!(id, ClientIdentity::proxied("198.51.100.4", "10.1.2.3"));

        let id = proxies
            .resolve(
                "10.1.2.3:80",
                &headers(&[("x-real-ip", "192.0.2.1"), ("x-forwarded-for", "198.51.100.4")]),
            )
            .unwrap();
        assert_eq!(id.remote_ip, "192.0.2.1");
    }

    #[test]
    fn test_trusted_peer_without_header() {
        let id = real_ip_proxy().resolve("203.0.113.5:41000", &HeaderMap::new()).unwrap();
        assert_eq!(id, ClientIdentity::direct("203.0.113.5"));
    }

    #[test]
    fn test_ipv6_connection_address() {
        let proxies = TrustedProxies::new(["::1"], ["X-Real-IP"]).unwrap();
        let id = proxies
            .resolve("[::1]:8000", &headers(&[("x-real-ip", "2001:db8::7")]))
            .unwrap();
        assert_eq!(id, ClientIdentity::proxied("2001:db8::7", "::1"));

        let id = TrustedProxies::default().resolve("[2001:db8::1]:443", &HeaderMap::new()).unwrap();
        assert_eq!(id.remote_ip, "2001:db8::1");
    }

    #[test]
    fn test_malformed_connection_address() {
        let proxies = TrustedProxies::default();
        for bad in ["192.0.2.1", ":8080", "::1:80", "[::1]", "[::1", "[]:80", ""] {
            assert_eq!(
                proxies.resolve(bad, &HeaderMap::new()),
                Err(ResolveError::MalformedAddress(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_header_name() {
        let err = TrustedProxies::new(Vec::<String>::new(), ["Bad Header"]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidHeader("Bad Header".to_string()));
    }

    #[test]
    fn test_from_config() {
        let config = TrustedProxiesConfig {
            ips: vec!["203.0.113.0/24".to_string()],
            headers: vec!["X-Forwarded-For".to_string()],
        };
        let proxies = TrustedProxies::from_config(&config).unwrap();
        let id = proxies
            .resolve("203.0.113.77:1", &headers(&[("x-forwarded-for", "192.0.2.200")]))
            .unwrap();
        assert_eq!(id.via_trusted_proxy.as_deref(), Some("203.0.113.77"));
    }
}
