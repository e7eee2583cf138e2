//! Client identity used to partition bucket state.

use http::{Extensions, HeaderMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Key used when the caller's address cannot be determined.
pub const FALLBACK_KEY: &str = "unknown";

/// Non-empty identity string for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(String);

impl ClientKey {
    /// Build a key, substituting [`FALLBACK_KEY`] for blank input.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::fallback()
        } else if trimmed.len() == raw.len() {
            Self(raw)
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn fallback() -> Self {
        Self(FALLBACK_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

/// Derives a [`ClientKey`] from request metadata.
///
/// Implementations must be deterministic and must always produce a key; an unresolvable
/// caller gets a fallback key rather than an error.
pub trait ClientKeyResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> ClientKey;
}

/// Resolves the caller from the connection's peer address.
///
/// The server inserts the peer `SocketAddr` into request extensions. When the peer is a
/// configured trusted proxy, the caller is the rightmost `X-Forwarded-For` hop that is not
/// itself a trusted proxy (falling back to `X-Real-IP`).
/// Forwarded headers from untrusted peers are ignored.
#[derive(Debug, Clone, Default)]
pub struct PeerAddrResolver {
    trusted_proxies: Vec<IpAddr>,
}

impl PeerAddrResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Honor forwarded headers from these peers.
    pub fn with_trusted_proxies(mut self, proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_proxies = proxies.into_iter().collect();
        self
    }

    fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.contains(ip)
    }

    /// Nearest `X-Forwarded-For` hop that is not one of our proxies.
    ///
    /// Proxies append the address they received from, so only the hops to the right of
    /// the first untrusted one are reliable. Anything further left is client-supplied.
    fn forwarded_ip(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let hops: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect();
        // An unparsable hop ends the walk; nothing left of it can be trusted.
        let nearest = hops
            .iter()
            .rev()
            .map(|hop| hop.parse::<IpAddr>().ok())
            .find(|hop| !matches!(hop, Some(ip) if self.is_trusted(ip)))
            .flatten();
        nearest.or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
    }
}

impl ClientKeyResolver for PeerAddrResolver {
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> ClientKey {
        let Some(peer) = extensions.get::<SocketAddr>().map(SocketAddr::ip) else {
            tracing::debug!("no peer address on request; using fallback client key");
            return ClientKey::fallback();
        };

        if self.is_trusted(&peer) {
            if let Some(ip) = self.forwarded_ip(headers) {
                return ClientKey::from(ip);
            }
        }
        ClientKey::from(peer)
    }
}

impl<F> ClientKeyResolver for F
where
    F: Fn(&HeaderMap, &Extensions) -> ClientKey + Send + Sync,
{
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> ClientKey {
        self(headers, extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn peer(addr: &str) -> Extensions {
        let mut ext = Extensions::new();
        ext.insert(addr.parse::<SocketAddr>().unwrap());
        ext
    }

    #[test]
    fn blank_keys_fall_back() {
        assert_eq!(ClientKey::new("   ").as_str(), FALLBACK_KEY);
        assert_eq!(ClientKey::new(" 10.0.0.1 ").as_str(), "10.0.0.1");
    }

    #[test]
    fn missing_peer_uses_fallback() {
        let key = PeerAddrResolver::new().resolve(&HeaderMap::new(), &Extensions::new());
        assert_eq!(key, ClientKey::fallback());
    }

    #[test]
    fn peer_ip_ignores_port() {
        let r = PeerAddrResolver::new();
        let a = r.resolve(&HeaderMap::new(), &peer("192.0.2.7:5000"));
        let b = r.resolve(&HeaderMap::new(), &peer("192.0.2.7:6000"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "192.0.2.7");
    }

    #[test]
    fn forwarded_header_requires_trusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 198.51.100.9"));

        let untrusted = PeerAddrResolver::new();
        assert_eq!(untrusted.resolve(&headers, &peer("10.0.0.2:80")).as_str(), "10.0.0.2");

        let trusted =
            PeerAddrResolver::new().with_trusted_proxies(["10.0.0.2".parse().unwrap()]);
        assert_eq!(trusted.resolve(&headers, &peer("10.0.0.2:80")).as_str(), "198.51.100.9");
    }

    #[test]
    fn client_supplied_hops_cannot_pick_the_key() {
        let trusted =
            PeerAddrResolver::new().with_trusted_proxies(["10.0.0.1".parse().unwrap()]);
        let keys: std::collections::HashSet<ClientKey> = (0..50)
            .map(|i| {
                let mut headers = HeaderMap::new();
                let forwarded = format!("203.0.113.{}, 198.51.100.9", i);
                headers.insert("x-forwarded-for", HeaderValue::from_str(&forwarded).unwrap());
                trusted.resolve(&headers, &peer("10.0.0.1:443"))
            })
            .collect();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&ClientKey::new("198.51.100.9")));
    }

    #[test]
    fn chained_trusted_proxies_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.0.2.200, 198.51.100.9, 10.0.0.3"),
        );
        let trusted = PeerAddrResolver::new().with_trusted_proxies([
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ]);
        assert_eq!(trusted.resolve(&headers, &peer("10.0.0.2:80")).as_str(), "198.51.100.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.3"));
        assert_eq!(trusted.resolve(&headers, &peer("10.0.0.2:80")).as_str(), "10.0.0.2");
    }

    #[test]
    fn garbage_forwarded_header_keeps_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        let trusted =
            PeerAddrResolver::new().with_trusted_proxies(["10.0.0.2".parse().unwrap()]);
        assert_eq!(trusted.resolve(&headers, &peer("10.0.0.2:80")).as_str(), "198.51.100.4");

        headers.remove("x-real-ip");
        assert_eq!(trusted.resolve(&headers, &peer("10.0.0.2:80")).as_str(), "10.0.0.2");
    }
}
