//! Guard for references that point at a raw network address.
//!
//! A URL is accepted only if its scheme is http(s) and every address its host
//! resolves to is publicly routable. Loopback, private, link-local, CGNAT,
//! multicast, documentation and cloud metadata targets are all rejected.
//!
//! The guard is also the DNS resolver of the HTTP client that fetches
//! accepted URLs, so the address actually connected to passes the same
//! check as the one vetted up front.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::warn;
use url::{Host, Url};

use crate::error::CatalogError;

const METADATA_HOSTS: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.com",
    "instance-data",
    "instance-data.ec2.internal",
];

/// Name resolution behind the guard.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// The operating system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

#[derive(Clone)]
pub struct AddressGuard {
    blocked_hosts: HashSet<String>,
    lookup: Arc<dyn HostLookup>,
}

impl Default for AddressGuard {
    fn default() -> Self {
        Self {
            blocked_hosts: HashSet::new(),
            lookup: Arc::new(SystemLookup),
        }
    }
}

impl std::fmt::Debug for AddressGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressGuard")
            .field("blocked_hosts", &self.blocked_hosts)
            .finish_non_exhaustive()
    }
}

impl AddressGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocked_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_hosts
            .extend(hosts.into_iter().map(|h| h.into().to_ascii_lowercase()));
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn HostLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Parses `href` and checks its literal host without resolving names.
    pub fn check_static(&self, href: &str) -> Result<Url, CatalogError> {
        let url = Url::parse(href)
            .map_err(|e| CatalogError::AddressBlocked(format!("{href}: invalid URL ({e})")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(blocked(href, "scheme must be http or https"));
        }
        match url.host() {
            None => return Err(blocked(href, "missing host")),
            Some(Host::Ipv4(ip)) if is_blocked_ip(IpAddr::V4(ip)) => {
                return Err(blocked(href, "address is in a reserved range"));
            }
            Some(Host::Ipv6(ip)) if is_blocked_ip(IpAddr::V6(ip)) => {
                return Err(blocked(href, "address is in a reserved range"));
            }
            Some(Host::Domain(name)) if !self.name_allowed(name) => {
                return Err(blocked(href, "host is not allowed"));
            }
            Some(_) => {}
        }
        Ok(url)
    }

    fn name_allowed(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        !(name == "localhost"
            || name.ends_with(".localhost")
            || METADATA_HOSTS.contains(&name.as_str())
            || self.blocked_hosts.contains(&name))
    }

    /// Full check: static rules plus DNS resolution of domain names, so a
    /// public-looking name that points inside the network is still rejected.
    pub async fn check(&self, href: &str) -> Result<Url, CatalogError> {
        let url = self.check_static(href)?;
        if let Some(Host::Domain(name)) = url.host() {
            let port = url.port_or_known_default().unwrap_or(443);
            self.resolve_public(name, port)
                .await
                .map_err(|e| blocked(href, &e))?;
        }
        Ok(url)
    }

    /// Resolves `host` and fails unless every address is public.
    async fn resolve_public(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, String> {
        if !self.name_allowed(host) {
            return Err("host is not allowed".into());
        }
        let ips = self
            .lookup
            .lookup(host, port)
            .await
            .map_err(|e| format!("cannot resolve host ({e})"))?;
        if ips.is_empty() {
            return Err("host resolves to no address".into());
        }
        if let Some(ip) = ips.iter().find(|ip| is_blocked_ip(**ip)) {
            warn!(%host, %ip, "host resolves to reserved address");
            return Err("host resolves to a reserved address".into());
        }
        Ok(ips)
    }
}

/// Every connection the guarded HTTP client makes goes through here.
impl Resolve for AddressGuard {
    fn resolve(&self, name: Name) -> Resolving {
        let guard = self.clone();
        Box::pin(async move {
            let host = name.as_str();
            let ips = guard
                .resolve_public(host, 0)
                .await
                .map_err(|e| CatalogError::AddressBlocked(format!("{host}: {e}")))?;
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

fn blocked(href: &str, reason: &str) -> CatalogError {
    CatalogError::AddressBlocked(format!("{href}: {reason}"))
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
        // 64:ff9b::/96 NAT64 can embed a private v4 target
        || (first == 0x0064 && ip.segments()[1] == 0xff9b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ipv4_ranges_are_blocked() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "100.64.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "224.0.0.1",
            "198.18.0.1",
        ] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        for ip in ["8.8.8.8", "93.184.216.34", "172.32.0.1", "100.128.0.1"] {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn reserved_ipv6_ranges_are_blocked() {
        for ip in ["::1", "::", "fe80::1", "fd00:ec2::254", "::ffff:10.0.0.1", "ff02::1"] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        assert!(!is_blocked_ip("2606:4700:4700::1111".parse().unwrap()));
    }

    #[test]
    fn static_check_rejects_bad_urls() {
        let guard = AddressGuard::new().with_blocked_hosts(["internal.example.org"]);
        for href in [
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]:8080/",
            "http://localhost/features",
            "http://metadata.google.internal/computeMetadata/v1/",
            "https://internal.example.org/data.geojson",
            "file:///etc/passwd",
            "ftp://8.8.8.8/data",
            "not a url",
        ] {
            assert!(
                matches!(guard.check_static(href), Err(CatalogError::AddressBlocked(_))),
                "{href} should be blocked"
            );
        }
        assert!(guard.check_static("https://8.8.8.8/data.geojson").is_ok());
        assert!(guard.check_static("https://data.example.org/a.geojson").is_ok());
    }

    /// Resolves every name to one fixed address.
    struct Fixed(&'static str);

    #[async_trait]
    impl HostLookup for Fixed {
        async fn lookup(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            Ok(vec![self.0.parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn public_name_resolving_inside_is_blocked() {
        let href = "https://innocent.example.org/a.geojson";
        let guard = AddressGuard::new().with_lookup(Arc::new(Fixed("169.254.169.254")));
        assert!(matches!(guard.check(href).await, Err(CatalogError::AddressBlocked(_))));

        let guard = AddressGuard::new().with_lookup(Arc::new(Fixed("93.184.216.34")));
        assert!(guard.check(href).await.is_ok());
    }

    #[tokio::test]
    async fn literal_public_ip_passes_full_check() {
        let guard = AddressGuard::new();
        assert!(guard.check("https://8.8.8.8/a.geojson").await.is_ok());
        assert!(guard.check("http://127.0.0.1:9000/a.geojson").await.is_err());
    }
}
