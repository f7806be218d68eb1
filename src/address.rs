//! Node addresses advertised to the rest of the cluster
//!
//! A node publishes one `host:port` authority in the locator directory.
//! Hosts compare case-insensitively; IPv6 hosts are bracketed when rendered.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;

/// Network address of a resumer node
#[derive(Debug, Clone)]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    /// Build an address from parts. Returns `None` for an empty host or port 0.
    pub fn new(host: &str, port: u16) -> Option<Self> {
        let host = normalize_host(host);
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self { host, port })
    }

    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let sep = find_port_separator(trimmed)?;
        if sep == 0 || sep + 1 >= trimmed.len() {
            return None;
        }
        let port = trimmed[sep + 1..].trim().parse::<u16>().ok()?;
        Self::new(&trimmed[..sep], port)
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Pick the address this node advertises.
///
/// An explicit configured address wins; otherwise a concrete bound address is
/// used as-is, and a wildcard bind (`0.0.0.0`, `::`) falls back to the machine
/// hostname with the bound port.
pub fn resolve_advertised(configured: Option<&str>, bound: SocketAddr) -> NodeAddress {
    if let Some(addr) = configured.and_then(NodeAddress::parse) {
        return addr;
    }
    if !bound.ip().is_unspecified() {
        return NodeAddress::from_socket_addr(bound);
    }
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    NodeAddress::new(&host, bound.port()).unwrap_or_else(|| NodeAddress::from_socket_addr(bound))
}

fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    if trimmed.len() > 2 && trimmed.starts_with('[') && trimmed.ends_with(']') {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    trimmed.to_string()
}

fn find_port_separator(value: &str) -> Option<usize> {
    if value.starts_with('[') {
        let close = value.find(']')?;
        return (value[close + 1..].starts_with(':')).then_some(close + 1);
    }
    value.rfind(':')
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for NodeAddress {}

impl std::hash::Hash for NodeAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.authority())
    }
}

impl std::str::FromStr for NodeAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid node address: {s}"))
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.authority())
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid node address: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port() {
        let addr = NodeAddress::parse("node-a:7420").unwrap();
        assert_eq!(addr.host(), "node-a");
        assert_eq!(addr.port(), 7420);
        assert_eq!(addr.authority(), "node-a:7420");
    }

    #[test]
    fn parse_ipv6() {
        let addr = NodeAddress::parse("[::1]:9000").unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.authority(), "[::1]:9000");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(NodeAddress::parse("").is_none());
        assert!(NodeAddress::parse("node-a").is_none());
        assert!(NodeAddress::parse(":7420").is_none());
        assert!(NodeAddress::parse("node-a:").is_none());
        assert!(NodeAddress::parse("node-a:0").is_none());
        assert!(NodeAddress::parse("node-a:notaport").is_none());
    }

    #[test]
    fn host_comparison_ignores_case() {
        let a = NodeAddress::parse("Node-A:7420").unwrap();
        let b = NodeAddress::parse("node-a:7420").unwrap();
        let c = NodeAddress::parse("node-a:7421").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serde_as_authority_string() {
        let addr = NodeAddress::parse("10.0.0.5:7420").unwrap();
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"10.0.0.5:7420\"");
        let back: NodeAddress = serde_json::from_str("\"10.0.0.5:7420\"").unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<NodeAddress>("\"nope\"").is_err());
    }

    #[test]
    fn advertised_prefers_configured() {
        let bound: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let addr = resolve_advertised(Some("public.example:443"), bound);
        assert_eq!(addr.authority(), "public.example:443");
    }

    #[test]
    fn advertised_uses_concrete_bind() {
        let bound: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(resolve_advertised(None, bound).authority(), "127.0.0.1:5000");
        // Unparseable configured value falls through.
        assert_eq!(
            resolve_advertised(Some("bogus"), bound).authority(),
            "127.0.0.1:5000"
        );
    }

    #[test]
    fn advertised_wildcard_keeps_port() {
        let bound: SocketAddr = "0.0.0.0:5000".parse().unwrap();
        let addr = resolve_advertised(None, bound);
        assert_eq!(addr.port(), 5000);
        assert_ne!(addr.host(), "0.0.0.0");
    }
}
