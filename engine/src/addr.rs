//! Address type filters used when dialing peers and when archiving results.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Which kind of addresses should be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrType {
    /// Only private, loopback and otherwise non-routable addresses.
    Private,
    /// Only publicly routable addresses.
    Public,
    /// All addresses.
    #[default]
    Any,
}

impl AddrType {
    /// Returns the subset of `addrs` matching this address type, in order.
    pub fn filter(&self, addrs: &[SocketAddr]) -> Vec<SocketAddr> {
        addrs
            .iter()
            .filter(|addr| self.matches(addr))
            .copied()
            .collect()
    }

    /// Checks if a single address matches this address type.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddrType::Private => !is_public(&addr.ip()),
            AddrType::Public => is_public(&addr.ip()),
            AddrType::Any => true,
        }
    }
}

impl fmt::Display for AddrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrType::Private => write!(f, "private"),
            AddrType::Public => write!(f, "public"),
            AddrType::Any => write!(f, "any"),
        }
    }
}

/// Error returned when parsing an unknown address type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddrTypeError(String);

impl fmt::Display for ParseAddrTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unknown address type '{}', expected private, public or any",
            self.0
        )
    }
}

impl std::error::Error for ParseAddrTypeError {}

impl FromStr for AddrType {
    type Err = ParseAddrTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(AddrType::Private),
            "public" => Ok(AddrType::Public),
            "any" => Ok(AddrType::Any),
            _ => Err(ParseAddrTypeError(s.to_string())),
        }
    }
}

/// Checks if an IP address is publicly routable.
pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_public_v4(ipv4),
        IpAddr::V6(ipv6) => match ipv6.to_ipv4_mapped() {
            Some(ipv4) => is_public_v4(&ipv4),
            None => is_public_v6(ipv6),
        },
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 100.64.0.0/10, carrier-grade NAT.
    let shared = octets[0] == 100 && (octets[1] & 0b1100_0000) == 64;

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || shared)
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    // fc00::/7
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    // fe80::/10
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    // 2001:db8::/32
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8;

    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local || documentation)
}
