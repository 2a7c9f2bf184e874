//! IP address classification helpers and the netrestrict whitelist.

use crate::error::RelayIpError;
use ipnet::IpNet;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// A whitelist of CIDR networks. When configured, nodes with addresses
/// outside every listed network are rejected.
#[derive(Debug, Clone, Default)]
pub struct Netlist {
    networks: Vec<IpNet>,
}

impl Netlist {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Netlist { networks }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl FromStr for Netlist {
    type Err = ipnet::AddrParseError;

    /// Parses a comma-separated list of CIDR masks, e.g.
    /// `"10.0.0.0/8,172.16.0.0/12"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut networks = Vec::new();
        for mask in s.split(',') {
            let mask = mask.trim();
            if mask.is_empty() {
                continue;
            }
            networks.push(mask.parse()?);
        }
        Ok(Netlist { networks })
    }
}

fn is_special_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || octets[0] == 0
        // 192.0.0.0/24 protocol assignments and 192.88.99.0/24 6to4 relays.
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        || (octets[0] == 192 && octets[1] == 88 && octets[2] == 99)
        // 198.18.0.0/15 benchmarking.
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // 240.0.0.0/4 reserved.
        || octets[0] >= 240
}

fn is_special_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_multicast()
        // 2001:db8::/32 documentation.
        || (segments[0] == 0x2001 && segments[1] == 0xdb8)
        // ::/8, which also covers the unspecified and loopback block.
        || (segments[0] & 0xff00) == 0
}

fn is_lan_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    // fc00::/7 unique local and fe80::/10 link local.
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

/// Whether `ip` belongs to a LAN scope (including loopback).
pub fn is_lan(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || is_lan_v6(v6),
    }
}

/// Whether `ip` is in a special-purpose range that never identifies a
/// reachable host.
pub fn is_special(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_special_v4(v4),
        IpAddr::V6(v6) => is_special_v6(v6),
    }
}

/// Checks that `addr` is a routable node address from the perspective of
/// `sender`, the peer that reported it. Internet hosts must not relay LAN or
/// loopback addresses, which would let them bridge network scopes.
pub fn check_relay_ip(sender: IpAddr, addr: IpAddr) -> Result<(), RelayIpError> {
    if addr.is_unspecified() {
        return Err(RelayIpError::Unspecified);
    }
    if is_special(&addr) {
        return Err(RelayIpError::Special);
    }
    if addr.is_loopback() && !sender.is_loopback() {
        return Err(RelayIpError::LoopbackRelayed);
    }
    if is_lan(&addr) && !addr.is_loopback() && !is_lan(&sender) {
        return Err(RelayIpError::LanRelayed);
    }
    Ok(())
}
