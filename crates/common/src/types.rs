//! Descriptors exchanged between components: interfaces from the netlink
//! collaborator, neighbors and their lifecycle events out of discovery, and
//! peers into the key-value store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An address with a prefix length, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrNetwork {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl CidrNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// Whether `other` falls inside this (v4) subnet. Used for the optional
    /// v4 subnet validation of hello packets.
    pub fn contains_v4(&self, other: Ipv4Addr) -> bool {
        let IpAddr::V4(addr) = self.addr else {
            return false;
        };
        if self.prefix_len > 32 {
            return false;
        }
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        };
        (u32::from(addr) & mask) == (u32::from(other) & mask)
    }

    pub fn is_v6_link_local(&self) -> bool {
        match self.addr {
            // fe80::/10
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            IpAddr::V4(_) => false,
        }
    }
}

/// One interface in a platform snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceEntry {
    pub is_up: bool,
    pub if_index: u32,
    pub networks: Vec<CidrNetwork>,
}

/// Full interface snapshot pushed by the netlink collaborator on every
/// change. The discovery component diffs consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDatabase {
    pub this_node_name: String,
    pub interfaces: HashMap<String, InterfaceEntry>,
}

/// What discovery knows about a neighbor, as carried on neighbor events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub domain_name: String,
    pub node_name: String,
    /// The neighbor's name for the shared link, from its point of view.
    pub remote_if_name: String,
    pub link_local_v6: Option<Ipv6Addr>,
    pub v4_addr: Option<Ipv4Addr>,
    /// Command port of the neighbor's key-value store, learned in handshake.
    pub kv_cmd_port: u16,
    /// Publication port of the neighbor's key-value store.
    pub kv_pub_port: u16,
    /// Hold time the neighbor asked us to honor, milliseconds.
    pub hold_time_ms: u64,
}

/// Lifecycle notifications emitted to the peer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborEventKind {
    Up,
    Down,
    Restarting,
    Restarted,
    RttChange,
}

impl NeighborEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeighborEventKind::Up => "NEIGHBOR_UP",
            NeighborEventKind::Down => "NEIGHBOR_DOWN",
            NeighborEventKind::Restarting => "NEIGHBOR_RESTARTING",
            NeighborEventKind::Restarted => "NEIGHBOR_RESTARTED",
            NeighborEventKind::RttChange => "NEIGHBOR_RTT_CHANGE",
        }
    }
}

/// One neighbor lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEvent {
    pub kind: NeighborEventKind,
    pub if_name: String,
    pub neighbor: NeighborInfo,
    pub rtt_us: i64,
    /// MPLS label assigned locally to this adjacency.
    pub label: u32,
    pub supports_flood_optimization: bool,
    /// The single area this adjacency belongs to, when area sets were
    /// exchanged.
    pub area: Option<String>,
}

/// A flooding peer of the key-value store. Added and removed by the peer
/// manager in reaction to neighbor events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Address of the peer's command endpoint, `host:port`.
    pub cmd_url: String,
    /// Address of the peer's publication endpoint, `host:port`.
    pub pub_url: String,
    pub supports_flood_optimization: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_subnet_membership() {
        let net = CidrNetwork::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 24);
        assert!(net.contains_v4(Ipv4Addr::new(192, 168, 1, 99)));
        assert!(!net.contains_v4(Ipv4Addr::new(192, 168, 2, 99)));

        let all = CidrNetwork::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0);
        assert!(all.contains_v4(Ipv4Addr::new(172, 16, 0, 1)));
    }

    #[test]
    fn test_v6_subnet_never_contains_v4() {
        let net = CidrNetwork::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 64);
        assert!(!net.contains_v4(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_link_local_detection() {
        let ll = CidrNetwork::new("fe80::1".parse().unwrap(), 64);
        assert!(ll.is_v6_link_local());

        let global = CidrNetwork::new("2001:db8::1".parse().unwrap(), 64);
        assert!(!global.is_v6_link_local());

        let v4 = CidrNetwork::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 24);
        assert!(!v4.is_v6_link_local());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(NeighborEventKind::Up.as_str(), "NEIGHBOR_UP");
        assert_eq!(NeighborEventKind::RttChange.as_str(), "NEIGHBOR_RTT_CHANGE");
    }
}
