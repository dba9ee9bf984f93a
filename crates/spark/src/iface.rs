//! Tracked interfaces and snapshot diffing.
//!
//! The netlink collaborator pushes a full [`InterfaceDatabase`] on every
//! change; discovery keeps only interfaces that are up, hold an IPv6
//! link-local address, and (when v4 is enabled) an IPv4 address, then diffs
//! against the current set to drive join/leave and timer churn.

use spindle_common::{CidrNetwork, InterfaceDatabase};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A tracked interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub if_index: u32,
    pub v6_link_local: (Ipv6Addr, u8),
    /// Present iff v4 is enabled.
    pub v4_network: Option<(Ipv4Addr, u8)>,
}

impl Interface {
    pub fn v4_cidr(&self) -> Option<CidrNetwork> {
        self.v4_network
            .map(|(addr, len)| CidrNetwork::new(IpAddr::V4(addr), len))
    }
}

/// Reduce a platform snapshot to the interfaces discovery should track.
///
/// Addresses are sorted and the lowest picked, so two nodes on a shared
/// link settle on the same pair of addresses.
pub fn validated_interfaces(
    db: &InterfaceDatabase,
    enable_v4: bool,
) -> BTreeMap<String, Interface> {
    let mut out = BTreeMap::new();

    for (if_name, entry) in &db.interfaces {
        if !entry.is_up {
            continue;
        }

        let mut v6_link_locals: Vec<(Ipv6Addr, u8)> = Vec::new();
        let mut v4s: Vec<(Ipv4Addr, u8)> = Vec::new();
        for network in &entry.networks {
            match network.addr {
                IpAddr::V6(v6) if network.is_v6_link_local() => {
                    v6_link_locals.push((v6, network.prefix_len));
                }
                IpAddr::V4(v4) => v4s.push((v4, network.prefix_len)),
                IpAddr::V6(_) => {}
            }
        }
        v6_link_locals.sort_unstable();
        v4s.sort_unstable();

        let Some(&v6_link_local) = v6_link_locals.first() else {
            tracing::debug!("skipping interface ({}) without v6 link-local", if_name);
            continue;
        };
        let v4_network = if enable_v4 {
            match v4s.first() {
                Some(&v4) => Some(v4),
                None => {
                    tracing::debug!("v4 enabled but interface ({}) has no v4 address", if_name);
                    continue;
                }
            }
        } else {
            None
        };

        out.insert(
            if_name.clone(),
            Interface {
                if_index: entry.if_index,
                v6_link_local,
                v4_network,
            },
        );
    }

    out
}

/// Interfaces to add, delete, and update between two validated maps.
pub fn diff_interfaces(
    current: &BTreeMap<String, Interface>,
    new: &BTreeMap<String, Interface>,
) -> (BTreeSet<String>, BTreeSet<String>, BTreeSet<String>) {
    let current_names: BTreeSet<&String> = current.keys().collect();
    let new_names: BTreeSet<&String> = new.keys().collect();

    let to_add = new_names
        .difference(&current_names)
        .map(|s| (*s).clone())
        .collect();
    let to_del = current_names
        .difference(&new_names)
        .map(|s| (*s).clone())
        .collect();
    let to_update = current_names
        .intersection(&new_names)
        .map(|s| (*s).clone())
        .collect();
    (to_add, to_del, to_update)
}
