//! spindle-common: shared types for the spindle routing daemon.
//!
//! Provides the versioned key-value [`Value`] record with its total merge
//! order, neighbor/interface/peer descriptors exchanged between components,
//! and the protocol constants every crate agrees on.

pub mod types;
pub mod value;

pub use types::{
    CidrNetwork, InterfaceDatabase, InterfaceEntry, NeighborEvent, NeighborEventKind,
    NeighborInfo, PeerSpec,
};
pub use value::{compare_values, merge_key_values, MergeStats, Value, TTL_INFINITY};

/// The default area every node participates in.
pub const DEFAULT_AREA: &str = "0";

/// Protocol version advertised in hello messages.
pub const VERSION: u32 = 20190805;

/// Oldest protocol version we will talk to.
pub const LOWEST_SUPPORTED_VERSION: u32 = 20190805;

/// Link-local multicast group used for neighbor discovery.
pub const SPARK_MCAST_ADDR: &str = "ff02::1";

/// Hop limit for discovery packets. Receivers reject anything lower,
/// which guarantees the sender is on-link.
pub const SPARK_HOP_LIMIT: u8 = 255;

/// Discovery packets are clamped to the IPv6 minimum MTU so we never
/// depend on path-MTU discovery.
pub const MIN_IPV6_MTU: usize = 1280;
