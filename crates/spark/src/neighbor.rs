//! Per-neighbor state machine and tracking state.

use spindle_common::NeighborInfo;
use spindle_runtime::{StepDetector, TimerId};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::time::Duration;

/// Samples in the fast RTT window.
pub const RTT_FAST_WINDOW: usize = 10;
/// Samples in the slow RTT window.
pub const RTT_SLOW_WINDOW: usize = 60;
/// Relative RTT step threshold, percent.
pub const RTT_STEP_PCT: u32 = 5;
/// Absolute RTT step threshold, microseconds.
pub const RTT_STEP_ABS_US: i64 = 500;

/// States of the neighbor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighState {
    Idle,
    Warm,
    Negotiate,
    Established,
    Restart,
}

impl NeighState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeighState::Idle => "IDLE",
            NeighState::Warm => "WARM",
            NeighState::Negotiate => "NEGOTIATE",
            NeighState::Established => "ESTABLISHED",
            NeighState::Restart => "RESTART",
        }
    }
}

/// Events driving the neighbor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighEvent {
    HelloRcvdInfo,
    HelloRcvdNoInfo,
    HelloRcvdRestart,
    HandshakeRcvd,
    HeartbeatRcvd,
    HeartbeatTimerExpire,
    NegotiateTimerExpire,
    GrTimerExpire,
}

impl NeighEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeighEvent::HelloRcvdInfo => "HELLO_RCVD_INFO",
            NeighEvent::HelloRcvdNoInfo => "HELLO_RCVD_NO_INFO",
            NeighEvent::HelloRcvdRestart => "HELLO_RCVD_RESTART",
            NeighEvent::HandshakeRcvd => "HANDSHAKE_RCVD",
            NeighEvent::HeartbeatRcvd => "HEARTBEAT_RCVD",
            NeighEvent::HeartbeatTimerExpire => "HEARTBEAT_TIMER_EXPIRE",
            NeighEvent::NegotiateTimerExpire => "NEGOTIATE_TIMER_EXPIRE",
            NeighEvent::GrTimerExpire => "GR_TIMER_EXPIRE",
        }
    }
}

/// The transition table. Any `None` cell is a protocol error: the caller
/// logs it and leaves the neighbor in its current state.
pub fn next_state(state: NeighState, event: NeighEvent) -> Option<NeighState> {
    use NeighEvent::*;
    use NeighState::*;
    match (state, event) {
        (Idle, HelloRcvdInfo) => Some(Warm),
        (Idle, HelloRcvdNoInfo) => Some(Warm),

        (Warm, HelloRcvdInfo) => Some(Negotiate),

        (Negotiate, HandshakeRcvd) => Some(Established),
        (Negotiate, NegotiateTimerExpire) => Some(Warm),

        (Established, HelloRcvdNoInfo) => Some(Idle),
        (Established, HelloRcvdRestart) => Some(Restart),
        (Established, HandshakeRcvd) => Some(Established),
        (Established, HeartbeatRcvd) => Some(Established),
        (Established, HeartbeatTimerExpire) => Some(Idle),

        (Restart, HelloRcvdInfo) => Some(Established),
        (Restart, GrTimerExpire) => Some(Idle),

        _ => None,
    }
}

/// Everything tracked for one neighbor on one interface.
#[derive(Debug)]
pub struct Neighbor {
    pub domain_name: String,
    pub node_name: String,
    pub remote_if_name: String,
    /// MPLS label assigned locally to this adjacency.
    pub label: u32,
    /// Last sequence number heard from this neighbor.
    pub seq_num: u64,
    pub state: NeighState,

    /// Timestamp the neighbor stamped into its last hello, microseconds.
    pub neighbor_timestamp_us: i64,
    /// Our receive timestamp of that hello, microseconds.
    pub local_timestamp_us: i64,
    /// Smoothed RTT reported on events, microseconds.
    pub rtt_us: i64,
    /// Most recent raw sample, microseconds.
    pub rtt_latest_us: i64,
    pub step_detector: StepDetector,

    // Negotiated in handshake.
    pub heartbeat_hold_time: Duration,
    pub graceful_restart_hold_time: Duration,
    pub transport_address_v6: Option<Ipv6Addr>,
    pub transport_address_v4: Option<Ipv4Addr>,
    pub kv_cmd_port: u16,
    pub kv_pub_port: u16,
    pub supports_flood_optimization: bool,

    /// The one common area negotiated from hello area sets.
    pub area: Option<String>,

    // Pending timers; tokens carry (ifName, nodeName) and are looked up at
    // fire time, so a stale timer on a removed neighbor is a no-op.
    pub handshake_timer: Option<TimerId>,
    pub negotiate_hold_timer: Option<TimerId>,
    pub heartbeat_hold_timer: Option<TimerId>,
    pub gr_hold_timer: Option<TimerId>,

    /// Restarting hellos seen since the last UP/RESTARTED, for duplicate
    /// suppression.
    pub num_recv_restarting: u32,
}

impl Neighbor {
    pub fn new(
        domain_name: String,
        node_name: String,
        remote_if_name: String,
        label: u32,
        seq_num: u64,
    ) -> Self {
        Self {
            domain_name,
            node_name,
            remote_if_name,
            label,
            seq_num,
            state: NeighState::Idle,
            neighbor_timestamp_us: 0,
            local_timestamp_us: 0,
            rtt_us: 0,
            rtt_latest_us: 0,
            step_detector: StepDetector::new(
                RTT_FAST_WINDOW,
                RTT_SLOW_WINDOW,
                RTT_STEP_PCT,
                RTT_STEP_ABS_US,
            ),
            heartbeat_hold_time: Duration::ZERO,
            graceful_restart_hold_time: Duration::ZERO,
            transport_address_v6: None,
            transport_address_v4: None,
            kv_cmd_port: 0,
            kv_pub_port: 0,
            supports_flood_optimization: false,
            area: None,
            handshake_timer: None,
            negotiate_hold_timer: None,
            heartbeat_hold_timer: None,
            gr_hold_timer: None,
            num_recv_restarting: 0,
        }
    }

    pub fn to_info(&self) -> NeighborInfo {
        NeighborInfo {
            domain_name: self.domain_name.clone(),
            node_name: self.node_name.clone(),
            remote_if_name: self.remote_if_name.clone(),
            link_local_v6: self.transport_address_v6,
            v4_addr: self.transport_address_v4,
            kv_cmd_port: self.kv_cmd_port,
            kv_pub_port: self.kv_pub_port,
            hold_time_ms: self.heartbeat_hold_time.as_millis() as u64,
        }
    }
}
