//! The discovery actor: one task owning interfaces, neighbors, and timers.

use crate::iface::{diff_interfaces, validated_interfaces, Interface};
use crate::io::{PacketIo, RecvPacket};
use crate::neighbor::{next_state, NeighEvent, NeighState, Neighbor};
use crate::{NeighborEntry, SparkCommand, SparkConfig, SparkError};
use spindle_codec::{HandshakeMsg, HeartbeatMsg, HelloMsg, HelloPacket, ReflectedNeighborInfo};
use spindle_common::{
    InterfaceDatabase, NeighborEvent, NeighborEventKind, LOWEST_SUPPORTED_VERSION,
    SPARK_HOP_LIMIT, VERSION,
};
use spindle_metrics::metrics;
use spindle_runtime::{jitter, BucketedRateLimit, TimerWheel};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Buckets in the inbound rate limiter.
const NUM_RATE_BUCKETS: usize = 1024;
/// Restarting hellos sent per interface before going down.
const NUM_RESTARTING_PKT_SENT: usize = 3;
/// Jitter applied to periodic hello/heartbeat timers.
const TIMER_JITTER_PCT: f64 = 0.2;

#[derive(Debug, Clone)]
enum SparkTimer {
    /// Periodic hello on an interface.
    Hello { if_name: String },
    /// Periodic heartbeat on an interface.
    Heartbeat { if_name: String },
    /// Periodic handshake retransmit while a neighbor is in NEGOTIATE.
    Handshake { if_name: String, node: String },
    NegotiateHold { if_name: String, node: String },
    HeartbeatHold { if_name: String, node: String },
    GrHold { if_name: String, node: String },
}

struct TrackedInterface {
    info: Interface,
    created_at: Instant,
}

enum Seen {
    /// Our name is absent from the hello's neighbor infos.
    No,
    /// Present, with a sane sequence number.
    Yes,
    /// Present but reflecting a seqNum at or above ours: the peer is still
    /// seeing our previous incarnation.
    PreviousIncarnation,
}

pub(crate) struct SparkActor<P: PacketIo> {
    config: SparkConfig,
    io: P,
    cmd_rx: mpsc::Receiver<SparkCommand>,
    event_tx: mpsc::Sender<NeighborEvent>,
    timers: TimerWheel<SparkTimer>,
    interfaces: BTreeMap<String, TrackedInterface>,
    /// ifName -> nodeName -> neighbor.
    neighbors: BTreeMap<String, BTreeMap<String, Neighbor>>,
    allocated_labels: BTreeSet<u32>,
    my_seq_num: u64,
    rate_limit: BucketedRateLimit,
}

fn make_event(kind: NeighborEventKind, if_name: &str, n: &Neighbor) -> NeighborEvent {
    NeighborEvent {
        kind,
        if_name: if_name.to_string(),
        neighbor: n.to_info(),
        rtt_us: n.rtt_us,
        label: n.label,
        supports_flood_optimization: n.supports_flood_optimization,
        area: n.area.clone(),
    }
}

/// Apply `event` to the neighbor's state machine. Undefined cells are
/// logged and leave the state untouched.
fn transition(n: &mut Neighbor, event: NeighEvent, if_name: &str) -> bool {
    match next_state(n.state, event) {
        Some(next) => {
            if next == n.state {
                tracing::trace!(
                    "event [{}] keeps neighbor ({}) on interface ({}) in [{}]",
                    event.as_str(),
                    n.node_name,
                    if_name,
                    n.state.as_str()
                );
            } else {
                tracing::info!(
                    "state change: [{}] -> [{}] for neighbor ({}) on interface ({})",
                    n.state.as_str(),
                    next.as_str(),
                    n.node_name,
                    if_name
                );
            }
            metrics().neighbor_state_changes.inc();
            n.state = next;
            true
        }
        None => {
            metrics().state_machine_errors.inc();
            tracing::error!(
                "no transition from [{}] on event [{}] for neighbor ({}) on interface ({})",
                n.state.as_str(),
                event.as_str(),
                n.node_name,
                if_name
            );
            false
        }
    }
}

/// Derive an RTT sample from the peer's reflected timestamps and feed the
/// step detector. Returns the new level when a step fires.
fn update_rtt(n: &mut Neighbor, hello: &HelloMsg, recv_time_us: i64, my_name: &str) -> Option<i64> {
    let info = hello.neighbor_infos.get(my_name)?;
    let my_sent = info.last_nbr_msg_sent_ts_us;
    let nbr_recv = info.last_my_msg_rcvd_ts_us;
    let nbr_sent = hello.sent_ts_us;
    let my_recv = recv_time_us;

    // Only measure once the peer is reflecting one of our hellos.
    if my_sent == 0 || nbr_recv == 0 {
        return None;
    }
    if nbr_sent < nbr_recv || my_recv < my_sent {
        tracing::warn!(
            "time anomaly from {}: sent/recv timestamps out of order",
            n.node_name
        );
        return None;
    }
    let rtt = (my_recv - my_sent) - (nbr_sent - nbr_recv);
    if rtt < 0 {
        tracing::warn!("measured negative rtt from {}: {}us", n.node_name, rtt);
        return None;
    }

    // Mask to millisecond granularity with a 1 ms floor: sub-ms precision is
    // dominated by scheduling noise.
    let rtt = ((rtt / 1000) * 1000).max(1000);
    n.rtt_latest_us = rtt;
    if n.rtt_us == 0 {
        n.rtt_us = rtt;
    }
    if let Some(level) = n.step_detector.add_value(rtt) {
        let level = level.max(1000);
        tracing::info!(
            "rtt for neighbor ({}) changed from {}ms to {}ms",
            n.node_name,
            n.rtt_us / 1000,
            level / 1000
        );
        n.rtt_us = level;
        return Some(level);
    }
    None
}

impl<P: PacketIo> SparkActor<P> {
    pub(crate) fn new(
        config: SparkConfig,
        io: P,
        cmd_rx: mpsc::Receiver<SparkCommand>,
        event_tx: mpsc::Sender<NeighborEvent>,
    ) -> Self {
        let max_pps = config.max_allowed_pps;
        Self {
            config,
            io,
            cmd_rx,
            event_tx,
            timers: TimerWheel::new(),
            interfaces: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            allocated_labels: BTreeSet::new(),
            my_seq_num: 1,
            rate_limit: BucketedRateLimit::new(NUM_RATE_BUCKETS, max_pps),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(
            "discovery starting for node ({}) in domain ({})",
            self.config.node_name,
            self.config.domain_name
        );
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(SparkCommand::UpdateInterfaces { db, reply }) => {
                        let result = self.handle_interface_update(db).await;
                        let _ = reply.send(result);
                    }
                    Some(SparkCommand::GetNeighbors { reply }) => {
                        let _ = reply.send(self.dump_neighbors());
                    }
                    Some(SparkCommand::Stop { reply }) => {
                        self.graceful_stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.graceful_stop().await;
                        return;
                    }
                },
                pkt = self.io.recv() => match pkt {
                    Ok(pkt) => self.handle_packet(pkt).await,
                    Err(e) => {
                        tracing::error!("discovery socket error: {}", e);
                        return;
                    }
                },
                token = self.timers.expired() => self.handle_timer(token).await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interface tracking
    // -----------------------------------------------------------------------

    async fn handle_interface_update(
        &mut self,
        db: InterfaceDatabase,
    ) -> Result<(), SparkError> {
        if db.this_node_name != self.config.node_name {
            return Err(SparkError::WrongNode {
                got: db.this_node_name,
                expected: self.config.node_name.clone(),
            });
        }

        let new_map = validated_interfaces(&db, self.config.enable_v4);
        let current_map: BTreeMap<String, Interface> = self
            .interfaces
            .iter()
            .map(|(name, tracked)| (name.clone(), tracked.info.clone()))
            .collect();
        let (to_add, to_del, to_update) = diff_interfaces(&current_map, &new_map);

        let mut down_events = Vec::new();

        for if_name in &to_del {
            tracing::info!("removing interface ({}) from tracking", if_name);
            let removed = self.interfaces.remove(if_name);
            for (node, n) in self.neighbors.remove(if_name).unwrap_or_default() {
                self.allocated_labels.remove(&n.label);
                for id in [
                    n.handshake_timer,
                    n.negotiate_hold_timer,
                    n.heartbeat_hold_timer,
                    n.gr_hold_timer,
                ]
                .into_iter()
                .flatten()
                {
                    self.timers.cancel(id);
                }
                if matches!(n.state, NeighState::Established | NeighState::Restart) {
                    tracing::info!(
                        "neighbor ({}) removed due to interface ({}) down",
                        node,
                        if_name
                    );
                    down_events.push(make_event(NeighborEventKind::Down, if_name, &n));
                }
            }
            if let Some(tracked) = removed {
                if let Err(e) = self.io.leave_multicast(tracked.info.if_index) {
                    tracing::warn!("failed leaving multicast group on {}: {}", if_name, e);
                }
            }
        }

        for if_name in &to_add {
            let info = new_map[if_name].clone();
            if let Err(e) = self.io.join_multicast(info.if_index) {
                tracing::error!("failed joining multicast group on {}: {}", if_name, e);
                continue;
            }
            tracing::info!(
                "tracking interface ({}) with ifindex {}",
                if_name,
                info.if_index
            );
            self.interfaces.insert(
                if_name.clone(),
                TrackedInterface {
                    info,
                    created_at: Instant::now(),
                },
            );
            self.neighbors.insert(if_name.clone(), BTreeMap::new());

            // The first hello is delayed: the link-local address may not be
            // usable the instant the interface appears.
            self.timers.schedule(
                jitter(self.config.fast_init_keep_alive_time, TIMER_JITTER_PCT),
                SparkTimer::Hello {
                    if_name: if_name.clone(),
                },
            );
            self.timers.schedule(
                jitter(self.config.keep_alive_time, TIMER_JITTER_PCT),
                SparkTimer::Heartbeat {
                    if_name: if_name.clone(),
                },
            );
        }

        for if_name in &to_update {
            let new_info = new_map[if_name].clone();
            let tracked = self.interfaces.get_mut(if_name).expect("tracked");
            if tracked.info == new_info {
                continue;
            }
            if tracked.info.if_index != new_info.if_index {
                if let Err(e) = self.io.leave_multicast(tracked.info.if_index) {
                    tracing::warn!("failed leaving multicast group on {}: {}", if_name, e);
                }
                if let Err(e) = self.io.join_multicast(new_info.if_index) {
                    tracing::error!("failed joining multicast group on {}: {}", if_name, e);
                }
            }
            tracing::info!(
                "updating interface ({}): ifindex {} -> {}",
                if_name,
                tracked.info.if_index,
                new_info.if_index
            );
            let tracked = self.interfaces.get_mut(if_name).expect("tracked");
            tracked.info = new_info;
        }

        for event in down_events {
            metrics()
                .neighbor_events
                .with_label_values(&[event.kind.as_str()])
                .inc();
            let _ = self.event_tx.send(event).await;
        }
        self.update_gauges();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound packets
    // -----------------------------------------------------------------------

    async fn handle_packet(&mut self, pkt: RecvPacket) {
        let m = metrics();
        m.hello_packets_received.inc();
        m.hello_bytes_received.inc_by(pkt.data.len() as u64);

        if pkt.hop_limit < SPARK_HOP_LIMIT {
            tracing::error!(
                "rejecting packet from {} with hop limit {}",
                pkt.src,
                pkt.hop_limit
            );
            m.invalid_packets.with_label_values(&["hop_limit"]).inc();
            m.hello_packets_dropped.inc();
            return;
        }

        let Some(if_name) = self
            .interfaces
            .iter()
            .find(|(_, t)| t.info.if_index == pkt.if_index)
            .map(|(name, _)| name.clone())
        else {
            tracing::error!(
                "packet from {} on unknown interface index {}",
                pkt.src,
                pkt.if_index
            );
            m.invalid_packets.with_label_values(&["unknown_iface"]).inc();
            m.hello_packets_dropped.inc();
            return;
        };

        let mut hasher = DefaultHasher::new();
        (if_name.as_str(), pkt.src).hash(&mut hasher);
        if !self.rate_limit.allow(hasher.finish()) {
            tracing::error!(
                "dropping packet due to rate limiting on interface ({}) from {}",
                if_name,
                pkt.src
            );
            m.invalid_packets.with_label_values(&["rate_limited"]).inc();
            m.hello_packets_dropped.inc();
            return;
        }

        let packet = match HelloPacket::decode(&pkt.data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("failed parsing packet from {}: {}", pkt.src, e);
                m.invalid_packets.with_label_values(&["malformed"]).inc();
                m.hello_packets_dropped.inc();
                return;
            }
        };

        if let Some(hello) = packet.hello {
            self.process_hello(if_name, hello, pkt.recv_time_us).await;
        } else if let Some(handshake) = packet.handshake {
            self.process_handshake(if_name, handshake).await;
        } else if let Some(heartbeat) = packet.heartbeat {
            self.process_heartbeat(if_name, heartbeat);
        } else if packet.legacy.is_some() {
            tracing::debug!("ignoring legacy-only hello packet from {}", pkt.src);
            m.invalid_packets.with_label_values(&["legacy"]).inc();
        }
        self.update_gauges();
    }

    async fn process_hello(&mut self, if_name: String, hello: HelloMsg, recv_time_us: i64) {
        let m = metrics();

        // Validation pipeline.
        if hello.node_name == self.config.node_name {
            m.invalid_packets.with_label_values(&["looped"]).inc();
            return;
        }
        if hello.domain_name != self.config.domain_name {
            tracing::error!(
                "ignoring hello from ({}) in foreign domain ({})",
                hello.node_name,
                hello.domain_name
            );
            m.invalid_packets.with_label_values(&["domain"]).inc();
            return;
        }
        if hello.version < LOWEST_SUPPORTED_VERSION {
            tracing::error!(
                "unsupported version {} from ({}), must be >= {}",
                hello.version,
                hello.node_name,
                LOWEST_SUPPORTED_VERSION
            );
            m.invalid_packets.with_label_values(&["version"]).inc();
            return;
        }
        let Ok(area) = self.find_common_area(&hello.areas, &hello.node_name) else {
            return;
        };

        let node = hello.node_name.clone();

        // First time we hear from this neighbor: track it and move to WARM.
        let known = self
            .neighbors
            .get(&if_name)
            .is_some_and(|ns| ns.contains_key(&node));
        if !known {
            let label = self.allocate_label(&if_name);
            let mut n = Neighbor::new(
                hello.domain_name.clone(),
                node.clone(),
                hello.if_name.clone(),
                label,
                hello.seq_num,
            );
            n.area = area;
            n.heartbeat_hold_time = self.config.heartbeat_hold_time;
            n.graceful_restart_hold_time = self.config.hold_time;
            transition(&mut n, NeighEvent::HelloRcvdNoInfo, &if_name);
            self.neighbors
                .get_mut(&if_name)
                .expect("interface tracked")
                .insert(node, n);
            return;
        }

        let seen = match hello.neighbor_infos.get(&self.config.node_name) {
            None => Seen::No,
            Some(info) if info.seen_seq_num >= self.my_seq_num => Seen::PreviousIncarnation,
            Some(_) => Seen::Yes,
        };

        // Timestamps and RTT, under a scoped borrow.
        let (prev_seq, state, rtt_changed) = {
            let n = self
                .neighbors
                .get_mut(&if_name)
                .and_then(|ns| ns.get_mut(&node))
                .expect("checked above");
            let prev_seq = n.seq_num;
            if area.is_some() {
                n.area = area.clone();
            }
            n.neighbor_timestamp_us = hello.sent_ts_us;
            n.local_timestamp_us = recv_time_us;
            let rtt_changed = update_rtt(n, &hello, recv_time_us, &self.config.node_name);
            (prev_seq, n.state, rtt_changed)
        };

        if rtt_changed.is_some() && state == NeighState::Established {
            let event = {
                let n = &self.neighbors[&if_name][&node];
                make_event(NeighborEventKind::RttChange, &if_name, n)
            };
            self.emit(event).await;
        }

        match state {
            NeighState::Idle => {
                // Rarely observable: entries landing in IDLE are removed.
                let event = if matches!(seen, Seen::Yes) {
                    NeighEvent::HelloRcvdInfo
                } else {
                    NeighEvent::HelloRcvdNoInfo
                };
                let n = self
                    .neighbors
                    .get_mut(&if_name)
                    .and_then(|ns| ns.get_mut(&node))
                    .expect("checked above");
                n.seq_num = hello.seq_num;
                transition(n, event, &if_name);
            }

            NeighState::Warm => {
                {
                    let n = self
                        .neighbors
                        .get_mut(&if_name)
                        .and_then(|ns| ns.get_mut(&node))
                        .expect("checked above");
                    n.seq_num = hello.seq_num;
                }
                match seen {
                    Seen::No => {
                        // Fast-init: an unseen soliciting peer gets an
                        // immediate reply.
                        if hello.solicit_response {
                            self.send_hello(&if_name, false, false).await;
                        }
                    }
                    Seen::PreviousIncarnation => {
                        tracing::debug!(
                            "neighbor ({}) still reflects our previous incarnation",
                            node
                        );
                    }
                    Seen::Yes => {
                        {
                            let n = self
                                .neighbors
                                .get_mut(&if_name)
                                .and_then(|ns| ns.get_mut(&node))
                                .expect("checked above");
                            if !transition(n, NeighEvent::HelloRcvdInfo, &if_name) {
                                return;
                            }
                            n.handshake_timer = Some(self.timers.schedule(
                                self.config.handshake_time,
                                SparkTimer::Handshake {
                                    if_name: if_name.clone(),
                                    node: node.clone(),
                                },
                            ));
                            n.negotiate_hold_timer = Some(self.timers.schedule(
                                self.config.negotiate_hold_time,
                                SparkTimer::NegotiateHold {
                                    if_name: if_name.clone(),
                                    node: node.clone(),
                                },
                            ));
                        }
                        self.send_handshake(&if_name, false).await;
                    }
                }
            }

            NeighState::Negotiate => {
                let n = self
                    .neighbors
                    .get_mut(&if_name)
                    .and_then(|ns| ns.get_mut(&node))
                    .expect("checked above");
                n.seq_num = hello.seq_num;
            }

            NeighState::Established => {
                if hello.restarting {
                    let event = {
                        let n = self
                            .neighbors
                            .get_mut(&if_name)
                            .and_then(|ns| ns.get_mut(&node))
                            .expect("checked above");
                        n.num_recv_restarting += 1;
                        if n.num_recv_restarting > 1 {
                            // Duplicate restarting hello, already reported.
                            return;
                        }
                        if !transition(n, NeighEvent::HelloRcvdRestart, &if_name) {
                            return;
                        }
                        if let Some(id) = n.heartbeat_hold_timer.take() {
                            self.timers.cancel(id);
                        }
                        n.gr_hold_timer = Some(self.timers.schedule(
                            n.graceful_restart_hold_time,
                            SparkTimer::GrHold {
                                if_name: if_name.clone(),
                                node: node.clone(),
                            },
                        ));
                        tracing::info!(
                            "neighbor ({}) on interface ({}) is restarting",
                            node,
                            if_name
                        );
                        make_event(NeighborEventKind::Restarting, &if_name, n)
                    };
                    self.emit(event).await;
                    return;
                }

                if hello.seq_num <= prev_seq {
                    // The peer's sequence number went backwards: it
                    // restarted without telling us.
                    let event = {
                        let n = self
                            .neighbors
                            .get_mut(&if_name)
                            .and_then(|ns| ns.get_mut(&node))
                            .expect("checked above");
                        tracing::info!(
                            "neighbor ({}) restarted: got seq {} instead of {}",
                            node,
                            hello.seq_num,
                            prev_seq + 1
                        );
                        n.seq_num = hello.seq_num;
                        if !transition(n, NeighEvent::HelloRcvdRestart, &if_name) {
                            return;
                        }
                        if let Some(id) = n.heartbeat_hold_timer.take() {
                            self.timers.cancel(id);
                        }
                        n.gr_hold_timer = Some(self.timers.schedule(
                            n.graceful_restart_hold_time,
                            SparkTimer::GrHold {
                                if_name: if_name.clone(),
                                node: node.clone(),
                            },
                        ));
                        make_event(NeighborEventKind::Restarting, &if_name, n)
                    };
                    self.emit(event).await;
                    return;
                }

                match seen {
                    Seen::No => {
                        // The peer stopped seeing us: drop the adjacency.
                        let event = {
                            let n = self
                                .neighbors
                                .get_mut(&if_name)
                                .and_then(|ns| ns.get_mut(&node))
                                .expect("checked above");
                            n.seq_num = hello.seq_num;
                            if !transition(n, NeighEvent::HelloRcvdNoInfo, &if_name) {
                                return;
                            }
                            make_event(NeighborEventKind::Down, &if_name, n)
                        };
                        self.emit(event).await;
                        self.remove_neighbor(&if_name, &node);
                    }
                    Seen::PreviousIncarnation => {}
                    Seen::Yes => {
                        // Keep-alive: refresh the hold timer in place.
                        let n = self
                            .neighbors
                            .get_mut(&if_name)
                            .and_then(|ns| ns.get_mut(&node))
                            .expect("checked above");
                        n.seq_num = hello.seq_num;
                        if let Some(id) = n.heartbeat_hold_timer.take() {
                            self.timers.cancel(id);
                        }
                        n.heartbeat_hold_timer = Some(self.timers.schedule(
                            n.heartbeat_hold_time,
                            SparkTimer::HeartbeatHold {
                                if_name: if_name.clone(),
                                node: node.clone(),
                            },
                        ));
                    }
                }
            }

            NeighState::Restart => {
                if hello.restarting {
                    let n = self
                        .neighbors
                        .get_mut(&if_name)
                        .and_then(|ns| ns.get_mut(&node))
                        .expect("checked above");
                    n.num_recv_restarting += 1;
                    return;
                }
                if matches!(seen, Seen::Yes) {
                    let event = {
                        let n = self
                            .neighbors
                            .get_mut(&if_name)
                            .and_then(|ns| ns.get_mut(&node))
                            .expect("checked above");
                        n.seq_num = hello.seq_num;
                        if !transition(n, NeighEvent::HelloRcvdInfo, &if_name) {
                            return;
                        }
                        n.num_recv_restarting = 0;
                        if let Some(id) = n.gr_hold_timer.take() {
                            self.timers.cancel(id);
                        }
                        n.heartbeat_hold_timer = Some(self.timers.schedule(
                            n.heartbeat_hold_time,
                            SparkTimer::HeartbeatHold {
                                if_name: if_name.clone(),
                                node: node.clone(),
                            },
                        ));
                        make_event(NeighborEventKind::Restarted, &if_name, n)
                    };
                    self.emit(event).await;
                } else {
                    let n = self
                        .neighbors
                        .get_mut(&if_name)
                        .and_then(|ns| ns.get_mut(&node))
                        .expect("checked above");
                    n.seq_num = hello.seq_num;
                }
            }
        }
    }

    async fn process_handshake(&mut self, if_name: String, handshake: HandshakeMsg) {
        let node = handshake.node_name.clone();
        let Some(state) = self
            .neighbors
            .get(&if_name)
            .and_then(|ns| ns.get(&node))
            .map(|n| n.state)
        else {
            tracing::debug!(
                "handshake from untracked neighbor ({}) on interface ({})",
                node,
                if_name
            );
            return;
        };

        // Reply immediately when the peer has not formed the adjacency yet.
        if !handshake.is_adj_established {
            self.send_handshake(&if_name, state == NeighState::Established)
                .await;
        }

        if state != NeighState::Negotiate {
            // A v4 reassignment on an established neighbor means it bounced.
            if state == NeighState::Established && self.config.enable_v4 {
                let v4_changed = {
                    let n = &self.neighbors[&if_name][&node];
                    n.transport_address_v4.is_some()
                        && handshake.transport_address_v4 != n.transport_address_v4
                };
                if v4_changed {
                    let event = {
                        let n = self
                            .neighbors
                            .get_mut(&if_name)
                            .and_then(|ns| ns.get_mut(&node))
                            .expect("checked above");
                        tracing::info!("neighbor ({}) reassigned its v4 address", node);
                        if !transition(n, NeighEvent::HelloRcvdRestart, &if_name) {
                            return;
                        }
                        if let Some(id) = n.heartbeat_hold_timer.take() {
                            self.timers.cancel(id);
                        }
                        n.gr_hold_timer = Some(self.timers.schedule(
                            n.graceful_restart_hold_time,
                            SparkTimer::GrHold {
                                if_name: if_name.clone(),
                                node: node.clone(),
                            },
                        ));
                        make_event(NeighborEventKind::Restarting, &if_name, n)
                    };
                    self.emit(event).await;
                    return;
                }
            }
            tracing::debug!(
                "handshake from ({}) in [{}], expected [NEGOTIATE]",
                node,
                state.as_str()
            );
            return;
        }

        if self.config.enable_v4
            && self.config.enable_subnet_validation
            && !self.validate_v4_subnet(&if_name, handshake.transport_address_v4)
        {
            return;
        }

        let event = {
            let n = self
                .neighbors
                .get_mut(&if_name)
                .and_then(|ns| ns.get_mut(&node))
                .expect("checked above");
            n.kv_cmd_port = handshake.kv_cmd_port;
            n.kv_pub_port = handshake.kv_pub_port;
            n.transport_address_v4 = handshake.transport_address_v4;
            n.transport_address_v6 = handshake.transport_address_v6;
            n.supports_flood_optimization = handshake.supports_flood_optimization;
            // Honor the larger of the peer's ask and our own floor.
            n.heartbeat_hold_time = Duration::from_millis(handshake.hold_time_ms)
                .max(self.config.heartbeat_hold_time);
            n.graceful_restart_hold_time =
                Duration::from_millis(handshake.graceful_restart_time_ms)
                    .max(self.config.hold_time);
            if !transition(n, NeighEvent::HandshakeRcvd, &if_name) {
                return;
            }
            if let Some(id) = n.handshake_timer.take() {
                self.timers.cancel(id);
            }
            if let Some(id) = n.negotiate_hold_timer.take() {
                self.timers.cancel(id);
            }
            n.heartbeat_hold_timer = Some(self.timers.schedule(
                n.heartbeat_hold_time,
                SparkTimer::HeartbeatHold {
                    if_name: if_name.clone(),
                    node: node.clone(),
                },
            ));
            make_event(NeighborEventKind::Up, &if_name, n)
        };
        self.emit(event).await;
    }

    fn process_heartbeat(&mut self, if_name: String, heartbeat: HeartbeatMsg) {
        let Some(n) = self
            .neighbors
            .get_mut(&if_name)
            .and_then(|ns| ns.get_mut(&heartbeat.node_name))
        else {
            tracing::debug!(
                "heartbeat from untracked neighbor ({}) on interface ({})",
                heartbeat.node_name,
                if_name
            );
            return;
        };

        if n.state != NeighState::Established {
            // Heartbeats only maintain an existing adjacency.
            metrics().state_machine_errors.inc();
            tracing::error!(
                "heartbeat from ({}) in [{}], expected [ESTABLISHED]",
                heartbeat.node_name,
                n.state.as_str()
            );
            return;
        }

        transition(n, NeighEvent::HeartbeatRcvd, &if_name);
        if let Some(id) = n.heartbeat_hold_timer.take() {
            self.timers.cancel(id);
        }
        n.heartbeat_hold_timer = Some(self.timers.schedule(
            n.heartbeat_hold_time,
            SparkTimer::HeartbeatHold {
                if_name,
                node: heartbeat.node_name,
            },
        ));
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    async fn handle_timer(&mut self, token: SparkTimer) {
        match token {
            SparkTimer::Hello { if_name } => {
                let Some(tracked) = self.interfaces.get(&if_name) else {
                    return;
                };
                // Stay at the elevated rate for 3 fast-init periods after
                // the interface appears.
                let fast = tracked.created_at.elapsed()
                    <= 3 * self.config.fast_init_keep_alive_time;
                self.send_hello(&if_name, fast, false).await;

                let base = if fast {
                    self.config.fast_init_keep_alive_time
                } else {
                    self.config.keep_alive_time
                };
                self.timers
                    .schedule(jitter(base, TIMER_JITTER_PCT), SparkTimer::Hello { if_name });
            }

            SparkTimer::Heartbeat { if_name } => {
                if !self.interfaces.contains_key(&if_name) {
                    return;
                }
                let has_adjacency = self
                    .neighbors
                    .get(&if_name)
                    .is_some_and(|ns| ns.values().any(|n| n.state == NeighState::Established));
                if has_adjacency {
                    self.send_heartbeat(&if_name).await;
                }
                self.timers.schedule(
                    jitter(self.config.keep_alive_time, TIMER_JITTER_PCT),
                    SparkTimer::Heartbeat { if_name },
                );
            }

            SparkTimer::Handshake { if_name, node } => {
                let negotiating = self
                    .neighbors
                    .get(&if_name)
                    .and_then(|ns| ns.get(&node))
                    .is_some_and(|n| n.state == NeighState::Negotiate);
                if !negotiating {
                    return;
                }
                self.send_handshake(&if_name, false).await;
                let id = self.timers.schedule(
                    self.config.handshake_time,
                    SparkTimer::Handshake {
                        if_name: if_name.clone(),
                        node: node.clone(),
                    },
                );
                if let Some(n) = self.neighbors.get_mut(&if_name).and_then(|ns| ns.get_mut(&node))
                {
                    n.handshake_timer = Some(id);
                }
            }

            SparkTimer::NegotiateHold { if_name, node } => {
                let Some(n) = self
                    .neighbors
                    .get_mut(&if_name)
                    .and_then(|ns| ns.get_mut(&node))
                else {
                    return;
                };
                if n.state != NeighState::Negotiate {
                    return;
                }
                tracing::info!(
                    "negotiate timer expired for ({}) on interface ({})",
                    node,
                    if_name
                );
                transition(n, NeighEvent::NegotiateTimerExpire, &if_name);
                if let Some(id) = n.handshake_timer.take() {
                    self.timers.cancel(id);
                }
                n.negotiate_hold_timer = None;
            }

            SparkTimer::HeartbeatHold { if_name, node } => {
                let expired = self
                    .neighbors
                    .get(&if_name)
                    .and_then(|ns| ns.get(&node))
                    .is_some_and(|n| n.state == NeighState::Established);
                if !expired {
                    return;
                }
                let event = {
                    let n = self
                        .neighbors
                        .get_mut(&if_name)
                        .and_then(|ns| ns.get_mut(&node))
                        .expect("checked above");
                    tracing::info!(
                        "neighbor ({}) expired on interface ({})",
                        node,
                        if_name
                    );
                    if !transition(n, NeighEvent::HeartbeatTimerExpire, &if_name) {
                        return;
                    }
                    make_event(NeighborEventKind::Down, &if_name, n)
                };
                self.emit(event).await;
                self.remove_neighbor(&if_name, &node);
            }

            SparkTimer::GrHold { if_name, node } => {
                let waiting = self
                    .neighbors
                    .get(&if_name)
                    .and_then(|ns| ns.get(&node))
                    .is_some_and(|n| n.state == NeighState::Restart);
                if !waiting {
                    return;
                }
                let event = {
                    let n = self
                        .neighbors
                        .get_mut(&if_name)
                        .and_then(|ns| ns.get_mut(&node))
                        .expect("checked above");
                    tracing::info!(
                        "graceful-restart window expired for ({}) on interface ({})",
                        node,
                        if_name
                    );
                    if !transition(n, NeighEvent::GrTimerExpire, &if_name) {
                        return;
                    }
                    make_event(NeighborEventKind::Down, &if_name, n)
                };
                self.emit(event).await;
                self.remove_neighbor(&if_name, &node);
            }
        }
        self.update_gauges();
    }

    // -----------------------------------------------------------------------
    // Outbound packets
    // -----------------------------------------------------------------------

    async fn send_hello(&mut self, if_name: &str, fast: bool, restarting: bool) {
        let Some(tracked) = self.interfaces.get(if_name) else {
            tracing::error!("interface ({}) no longer tracked", if_name);
            return;
        };
        let if_index = tracked.info.if_index;

        let mut neighbor_infos = BTreeMap::new();
        if let Some(ns) = self.neighbors.get(if_name) {
            for (name, n) in ns {
                neighbor_infos.insert(
                    name.clone(),
                    ReflectedNeighborInfo {
                        seen_seq_num: n.seq_num,
                        last_nbr_msg_sent_ts_us: n.neighbor_timestamp_us,
                        last_my_msg_rcvd_ts_us: n.local_timestamp_us,
                    },
                );
            }
        }

        let hello = HelloMsg {
            domain_name: self.config.domain_name.clone(),
            node_name: self.config.node_name.clone(),
            if_name: if_name.to_string(),
            seq_num: self.my_seq_num,
            version: VERSION,
            solicit_response: fast,
            restarting,
            neighbor_infos,
            areas: self.config.areas.clone(),
            sent_ts_us: self.io.now_us(),
        };

        // The sequence number advances whether or not the send worked.
        self.my_seq_num += 1;

        match HelloPacket::from_hello(hello).encode() {
            Ok(bytes) => match self.io.send(if_index, &bytes).await {
                Ok(sent) => {
                    let m = metrics();
                    m.hello_packets_sent.inc();
                    m.hello_bytes_sent.inc_by(sent as u64);
                }
                Err(e) => {
                    tracing::warn!("hello send failed on ({}): {}", if_name, e);
                }
            },
            Err(e) => {
                tracing::error!("hello packet on ({}) not sent: {}", if_name, e);
            }
        }
    }

    async fn send_handshake(&mut self, if_name: &str, is_adj_established: bool) {
        let Some(tracked) = self.interfaces.get(if_name) else {
            return;
        };
        let if_index = tracked.info.if_index;

        let handshake = HandshakeMsg {
            node_name: self.config.node_name.clone(),
            is_adj_established,
            hold_time_ms: self.config.heartbeat_hold_time.as_millis() as u64,
            graceful_restart_time_ms: self.config.hold_time.as_millis() as u64,
            transport_address_v6: Some(tracked.info.v6_link_local.0),
            transport_address_v4: tracked.info.v4_network.map(|(addr, _)| addr),
            kv_cmd_port: self.config.kv_cmd_port,
            kv_pub_port: self.config.kv_pub_port,
            area: String::new(),
            supports_flood_optimization: self.config.enable_flood_optimization,
        };

        match HelloPacket::from_handshake(handshake).encode() {
            Ok(bytes) => match self.io.send(if_index, &bytes).await {
                Ok(_) => metrics().handshake_packets_sent.inc(),
                Err(e) => tracing::warn!("handshake send failed on ({}): {}", if_name, e),
            },
            Err(e) => tracing::error!("handshake packet on ({}) not sent: {}", if_name, e),
        }
    }

    async fn send_heartbeat(&mut self, if_name: &str) {
        let Some(tracked) = self.interfaces.get(if_name) else {
            return;
        };
        let if_index = tracked.info.if_index;

        let heartbeat = HeartbeatMsg {
            node_name: self.config.node_name.clone(),
            seq_num: self.my_seq_num,
        };
        match HelloPacket::from_heartbeat(heartbeat).encode() {
            Ok(bytes) => match self.io.send(if_index, &bytes).await {
                Ok(_) => metrics().heartbeat_packets_sent.inc(),
                Err(e) => tracing::warn!("heartbeat send failed on ({}): {}", if_name, e),
            },
            Err(e) => tracing::error!("heartbeat packet on ({}) not sent: {}", if_name, e),
        }
    }

    async fn graceful_stop(&mut self) {
        let if_names: Vec<String> = self.interfaces.keys().cloned().collect();
        for _ in 0..NUM_RESTARTING_PKT_SENT {
            for if_name in &if_names {
                self.send_hello(if_name, false, true).await;
            }
        }
        tracing::info!(
            "sent restarting hellos on {} interface(s), ready to go down",
            if_names.len()
        );
        self.timers.clear();
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn emit(&mut self, event: NeighborEvent) {
        metrics()
            .neighbor_events
            .with_label_values(&[event.kind.as_str()])
            .inc();
        if self.event_tx.send(event).await.is_err() {
            tracing::warn!("neighbor event receiver is gone");
        }
    }

    fn find_common_area(
        &self,
        adj_areas: &Option<BTreeSet<String>>,
        node: &str,
    ) -> Result<Option<String>, ()> {
        let (Some(mine), Some(theirs)) = (&self.config.areas, adj_areas) else {
            return Ok(None);
        };
        let common: Vec<&String> = mine.intersection(theirs).collect();
        match common.len() {
            0 => {
                tracing::warn!("no common area with ({})", node);
                metrics()
                    .invalid_packets
                    .with_label_values(&["no_common_area"])
                    .inc();
                Err(())
            }
            1 => Ok(Some(common[0].clone())),
            _ => {
                tracing::error!(
                    "invalid configuration, cannot have multiple common areas with ({})",
                    node
                );
                metrics()
                    .invalid_packets
                    .with_label_values(&["multiple_common_area"])
                    .inc();
                Err(())
            }
        }
    }

    fn validate_v4_subnet(&self, if_name: &str, addr: Option<Ipv4Addr>) -> bool {
        let Some(local) = self
            .interfaces
            .get(if_name)
            .and_then(|t| t.info.v4_cidr())
        else {
            return true;
        };
        match addr {
            None => {
                tracing::error!("neighbor v4 address missing on interface ({})", if_name);
                metrics()
                    .invalid_packets
                    .with_label_values(&["missing_v4"])
                    .inc();
                false
            }
            Some(v4) if !local.contains_v4(v4) => {
                tracing::error!(
                    "neighbor v4 address {} not in local subnet on interface ({})",
                    v4,
                    if_name
                );
                metrics().invalid_packets.with_label_values(&["subnet"]).inc();
                false
            }
            Some(_) => true,
        }
    }

    /// Assign a locally unique MPLS label: `lo + ifIndex` first, scanning
    /// down from `hi` on collision. Exhaustion is unrecoverable.
    fn allocate_label(&mut self, if_name: &str) -> u32 {
        let (lo, hi) = self.config.sr_local_range;
        let if_index = self
            .interfaces
            .get(if_name)
            .map(|t| t.info.if_index)
            .unwrap_or(0);

        let preferred = lo + if_index;
        if preferred <= hi && self.allocated_labels.insert(preferred) {
            return preferred;
        }

        let mut label = hi;
        while !self.allocated_labels.insert(label) {
            if label == lo {
                panic!("ran out of local label allocation space");
            }
            label -= 1;
        }
        label
    }

    fn remove_neighbor(&mut self, if_name: &str, node: &str) {
        if let Some(n) = self
            .neighbors
            .get_mut(if_name)
            .and_then(|ns| ns.remove(node))
        {
            self.allocated_labels.remove(&n.label);
            for id in [
                n.handshake_timer,
                n.negotiate_hold_timer,
                n.heartbeat_hold_timer,
                n.gr_hold_timer,
            ]
            .into_iter()
            .flatten()
            {
                self.timers.cancel(id);
            }
        }
    }

    fn dump_neighbors(&self) -> Vec<NeighborEntry> {
        self.neighbors
            .iter()
            .flat_map(|(if_name, ns)| {
                ns.values().map(move |n| NeighborEntry {
                    if_name: if_name.clone(),
                    node_name: n.node_name.clone(),
                    state: n.state.as_str(),
                    area: n.area.clone(),
                    rtt_us: n.rtt_us,
                    label: n.label,
                })
            })
            .collect()
    }

    fn update_gauges(&self) {
        let m = metrics();
        m.tracked_interfaces.set(self.interfaces.len() as i64);
        let tracked: usize = self.neighbors.values().map(|ns| ns.len()).sum();
        let adjacent = self
            .neighbors
            .values()
            .flat_map(|ns| ns.values())
            .filter(|n| n.state == NeighState::Established)
            .count();
        m.tracked_neighbors.set(tracked as i64);
        m.adjacent_neighbors.set(adjacent as i64);
    }
}
