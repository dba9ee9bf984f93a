//! spindle-spark: IPv6 link-local neighbor discovery.
//!
//! One actor task owns every tracked interface and neighbor. It drives a
//! hello/handshake/heartbeat protocol over link-local multicast, walks each
//! neighbor through the IDLE / WARM / NEGOTIATE / ESTABLISHED / RESTART
//! state machine, measures RTT from reflected timestamps, assigns a local
//! MPLS label per adjacency, and reports lifecycle events to the peer
//! manager.
//!
//! The transport is pluggable through [`PacketIo`]: production uses
//! [`UdpPacketIo`], tests wire nodes together with [`SimNetwork`].

mod actor;
pub mod iface;
pub mod io;
pub mod neighbor;
pub mod udp;

pub use io::{PacketIo, RecvPacket, SimNetwork, SimPacketIo};
pub use neighbor::{NeighEvent, NeighState};
pub use udp::UdpPacketIo;

use actor::SparkActor;
use spindle_common::{InterfaceDatabase, NeighborEvent};
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Runtime parameters of the discovery actor.
#[derive(Debug, Clone)]
pub struct SparkConfig {
    pub node_name: String,
    pub domain_name: String,
    /// Areas advertised in hellos. `None` skips area exchange entirely.
    pub areas: Option<BTreeSet<String>>,
    pub enable_v4: bool,
    pub enable_subnet_validation: bool,
    pub enable_flood_optimization: bool,
    /// Graceful-restart hold time advertised in handshakes.
    pub hold_time: Duration,
    pub keep_alive_time: Duration,
    pub fast_init_keep_alive_time: Duration,
    pub handshake_time: Duration,
    pub negotiate_hold_time: Duration,
    pub heartbeat_hold_time: Duration,
    /// Ports advertised in handshakes for the key-value store endpoints.
    pub kv_cmd_port: u16,
    pub kv_pub_port: u16,
    /// Local MPLS label range for adjacencies, inclusive.
    pub sr_local_range: (u32, u32),
    pub max_allowed_pps: u32,
}

impl SparkConfig {
    /// A config with production defaults for the given identity.
    pub fn new(node_name: impl Into<String>, domain_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            domain_name: domain_name.into(),
            areas: None,
            enable_v4: false,
            enable_subnet_validation: true,
            enable_flood_optimization: false,
            hold_time: Duration::from_secs(30),
            keep_alive_time: Duration::from_secs(2),
            fast_init_keep_alive_time: Duration::from_millis(100),
            handshake_time: Duration::from_millis(500),
            negotiate_hold_time: Duration::from_secs(10),
            heartbeat_hold_time: Duration::from_secs(6),
            kv_cmd_port: 60_002,
            kv_pub_port: 60_001,
            sr_local_range: (50_000, 59_999),
            max_allowed_pps: 300,
        }
    }
}

/// Errors surfaced on the command interface.
#[derive(Debug, thiserror::Error)]
pub enum SparkError {
    #[error("interface snapshot for node {got}, expected {expected}")]
    WrongNode { got: String, expected: String },

    #[error("discovery actor is gone")]
    ActorGone,
}

/// One row of the operator-facing neighbor dump.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub if_name: String,
    pub node_name: String,
    pub state: &'static str,
    pub area: Option<String>,
    pub rtt_us: i64,
    pub label: u32,
}

pub(crate) enum SparkCommand {
    UpdateInterfaces {
        db: InterfaceDatabase,
        reply: oneshot::Sender<Result<(), SparkError>>,
    },
    GetNeighbors {
        reply: oneshot::Sender<Vec<NeighborEntry>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the discovery actor.
#[derive(Clone)]
pub struct Spark {
    cmd_tx: mpsc::Sender<SparkCommand>,
}

impl Spark {
    /// Spawn the discovery actor over the given transport. Returns the
    /// handle, the neighbor-event stream, and the actor's join handle.
    pub fn spawn<P: PacketIo>(
        config: SparkConfig,
        io: P,
    ) -> (Self, mpsc::Receiver<NeighborEvent>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let actor = SparkActor::new(config, io, cmd_rx, event_tx);
        let handle = tokio::spawn(actor.run());
        (Self { cmd_tx }, event_rx, handle)
    }

    /// Push a fresh interface snapshot from the platform.
    pub async fn update_interfaces(&self, db: InterfaceDatabase) -> Result<(), SparkError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SparkCommand::UpdateInterfaces { db, reply })
            .await
            .map_err(|_| SparkError::ActorGone)?;
        rx.await.map_err(|_| SparkError::ActorGone)?
    }

    /// Dump tracked neighbors.
    pub async fn neighbors(&self) -> Result<Vec<NeighborEntry>, SparkError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SparkCommand::GetNeighbors { reply })
            .await
            .map_err(|_| SparkError::ActorGone)?;
        rx.await.map_err(|_| SparkError::ActorGone)
    }

    /// Graceful stop: announce restart on every interface, then exit.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SparkCommand::Stop { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
