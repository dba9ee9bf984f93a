//! Packet transport abstraction for discovery.
//!
//! The state machine is written against [`PacketIo`] so tests can run whole
//! multi-node topologies in-process. The real UDP transport lives in
//! [`crate::udp`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One received datagram with its ancillary data.
#[derive(Debug, Clone)]
pub struct RecvPacket {
    pub data: Vec<u8>,
    /// Arrival interface.
    pub if_index: u32,
    pub src: Ipv6Addr,
    pub hop_limit: u8,
    /// Kernel receive timestamp, microseconds.
    pub recv_time_us: i64,
}

/// Multicast datagram transport bound to the discovery port.
#[async_trait]
pub trait PacketIo: Send + 'static {
    /// Receive the next datagram.
    async fn recv(&mut self) -> io::Result<RecvPacket>;

    /// Multicast `payload` to the discovery group out of `if_index`.
    async fn send(&mut self, if_index: u32, payload: &[u8]) -> io::Result<usize>;

    fn join_multicast(&mut self, if_index: u32) -> io::Result<()>;

    fn leave_multicast(&mut self, if_index: u32) -> io::Result<()>;

    /// Current time in microseconds, on the same clock that stamps
    /// [`RecvPacket::recv_time_us`].
    fn now_us(&self) -> i64;
}

// ---------------------------------------------------------------------------
// Simulated transport
// ---------------------------------------------------------------------------

struct SimEndpoint {
    tx: mpsc::UnboundedSender<RecvPacket>,
    joined: HashSet<u32>,
    /// Hop limit stamped on this endpoint's outgoing packets. Tests lower it
    /// to simulate off-link spoofing.
    hop_limit: u8,
    src: Ipv6Addr,
}

#[derive(Default)]
struct SimInner {
    endpoints: Vec<SimEndpoint>,
    /// Each link is the set of (endpoint, ifIndex) attachments sharing it.
    links: Vec<Vec<(usize, u32)>>,
}

/// An in-process broadcast network connecting [`SimPacketIo`] endpoints.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimInner>>,
    epoch: Instant,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner::default())),
            epoch: Instant::now(),
        }
    }

    /// Create a new endpoint (one per simulated node).
    pub fn io(&self) -> SimPacketIo {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("sim lock");
        let id = inner.endpoints.len();
        inner.endpoints.push(SimEndpoint {
            tx,
            joined: HashSet::new(),
            hop_limit: spindle_common::SPARK_HOP_LIMIT,
            src: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, (id + 1) as u16),
        });
        SimPacketIo {
            id,
            rx,
            inner: self.inner.clone(),
            epoch: self.epoch,
        }
    }

    /// Attach `a`'s interface `a_if` and `b`'s interface `b_if` to a shared
    /// link.
    pub fn connect(&self, a: &SimPacketIo, a_if: u32, b: &SimPacketIo, b_if: u32) {
        let mut inner = self.inner.lock().expect("sim lock");
        inner.links.push(vec![(a.id, a_if), (b.id, b_if)]);
    }

    /// Lower the hop limit of an endpoint's outgoing packets.
    pub fn set_hop_limit(&self, io: &SimPacketIo, hop_limit: u8) {
        let mut inner = self.inner.lock().expect("sim lock");
        inner.endpoints[io.id].hop_limit = hop_limit;
    }

    /// Detach every link touching `io`, simulating a cable pull.
    pub fn isolate(&self, io: &SimPacketIo) {
        let mut inner = self.inner.lock().expect("sim lock");
        for link in &mut inner.links {
            link.retain(|(ep, _)| *ep != io.id);
        }
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint half used as the [`PacketIo`] of one simulated node.
pub struct SimPacketIo {
    id: usize,
    rx: mpsc::UnboundedReceiver<RecvPacket>,
    inner: Arc<Mutex<SimInner>>,
    epoch: Instant,
}

#[async_trait]
impl PacketIo for SimPacketIo {
    async fn recv(&mut self) -> io::Result<RecvPacket> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sim network closed"))
    }

    async fn send(&mut self, if_index: u32, payload: &[u8]) -> io::Result<usize> {
        let now_us = self.now_us();
        let inner = self.inner.lock().expect("sim lock");
        let hop_limit = inner.endpoints[self.id].hop_limit;
        let src = inner.endpoints[self.id].src;

        for link in &inner.links {
            if !link.contains(&(self.id, if_index)) {
                continue;
            }
            for &(peer, peer_if) in link {
                if peer == self.id {
                    continue;
                }
                let endpoint = &inner.endpoints[peer];
                if !endpoint.joined.contains(&peer_if) {
                    continue;
                }
                let _ = endpoint.tx.send(RecvPacket {
                    data: payload.to_vec(),
                    if_index: peer_if,
                    src,
                    hop_limit,
                    recv_time_us: now_us,
                });
            }
        }
        Ok(payload.len())
    }

    fn join_multicast(&mut self, if_index: u32) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("sim lock");
        inner.endpoints[self.id].joined.insert(if_index);
        Ok(())
    }

    fn leave_multicast(&mut self, if_index: u32) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("sim lock");
        inner.endpoints[self.id].joined.remove(&if_index);
        Ok(())
    }

    fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
}
