//! The store actor: areas, peers, flooding, spanning trees, TTL reaping,
//! and hash-based sync.

use crate::dual::DualState;
use crate::net::PeerTransport;
use crate::store::AreaStore;
use crate::{KvCommand, KvError, KvStore, KvStoreConfig};
use spindle_codec::{
    DualMessages, DumpRequest, FloodTopoSet, KvMessage, Publication,
};
use spindle_common::{PeerSpec, Value};
use spindle_metrics::metrics;
use spindle_runtime::{jitter, TimerWheel, TokenBucket};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Jitter applied to the periodic sync timer so a fabric of nodes does not
/// sync in lockstep.
const SYNC_JITTER_PCT: f64 = 0.1;

#[derive(Debug, Clone)]
enum KvTimer {
    TtlReap,
    DbSync,
    /// Retry floods coalesced while the token bucket was empty.
    FloodFlush { area: String },
}

struct AreaState {
    store: AreaStore,
    peers: BTreeMap<String, PeerSpec>,
    dual: DualState,
}

pub(crate) struct KvStoreActor {
    config: KvStoreConfig,
    transport: Arc<dyn PeerTransport>,
    /// Handle to ourselves, loaned to background sync tasks.
    self_handle: KvStore,
    cmd_rx: mpsc::Receiver<KvCommand>,
    areas: BTreeMap<String, AreaState>,
    subscribers: Vec<mpsc::UnboundedSender<Publication>>,
    timers: TimerWheel<KvTimer>,
    flood_bucket: Option<TokenBucket>,
    /// Coalesced key-values awaiting a token, per area.
    pending_floods: BTreeMap<String, BTreeMap<String, Value>>,
    last_reap: Instant,
}

impl KvStoreActor {
    pub(crate) fn new(
        config: KvStoreConfig,
        transport: Arc<dyn PeerTransport>,
        self_handle: KvStore,
        cmd_rx: mpsc::Receiver<KvCommand>,
    ) -> Self {
        let areas = config
            .areas
            .iter()
            .map(|area| {
                (
                    area.clone(),
                    AreaState {
                        store: AreaStore::new(config.filters.clone()),
                        peers: BTreeMap::new(),
                        dual: DualState::new(config.node_name.clone(), config.is_flood_root),
                    },
                )
            })
            .collect();
        let flood_bucket = config
            .flood_rate
            .map(|(burst, rate)| TokenBucket::new(burst, rate));

        Self {
            config,
            transport,
            self_handle,
            cmd_rx,
            areas,
            subscribers: Vec::new(),
            timers: TimerWheel::new(),
            flood_bucket,
            pending_floods: BTreeMap::new(),
            last_reap: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(
            "key-value store starting for node ({}) with {} area(s)",
            self.config.node_name,
            self.areas.len()
        );
        self.timers
            .schedule(self.config.ttl_reaper_interval, KvTimer::TtlReap);
        self.timers.schedule(
            jitter(self.config.db_sync_interval, SYNC_JITTER_PCT),
            KvTimer::DbSync,
        );

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(KvCommand::Stop { reply }) => {
                        self.timers.clear();
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => return,
                },
                token = self.timers.expired() => self.handle_timer(token),
            }
        }
    }

    fn handle_command(&mut self, cmd: KvCommand) {
        let m = metrics();
        match cmd {
            KvCommand::Merge {
                area,
                key_vals,
                node_ids,
                flood_root_id,
                reply,
            } => {
                m.kv_requests.with_label_values(&["set"]).inc();
                let _timer = spindle_metrics::start_kv_timer("set");
                let result = self.merge_and_flood(&area, key_vals, node_ids, flood_root_id);
                let _ = reply.send(result);
            }
            KvCommand::Get { area, keys, reply } => {
                m.kv_requests.with_label_values(&["get"]).inc();
                let result = self
                    .area(&area)
                    .map(|st| st.store.get(&keys));
                let _ = reply.send(result);
            }
            KvCommand::Dump {
                area,
                prefix,
                originators,
                known_hashes,
                hashes_only,
                reply,
            } => {
                let op = if hashes_only { "dump_hashes" } else { "dump" };
                m.kv_requests.with_label_values(&[op]).inc();
                let result = self.area(&area).map(|st| {
                    st.store
                        .dump(&prefix, &originators, known_hashes.as_ref(), hashes_only)
                });
                let _ = reply.send(result);
            }
            KvCommand::AddPeers { area, peers, reply } => {
                m.kv_requests.with_label_values(&["add_peers"]).inc();
                let result = self.add_peers(&area, peers);
                let _ = reply.send(result);
            }
            KvCommand::DelPeers { area, names, reply } => {
                m.kv_requests.with_label_values(&["del_peers"]).inc();
                let result = self.del_peers(&area, names);
                let _ = reply.send(result);
            }
            KvCommand::GetPeers { area, reply } => {
                let result = self.area(&area).map(|st| st.peers.clone());
                let _ = reply.send(result);
            }
            KvCommand::ProcessDual {
                area,
                messages,
                reply,
            } => {
                let result = match self.areas.get_mut(&area) {
                    Some(st) => {
                        let out = st.dual.process(&messages.sender_id, &messages.messages);
                        self.dispatch_dual_output(&area, out);
                        Ok(())
                    }
                    None => Err(KvError::UnknownArea(area.clone())),
                };
                let _ = reply.send(result);
            }
            KvCommand::UpdateFloodTopoChild { request, reply } => {
                let result = match self.areas.get_mut(&request.area) {
                    Some(st) => {
                        st.dual
                            .set_child(&request.root_id, &request.child, request.set_child);
                        Ok(())
                    }
                    None => Err(KvError::UnknownArea(request.area.clone())),
                };
                let _ = reply.send(result);
            }
            KvCommand::SptInfos { area, reply } => {
                let result = self.area(&area).map(|st| st.dual.spt_infos());
                let _ = reply.send(result);
            }
            KvCommand::Subscribe {
                snapshot_area,
                reply,
            } => {
                let snapshot = snapshot_area.and_then(|area| {
                    self.area(&area).ok().map(|st| Publication {
                        key_vals: st.store.dump("", &[], None, false),
                        area: Some(area),
                        ..Default::default()
                    })
                });
                let (tx, rx) = mpsc::unbounded_channel();
                self.subscribers.push(tx);
                let _ = reply.send((snapshot, rx));
            }
            KvCommand::Stop { .. } => unreachable!("handled in run()"),
        }
    }

    fn handle_timer(&mut self, token: KvTimer) {
        match token {
            KvTimer::TtlReap => {
                let elapsed_ms = self.last_reap.elapsed().as_millis() as i64;
                self.last_reap = Instant::now();
                let mut expirations = Vec::new();
                for (area, st) in &mut self.areas {
                    let expired = st.store.expire_tick(elapsed_ms);
                    if !expired.is_empty() {
                        expirations.push((area.clone(), expired));
                    }
                }
                for (area, expired_keys) in expirations {
                    tracing::debug!(
                        "reaped {} expired key(s) in area ({})",
                        expired_keys.len(),
                        area
                    );
                    self.publish(Publication {
                        expired_keys,
                        area: Some(area),
                        ..Default::default()
                    });
                }
                self.timers
                    .schedule(self.config.ttl_reaper_interval, KvTimer::TtlReap);
            }

            KvTimer::DbSync => {
                for (area, st) in &self.areas {
                    for (peer_name, peer) in &st.peers {
                        self.spawn_sync(area, peer_name, peer);
                    }
                }
                self.timers.schedule(
                    jitter(self.config.db_sync_interval, SYNC_JITTER_PCT),
                    KvTimer::DbSync,
                );
            }

            KvTimer::FloodFlush { area } => {
                let Some(pending) = self.pending_floods.remove(&area) else {
                    return;
                };
                if pending.is_empty() {
                    return;
                }
                let node_ids = vec![self.config.node_name.clone()];
                let root = self.chosen_flood_root(&area, None);
                self.flood(&area, pending, node_ids, root);
            }
        }
    }

    fn area(&self, area: &str) -> Result<&AreaState, KvError> {
        self.areas
            .get(area)
            .ok_or_else(|| KvError::UnknownArea(area.to_string()))
    }

    fn chosen_flood_root(&self, area: &str, received: Option<String>) -> Option<String> {
        if let Some(root) = received {
            return Some(root);
        }
        if !self.config.enable_flood_optimization {
            return None;
        }
        self.areas.get(area).and_then(|st| st.dual.current_root())
    }

    // -----------------------------------------------------------------------
    // Merge + flood
    // -----------------------------------------------------------------------

    fn merge_and_flood(
        &mut self,
        area: &str,
        key_vals: BTreeMap<String, Value>,
        node_ids: Option<Vec<String>>,
        flood_root_id: Option<String>,
    ) -> Result<(), KvError> {
        let updates = {
            let st = self
                .areas
                .get_mut(area)
                .ok_or_else(|| KvError::UnknownArea(area.to_string()))?;
            st.store.merge(key_vals)
        };
        if updates.is_empty() {
            return Ok(());
        }

        let root = self.chosen_flood_root(area, flood_root_id);

        self.publish(Publication {
            key_vals: updates.clone(),
            area: Some(area.to_string()),
            flood_root_id: root.clone(),
            ..Default::default()
        });

        let mut visited = node_ids.unwrap_or_default();
        if visited.contains(&self.config.node_name) {
            // This publication already went through us once.
            metrics().flood_suppressed.inc();
            return Ok(());
        }
        visited.push(self.config.node_name.clone());
        self.flood(area, updates, visited, root);
        Ok(())
    }

    /// Forward changed records to the selected peers, honoring the rate cap.
    fn flood(
        &mut self,
        area: &str,
        key_vals: BTreeMap<String, Value>,
        node_ids: Vec<String>,
        flood_root_id: Option<String>,
    ) {
        let m = metrics();
        let targets: Vec<(String, PeerSpec)> = {
            let Some(st) = self.areas.get(area) else {
                return;
            };
            if st.peers.is_empty() {
                return;
            }

            // The spanning tree constrains only peers that participate in
            // it; everyone else always gets the full flood.
            let tree = flood_root_id
                .as_deref()
                .and_then(|root| st.dual.flood_peers(root, None));

            st.peers
                .iter()
                .filter(|(name, _)| !node_ids.contains(*name))
                .filter(|(name, spec)| match (&tree, spec.supports_flood_optimization) {
                    (Some(tree), true) => tree.contains(name.as_str()),
                    _ => true,
                })
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect()
        };
        let peer_count = self.areas[area].peers.len();
        m.flood_suppressed
            .inc_by((peer_count - targets.len()) as u64);
        if targets.is_empty() {
            return;
        }

        if let Some(bucket) = &mut self.flood_bucket {
            if !bucket.try_consume() {
                m.flood_rate_limited.inc();
                let pending = self.pending_floods.entry(area.to_string()).or_default();
                for (key, value) in key_vals {
                    pending.insert(key, value);
                }
                let delay = bucket.time_until_available();
                self.timers.schedule(
                    delay.max(Duration::from_millis(1)),
                    KvTimer::FloodFlush {
                        area: area.to_string(),
                    },
                );
                return;
            }
        }

        // Every hop costs a record part of its lifetime.
        let mut out_kv = key_vals;
        out_kv.retain(|_, value| {
            if !value.has_infinite_ttl() {
                value.ttl_ms -= self.config.ttl_decrement_ms;
            }
            value.has_infinite_ttl() || value.ttl_ms > 0
        });
        if out_kv.is_empty() {
            return;
        }

        let publication = Publication {
            key_vals: out_kv,
            area: Some(area.to_string()),
            flood_root_id,
            node_ids: Some(node_ids),
            ..Default::default()
        };
        for (peer_name, spec) in targets {
            let transport = self.transport.clone();
            let msg = KvMessage::Publication(publication.clone());
            m.flood_publications_sent.inc();
            tokio::spawn(async move {
                if let Err(e) = transport.request(&spec.cmd_url, msg).await {
                    tracing::warn!("flood to peer ({}) failed: {}", peer_name, e);
                }
            });
        }
    }

    /// Deliver a publication to every live subscriber; dropped receivers
    /// are pruned on the spot.
    fn publish(&mut self, publication: Publication) {
        self.subscribers
            .retain(|tx| tx.send(publication.clone()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    fn add_peers(
        &mut self,
        area: &str,
        peers: BTreeMap<String, PeerSpec>,
    ) -> Result<(), KvError> {
        let mut outputs = Vec::new();
        {
            let st = self
                .areas
                .get_mut(area)
                .ok_or_else(|| KvError::UnknownArea(area.to_string()))?;
            for (name, spec) in &peers {
                tracing::info!("adding peer ({}) at {} in area ({})", name, spec.cmd_url, area);
                st.peers.insert(name.clone(), spec.clone());
                if spec.supports_flood_optimization {
                    outputs.push(st.dual.peer_up(name));
                }
            }
        }
        for out in outputs {
            self.dispatch_dual_output(area, out);
        }
        // Bring the new peers up to date right away.
        for (name, spec) in &peers {
            self.spawn_sync(area, name, spec);
        }
        Ok(())
    }

    fn del_peers(&mut self, area: &str, names: Vec<String>) -> Result<(), KvError> {
        let mut outputs = Vec::new();
        {
            let st = self
                .areas
                .get_mut(area)
                .ok_or_else(|| KvError::UnknownArea(area.to_string()))?;
            for name in &names {
                if st.peers.remove(name).is_some() {
                    tracing::info!("removing peer ({}) from area ({})", name, area);
                    outputs.push(st.dual.peer_down(name));
                }
            }
        }
        for out in outputs {
            self.dispatch_dual_output(area, out);
        }
        Ok(())
    }

    fn dispatch_dual_output(&mut self, area: &str, out: crate::dual::DualOutput) {
        if out.is_empty() {
            return;
        }
        let Some(st) = self.areas.get(area) else {
            return;
        };
        for (peer, messages) in out.messages {
            let Some(spec) = st.peers.get(&peer) else {
                continue;
            };
            let msg = KvMessage::Dual(DualMessages {
                sender_id: self.config.node_name.clone(),
                area: area.to_string(),
                messages,
            });
            let transport = self.transport.clone();
            let url = spec.cmd_url.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.request(&url, msg).await {
                    tracing::warn!("dual message to ({}) failed: {}", peer, e);
                }
            });
        }
        for (parent, root, set_child) in out.child_changes {
            let Some(spec) = st.peers.get(&parent) else {
                continue;
            };
            let msg = KvMessage::FloodTopoSet(FloodTopoSet {
                area: area.to_string(),
                root_id: root,
                child: self.config.node_name.clone(),
                set_child,
            });
            let transport = self.transport.clone();
            let url = spec.cmd_url.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.request(&url, msg).await {
                    tracing::warn!("flood-topo update to ({}) failed: {}", parent, e);
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    fn spawn_sync(&self, area: &str, peer_name: &str, peer: &PeerSpec) {
        let transport = self.transport.clone();
        let store = self.self_handle.clone();
        let area = area.to_string();
        let peer_name = peer_name.to_string();
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = sync_with_peer(transport, store, area, peer_name.clone(), peer).await {
                tracing::warn!("sync with peer ({}) failed: {}", peer_name, e);
            }
        });
    }
}

/// Hash-compare with one peer and fetch only the differing keys.
async fn sync_with_peer(
    transport: Arc<dyn PeerTransport>,
    store: KvStore,
    area: String,
    peer_name: String,
    peer: PeerSpec,
) -> Result<(), KvError> {
    metrics().sync_rounds.inc();

    let request = KvMessage::Dump(DumpRequest {
        area: area.clone(),
        prefix: String::new(),
        originators: Vec::new(),
        key_val_hashes: None,
        hashes_only: true,
    });
    let KvMessage::Publication(remote) = transport.request(&peer.cmd_url, request).await? else {
        return Err(KvError::Transport(format!(
            "peer ({}) rejected hash dump",
            peer_name
        )));
    };

    let local = store.dump_hashes(&area, "").await?;
    let in_sync = remote.key_vals.iter().all(|(key, value)| {
        local
            .get(key)
            .is_some_and(|l| l.hash_or_compute() == value.hash_or_compute())
    });
    if in_sync {
        return Ok(());
    }

    // Ask for exactly the keys whose hashes disagree with ours.
    let local_hashes: BTreeMap<String, u64> = local
        .iter()
        .map(|(key, value)| (key.clone(), value.hash_or_compute()))
        .collect();
    let request = KvMessage::Dump(DumpRequest {
        area: area.clone(),
        prefix: String::new(),
        originators: Vec::new(),
        key_val_hashes: Some(local_hashes),
        hashes_only: false,
    });
    let KvMessage::Publication(delta) = transport.request(&peer.cmd_url, request).await? else {
        return Err(KvError::Transport(format!(
            "peer ({}) rejected delta dump",
            peer_name
        )));
    };

    if delta.key_vals.is_empty() {
        return Ok(());
    }
    metrics().sync_delta_keys.inc_by(delta.key_vals.len() as u64);
    tracing::info!(
        "synced {} key(s) from peer ({}) in area ({})",
        delta.key_vals.len(),
        peer_name,
        area
    );
    store
        .set(&area, delta.key_vals, Some(vec![peer_name]))
        .await
}
