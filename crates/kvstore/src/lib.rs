//! spindle-kvstore: the eventually-consistent key-value store with
//! optimized flooding.
//!
//! One actor task owns every area's database, the peer set, the flooding
//! spanning trees, and the TTL reaper. The handle exposes the store
//! operations (SET / GET / DUMP / peers / Dual / subscriptions); peers talk
//! to each other through [`PeerTransport`] with length-prefixed canonical
//! frames.

mod actor;
pub mod dual;
pub mod net;
pub mod store;

pub use dual::SptInfo;
pub use net::{serve_peer_endpoint, MemTransport, PeerTransport, TcpPeerTransport};
pub use store::KvFilters;

use actor::KvStoreActor;
use spindle_codec::{
    Ack, DualMessages, FloodTopoSet, KvMessage, Publication,
};
use spindle_common::{PeerSpec, Value, DEFAULT_AREA};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Runtime parameters of the store actor.
#[derive(Debug, Clone)]
pub struct KvStoreConfig {
    pub node_name: String,
    pub areas: BTreeSet<String>,
    pub enable_flood_optimization: bool,
    /// Whether this node offers itself as a flood root.
    pub is_flood_root: bool,
    /// TTL subtracted from every record on each flood hop, ms.
    pub ttl_decrement_ms: i64,
    pub ttl_reaper_interval: Duration,
    pub db_sync_interval: Duration,
    /// `(burst, msgs_per_sec)` cap on outbound floods; `None` disables.
    pub flood_rate: Option<(u32, u32)>,
    pub filters: Option<KvFilters>,
}

impl KvStoreConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            areas: [DEFAULT_AREA.to_string()].into(),
            enable_flood_optimization: false,
            is_flood_root: false,
            ttl_decrement_ms: 1,
            ttl_reaper_interval: Duration::from_secs(1),
            db_sync_interval: Duration::from_secs(60),
            flood_rate: None,
            filters: None,
        }
    }
}

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("unknown area: {0}")]
    UnknownArea(String),

    #[error("store actor is gone")]
    ActorGone,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] spindle_codec::CodecError),
}

pub(crate) enum KvCommand {
    Merge {
        area: String,
        key_vals: BTreeMap<String, Value>,
        node_ids: Option<Vec<String>>,
        flood_root_id: Option<String>,
        reply: oneshot::Sender<Result<(), KvError>>,
    },
    Get {
        area: String,
        keys: Vec<String>,
        reply: oneshot::Sender<Result<BTreeMap<String, Value>, KvError>>,
    },
    Dump {
        area: String,
        prefix: String,
        originators: Vec<String>,
        known_hashes: Option<BTreeMap<String, u64>>,
        hashes_only: bool,
        reply: oneshot::Sender<Result<BTreeMap<String, Value>, KvError>>,
    },
    AddPeers {
        area: String,
        peers: BTreeMap<String, PeerSpec>,
        reply: oneshot::Sender<Result<(), KvError>>,
    },
    DelPeers {
        area: String,
        names: Vec<String>,
        reply: oneshot::Sender<Result<(), KvError>>,
    },
    GetPeers {
        area: String,
        reply: oneshot::Sender<Result<BTreeMap<String, PeerSpec>, KvError>>,
    },
    ProcessDual {
        area: String,
        messages: DualMessages,
        reply: oneshot::Sender<Result<(), KvError>>,
    },
    UpdateFloodTopoChild {
        request: FloodTopoSet,
        reply: oneshot::Sender<Result<(), KvError>>,
    },
    SptInfos {
        area: String,
        reply: oneshot::Sender<Result<BTreeMap<String, SptInfo>, KvError>>,
    },
    Subscribe {
        snapshot_area: Option<String>,
        reply: oneshot::Sender<(
            Option<Publication>,
            mpsc::UnboundedReceiver<Publication>,
        )>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the store actor.
#[derive(Clone)]
pub struct KvStore {
    cmd_tx: mpsc::Sender<KvCommand>,
}

impl KvStore {
    /// Spawn the store actor over the given peer transport.
    pub fn spawn(
        config: KvStoreConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let handle = Self { cmd_tx };
        let actor = KvStoreActor::new(config, transport, handle.clone(), cmd_rx);
        let join = tokio::spawn(actor.run());
        (handle, join)
    }

    /// Install key-values; higher records win, no-ops succeed silently.
    pub async fn set(
        &self,
        area: &str,
        key_vals: BTreeMap<String, Value>,
        node_ids: Option<Vec<String>>,
    ) -> Result<(), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Merge {
                area: area.to_string(),
                key_vals,
                node_ids,
                flood_root_id: None,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    pub(crate) async fn merge_with_root(
        &self,
        area: &str,
        key_vals: BTreeMap<String, Value>,
        node_ids: Option<Vec<String>>,
        flood_root_id: Option<String>,
    ) -> Result<(), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Merge {
                area: area.to_string(),
                key_vals,
                node_ids,
                flood_root_id,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// The requested keys present locally. Missing keys are simply absent.
    pub async fn get(
        &self,
        area: &str,
        keys: Vec<String>,
    ) -> Result<BTreeMap<String, Value>, KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Get {
                area: area.to_string(),
                keys,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Full or delta dump of an area.
    pub async fn dump(
        &self,
        area: &str,
        prefix: &str,
        originators: Vec<String>,
        known_hashes: Option<BTreeMap<String, u64>>,
    ) -> Result<BTreeMap<String, Value>, KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Dump {
                area: area.to_string(),
                prefix: prefix.to_string(),
                originators,
                known_hashes,
                hashes_only: false,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Like [`dump`](Self::dump) but payloads are stripped, leaving
    /// metadata and hashes.
    pub async fn dump_hashes(
        &self,
        area: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, Value>, KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Dump {
                area: area.to_string(),
                prefix: prefix.to_string(),
                originators: Vec::new(),
                known_hashes: None,
                hashes_only: true,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Add flooding peers; each new peer is brought up to date with a full
    /// sync.
    pub async fn add_peers(
        &self,
        area: &str,
        peers: BTreeMap<String, PeerSpec>,
    ) -> Result<(), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::AddPeers {
                area: area.to_string(),
                peers,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    pub async fn del_peers(&self, area: &str, names: Vec<String>) -> Result<(), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::DelPeers {
                area: area.to_string(),
                names,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    pub async fn get_peers(&self, area: &str) -> Result<BTreeMap<String, PeerSpec>, KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::GetPeers {
                area: area.to_string(),
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Feed spanning-tree messages from a peer.
    pub async fn process_dual(&self, area: &str, messages: DualMessages) -> Result<(), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::ProcessDual {
                area: area.to_string(),
                messages,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Register or unregister a peer as our child on a flooding tree.
    pub async fn update_flood_topo_child(&self, request: FloodTopoSet) -> Result<(), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::UpdateFloodTopoChild { request, reply })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Inspect the flooding spanning trees of an area.
    pub async fn spt_infos(&self, area: &str) -> Result<BTreeMap<String, SptInfo>, KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::SptInfos {
                area: area.to_string(),
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        rx.await.map_err(|_| KvError::ActorGone)?
    }

    /// Subscribe to publications. The stream is infinite and ends only when
    /// the receiver is dropped.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Publication>, KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Subscribe {
                snapshot_area: None,
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        let (_, stream) = rx.await.map_err(|_| KvError::ActorGone)?;
        Ok(stream)
    }

    /// Subscribe, with a full snapshot of `area` as the first element.
    pub async fn subscribe_and_get(
        &self,
        area: &str,
    ) -> Result<(Publication, mpsc::UnboundedReceiver<Publication>), KvError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(KvCommand::Subscribe {
                snapshot_area: Some(area.to_string()),
                reply,
            })
            .await
            .map_err(|_| KvError::ActorGone)?;
        let (snapshot, stream) = rx.await.map_err(|_| KvError::ActorGone)?;
        Ok((snapshot.unwrap_or_default(), stream))
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(KvCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Serve one inbound peer request. Used by the stream server and the
    /// in-process transport.
    pub async fn handle_peer_message(&self, msg: KvMessage) -> KvMessage {
        match msg {
            KvMessage::Set(req) => {
                let area = non_empty_area(req.area);
                match self.set(&area, req.key_vals, req.node_ids).await {
                    Ok(()) => KvMessage::Ack(Ack { ok: true }),
                    Err(e) => {
                        tracing::warn!("peer set rejected: {}", e);
                        KvMessage::Ack(Ack { ok: false })
                    }
                }
            }
            KvMessage::Publication(publication) => {
                let area = non_empty_area(publication.area.unwrap_or_default());
                match self
                    .merge_with_root(
                        &area,
                        publication.key_vals,
                        publication.node_ids,
                        publication.flood_root_id,
                    )
                    .await
                {
                    Ok(()) => KvMessage::Ack(Ack { ok: true }),
                    Err(e) => {
                        tracing::warn!("peer publication rejected: {}", e);
                        KvMessage::Ack(Ack { ok: false })
                    }
                }
            }
            KvMessage::Get(req) => match self.get(&req.area, req.keys).await {
                Ok(key_vals) => KvMessage::Publication(Publication {
                    key_vals,
                    area: Some(req.area),
                    ..Default::default()
                }),
                Err(e) => {
                    tracing::warn!("peer get rejected: {}", e);
                    KvMessage::Ack(Ack { ok: false })
                }
            },
            KvMessage::Dump(req) => {
                let (reply, rx) = oneshot::channel();
                let sent = self
                    .cmd_tx
                    .send(KvCommand::Dump {
                        area: req.area.clone(),
                        prefix: req.prefix,
                        originators: req.originators,
                        known_hashes: req.key_val_hashes,
                        hashes_only: req.hashes_only,
                        reply,
                    })
                    .await;
                let result = match sent {
                    Ok(()) => rx.await.unwrap_or(Err(KvError::ActorGone)),
                    Err(_) => Err(KvError::ActorGone),
                };
                match result {
                    Ok(key_vals) => KvMessage::Publication(Publication {
                        key_vals,
                        area: Some(req.area),
                        ..Default::default()
                    }),
                    Err(e) => {
                        tracing::warn!("peer dump rejected: {}", e);
                        KvMessage::Ack(Ack { ok: false })
                    }
                }
            }
            KvMessage::Dual(dual) => {
                let area = non_empty_area(dual.area.clone());
                match self.process_dual(&area, dual).await {
                    Ok(()) => KvMessage::Ack(Ack { ok: true }),
                    Err(e) => {
                        tracing::warn!("peer dual message rejected: {}", e);
                        KvMessage::Ack(Ack { ok: false })
                    }
                }
            }
            KvMessage::FloodTopoSet(req) => match self.update_flood_topo_child(req).await {
                Ok(()) => KvMessage::Ack(Ack { ok: true }),
                Err(e) => {
                    tracing::warn!("peer flood-topo request rejected: {}", e);
                    KvMessage::Ack(Ack { ok: false })
                }
            },
            KvMessage::Ack(_) => KvMessage::Ack(Ack { ok: false }),
        }
    }
}

fn non_empty_area(area: String) -> String {
    if area.is_empty() {
        DEFAULT_AREA.to_string()
    } else {
        area
    }
}
