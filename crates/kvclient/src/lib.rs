//! spindle-kvclient: per-key persistence on top of the key-value store.
//!
//! The client owns the lifecycle of locally originated keys: it advertises
//! them with exponential backoff, re-advertises with a higher version when
//! someone else overwrites them, schedules TTL refreshes so persisted keys
//! never expire, and invokes subscription callbacks on change. All state
//! lives in one actor task; callbacks run on that task and must not block.

mod actor;

use actor::ClientActor;
use spindle_common::Value;
use spindle_kvstore::{KvError, KvStore};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Callback invoked with the key and its new record; `None` marks expiry.
pub type KeyCallback = Box<dyn Fn(&str, Option<&Value>) + Send>;

/// Hook invoked with an area's full persisted map after every change, for
/// crash-recovery serialization to an external config store.
pub type PersistenceHook = Box<dyn Fn(&str, &HashMap<String, Value>) + Send>;

/// Runtime parameters of the client actor.
#[derive(Debug, Clone)]
pub struct KvClientConfig {
    pub node_name: String,
    /// Period of the persisted-key auditor; `None` disables it.
    pub check_persist_key_interval: Option<Duration>,
    /// First advertise retry delay.
    pub initial_backoff: Duration,
    /// Advertise retry delay cap.
    pub max_backoff: Duration,
}

impl KvClientConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            check_persist_key_interval: None,
            initial_backoff: Duration::from_millis(64),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client actor is gone")]
    ActorGone,

    #[error(transparent)]
    Store(#[from] KvError),
}

/// A prefix + originator filter for subscription callbacks.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub prefixes: Vec<String>,
    pub originator_ids: Vec<String>,
}

impl KeyFilter {
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        let prefix_ok =
            self.prefixes.is_empty() || self.prefixes.iter().any(|p| key.starts_with(p));
        let originator_ok = self.originator_ids.is_empty()
            || self.originator_ids.contains(&value.originator_id);
        prefix_ok && originator_ok
    }
}

pub(crate) enum ClientCommand {
    PersistKey {
        area: String,
        key: String,
        value: Vec<u8>,
        ttl_ms: i64,
        reply: oneshot::Sender<Result<bool, ClientError>>,
    },
    SetKey {
        area: String,
        key: String,
        value: Vec<u8>,
        /// 0 derives one version above whatever the store holds.
        version: u64,
        ttl_ms: i64,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    UnsetKey {
        area: String,
        key: String,
        reply: oneshot::Sender<()>,
    },
    ClearKey {
        area: String,
        key: String,
        value: Vec<u8>,
        ttl_ms: i64,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    GetKey {
        area: String,
        key: String,
        reply: oneshot::Sender<Result<Option<Value>, ClientError>>,
    },
    SubscribeKey {
        key: String,
        callback: KeyCallback,
        fetch_value: bool,
        area: String,
        reply: oneshot::Sender<Result<Option<Value>, ClientError>>,
    },
    UnsubscribeKey {
        key: String,
    },
    SubscribeFilter {
        filter: KeyFilter,
        callback: KeyCallback,
    },
    UnsubscribeFilter,
    SetGlobalCallback {
        callback: Option<KeyCallback>,
    },
    SetPersistenceHook {
        hook: Option<PersistenceHook>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the client actor.
#[derive(Clone)]
pub struct KvStoreClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl KvStoreClient {
    /// Spawn the client over a store handle. The client subscribes to the
    /// store's publications immediately.
    pub fn spawn(config: KvClientConfig, store: KvStore) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let join = tokio::spawn(ClientActor::run(config, store, cmd_rx));
        (Self { cmd_tx }, join)
    }

    /// Keep `key = value` advertised in the store for as long as this
    /// client lives. Returns whether anything changed.
    pub async fn persist_key(
        &self,
        area: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl_ms: i64,
    ) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::PersistKey {
                area: area.to_string(),
                key: key.to_string(),
                value: value.into(),
                ttl_ms,
                reply,
            })
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// One-shot advertisement: no persistence, but TTL refreshes are still
    /// scheduled. `version == 0` derives one above the store's record.
    pub async fn set_key(
        &self,
        area: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        version: u64,
        ttl_ms: i64,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::SetKey {
                area: area.to_string(),
                key: key.to_string(),
                value: value.into(),
                version,
                ttl_ms,
                reply,
            })
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Stop persisting and refreshing `key`. The store keeps the record
    /// until its TTL runs out.
    pub async fn unset_key(&self, area: &str, key: &str) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::UnsetKey {
                area: area.to_string(),
                key: key.to_string(),
                reply,
            })
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)
    }

    /// Stop persisting `key` and overwrite it cluster-wide with `value` at
    /// a higher version.
    pub async fn clear_key(
        &self,
        area: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl_ms: i64,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::ClearKey {
                area: area.to_string(),
                key: key.to_string(),
                value: value.into(),
                ttl_ms,
                reply,
            })
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Fetch one key from the store.
    pub async fn get_key(&self, area: &str, key: &str) -> Result<Option<Value>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::GetKey {
                area: area.to_string(),
                key: key.to_string(),
                reply,
            })
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Register a callback for one key. With `fetch_value`, the current
    /// record is returned.
    pub async fn subscribe_key(
        &self,
        area: &str,
        key: &str,
        callback: KeyCallback,
        fetch_value: bool,
    ) -> Result<Option<Value>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::SubscribeKey {
                key: key.to_string(),
                callback,
                fetch_value,
                area: area.to_string(),
                reply,
            })
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    pub async fn unsubscribe_key(&self, key: &str) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::UnsubscribeKey {
                key: key.to_string(),
            })
            .await
            .map_err(|_| ClientError::ActorGone)
    }

    /// Register a prefix + originator filter callback.
    pub async fn subscribe_key_filter(
        &self,
        filter: KeyFilter,
        callback: KeyCallback,
    ) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::SubscribeFilter { filter, callback })
            .await
            .map_err(|_| ClientError::ActorGone)
    }

    pub async fn unsubscribe_key_filter(&self) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::UnsubscribeFilter)
            .await
            .map_err(|_| ClientError::ActorGone)
    }

    /// Register a catch-all callback fired for every received record.
    pub async fn set_kv_callback(&self, callback: Option<KeyCallback>) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::SetGlobalCallback { callback })
            .await
            .map_err(|_| ClientError::ActorGone)
    }

    /// Register the crash-recovery serialization hook.
    pub async fn set_persistence_hook(
        &self,
        hook: Option<PersistenceHook>,
    ) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::SetPersistenceHook { hook })
            .await
            .map_err(|_| ClientError::ActorGone)
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ClientCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
