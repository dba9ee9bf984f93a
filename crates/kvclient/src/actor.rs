//! The client actor: persisted keys, advertise queue, TTL refresh
//! scheduler, and publication processing.

use crate::{ClientCommand, ClientError, KeyCallback, KeyFilter, KvClientConfig, PersistenceHook};
use spindle_codec::Publication;
use spindle_common::{Value, DEFAULT_AREA, TTL_INFINITY};
use spindle_kvstore::KvStore;
use spindle_metrics::metrics;
use spindle_runtime::{ExponentialBackoff, TimerId, TimerWheel};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Ceiling on how far out the TTL-refresh timer may be pushed.
const MAX_TTL_UPDATE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
enum ClientTimer {
    Advertise,
    TtlAdvert,
    Audit,
}

struct TtlEntry {
    /// Value-less record advertised on refresh; its ttlVersion is bumped
    /// before every send.
    template: Value,
    /// Paces refreshes at roughly ttl/4.
    pacer: ExponentialBackoff,
}

pub(crate) struct ClientActor {
    config: KvClientConfig,
    store: KvStore,
    /// area -> key -> the record we keep advertised.
    persisted: HashMap<String, HashMap<String, Value>>,
    keys_to_advertise: HashMap<String, BTreeSet<String>>,
    backoffs: HashMap<String, ExponentialBackoff>,
    ttl_entries: HashMap<String, HashMap<String, TtlEntry>>,
    key_callbacks: HashMap<String, KeyCallback>,
    filter_callback: Option<(KeyFilter, KeyCallback)>,
    global_callback: Option<KeyCallback>,
    persistence_hook: Option<PersistenceHook>,
    timers: TimerWheel<ClientTimer>,
    advertise_timer: Option<TimerId>,
    ttl_timer: Option<TimerId>,
}

impl ClientActor {
    pub(crate) async fn run(
        config: KvClientConfig,
        store: KvStore,
        mut cmd_rx: mpsc::Receiver<ClientCommand>,
    ) {
        let mut publications = match store.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("client cannot subscribe to store: {}", e);
                return;
            }
        };

        let mut actor = Self {
            config,
            store,
            persisted: HashMap::new(),
            keys_to_advertise: HashMap::new(),
            backoffs: HashMap::new(),
            ttl_entries: HashMap::new(),
            key_callbacks: HashMap::new(),
            filter_callback: None,
            global_callback: None,
            persistence_hook: None,
            timers: TimerWheel::new(),
            advertise_timer: None,
            ttl_timer: None,
        };
        if let Some(interval) = actor.config.check_persist_key_interval {
            actor.timers.schedule(interval, ClientTimer::Audit);
        }

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(ClientCommand::Stop { reply }) => {
                        actor.timers.clear();
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => actor.handle_command(cmd).await,
                    None => return,
                },
                maybe_pub = publications.recv() => match maybe_pub {
                    Some(publication) => actor.process_publication(publication).await,
                    None => {
                        tracing::warn!("store publication stream closed");
                        return;
                    }
                },
                token = actor.timers.expired() => actor.handle_timer(token).await,
            }
        }
    }

    async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::PersistKey {
                area,
                key,
                value,
                ttl_ms,
                reply,
            } => {
                let result = self.persist_key(area, key, value, ttl_ms).await;
                let _ = reply.send(result);
            }
            ClientCommand::SetKey {
                area,
                key,
                value,
                version,
                ttl_ms,
                reply,
            } => {
                let result = self.set_key(area, key, value, version, ttl_ms).await;
                let _ = reply.send(result);
            }
            ClientCommand::UnsetKey { area, key, reply } => {
                self.unset_key(&area, &key);
                let _ = reply.send(());
            }
            ClientCommand::ClearKey {
                area,
                key,
                value,
                ttl_ms,
                reply,
            } => {
                let result = self.clear_key(area, key, value, ttl_ms).await;
                let _ = reply.send(result);
            }
            ClientCommand::GetKey { area, key, reply } => {
                let result = self
                    .store
                    .get(&area, vec![key.clone()])
                    .await
                    .map(|mut m| m.remove(&key))
                    .map_err(ClientError::from);
                let _ = reply.send(result);
            }
            ClientCommand::SubscribeKey {
                key,
                callback,
                fetch_value,
                area,
                reply,
            } => {
                self.key_callbacks.insert(key.clone(), callback);
                let result = if fetch_value {
                    self.store
                        .get(&area, vec![key.clone()])
                        .await
                        .map(|mut m| m.remove(&key))
                        .map_err(ClientError::from)
                } else {
                    Ok(None)
                };
                let _ = reply.send(result);
            }
            ClientCommand::UnsubscribeKey { key } => {
                if self.key_callbacks.remove(&key).is_none() {
                    tracing::warn!("unsubscribe for unknown key ({})", key);
                }
            }
            ClientCommand::SubscribeFilter { filter, callback } => {
                self.filter_callback = Some((filter, callback));
            }
            ClientCommand::UnsubscribeFilter => {
                self.filter_callback = None;
            }
            ClientCommand::SetGlobalCallback { callback } => {
                self.global_callback = callback;
            }
            ClientCommand::SetPersistenceHook { hook } => {
                self.persistence_hook = hook;
            }
            ClientCommand::Stop { .. } => unreachable!("handled in run()"),
        }
    }

    async fn handle_timer(&mut self, token: ClientTimer) {
        match token {
            ClientTimer::Advertise => {
                self.advertise_timer = None;
                self.advertise_pending().await;
                // Backoffs whose wait passed without a retry reset cleanly.
                for backoff in self.backoffs.values_mut() {
                    if backoff.can_try_now() {
                        backoff.report_success();
                    }
                }
            }
            ClientTimer::TtlAdvert => {
                self.ttl_timer = None;
                self.advertise_ttl_updates().await;
            }
            ClientTimer::Audit => {
                self.check_persisted_keys().await;
                if let Some(interval) = self.config.check_persist_key_interval {
                    self.timers.schedule(interval, ClientTimer::Audit);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    async fn persist_key(
        &mut self,
        area: String,
        key: String,
        value: Vec<u8>,
        ttl_ms: i64,
    ) -> Result<bool, ClientError> {
        let me = self.config.node_name.clone();

        let existing = self.persisted.get(&area).and_then(|m| m.get(&key)).cloned();
        let mut record = match existing {
            Some(existing) => {
                if existing.value.as_deref() == Some(value.as_slice())
                    && existing.ttl_ms == ttl_ms
                {
                    return Ok(false);
                }
                let mut record = existing;
                if let Some(entry) = self.ttl_entries.get(&area).and_then(|m| m.get(&key)) {
                    record.ttl_version = entry.template.ttl_version;
                }
                record
            }
            None => {
                // First persistence of this key: adopt whatever the store
                // already holds as the version baseline.
                match self.store.get(&area, vec![key.clone()]).await {
                    Ok(mut found) => match found.remove(&key) {
                        Some(v) if v.value.is_some() => v,
                        _ => Value {
                            version: 0,
                            originator_id: me.clone(),
                            value: Some(value.clone()),
                            ttl_ms,
                            ttl_version: 0,
                            hash: None,
                        },
                    },
                    Err(e) => {
                        tracing::warn!("store probe for ({}) failed: {}", key, e);
                        Value {
                            version: 0,
                            originator_id: me.clone(),
                            value: Some(value.clone()),
                            ttl_ms,
                            ttl_version: 0,
                            hash: None,
                        }
                    }
                }
            }
        };

        let mut value_changed = false;
        if record.version == 0 {
            record.version = 1;
            value_changed = true;
        } else if record.originator_id != me || record.value.as_deref() != Some(value.as_slice())
        {
            record.version += 1;
            record.ttl_version = 0;
            value_changed = true;
        }
        record.originator_id = me;
        record.value = Some(value);
        let ttl_changed = record.ttl_ms != ttl_ms;
        record.ttl_ms = ttl_ms;
        record.hash = Some(record.compute_hash());

        let (version, ttl_version) = (record.version, record.ttl_version);
        self.persisted
            .entry(area.clone())
            .or_default()
            .insert(key.clone(), record.clone());
        self.backoffs.insert(
            key.clone(),
            ExponentialBackoff::new(self.config.initial_backoff, self.config.max_backoff),
        );
        self.run_persistence_hook(&area);

        if value_changed {
            if let Some(cb) = self.key_callbacks.get(&key) {
                cb(&key, Some(&record));
            }
            self.keys_to_advertise
                .entry(area.clone())
                .or_default()
                .insert(key.clone());
        }

        self.advertise_pending().await;
        self.schedule_ttl_updates(&area, &key, version, ttl_version, ttl_ms, ttl_changed)
            .await;
        Ok(value_changed)
    }

    async fn set_key(
        &mut self,
        area: String,
        key: String,
        value: Vec<u8>,
        version: u64,
        ttl_ms: i64,
    ) -> Result<(), ClientError> {
        let version = if version > 0 {
            version
        } else {
            // One above whatever the store holds.
            match self.store.get(&area, vec![key.clone()]).await {
                Ok(found) => found.get(&key).map_or(1, |v| v.version + 1),
                Err(_) => 1,
            }
        };
        let record = Value::new(version, self.config.node_name.clone(), Some(value), ttl_ms, 0);

        self.store
            .set(&area, [(key.clone(), record)].into(), None)
            .await?;
        metrics().client_keys_advertised.inc();
        self.schedule_ttl_updates(&area, &key, version, 0, ttl_ms, false)
            .await;
        Ok(())
    }

    fn unset_key(&mut self, area: &str, key: &str) {
        if let Some(map) = self.persisted.get_mut(area) {
            map.remove(key);
        }
        self.backoffs.remove(key);
        if let Some(map) = self.ttl_entries.get_mut(area) {
            map.remove(key);
        }
        if let Some(set) = self.keys_to_advertise.get_mut(area) {
            set.remove(key);
        }
        self.run_persistence_hook(area);
    }

    async fn clear_key(
        &mut self,
        area: String,
        key: String,
        value: Vec<u8>,
        ttl_ms: i64,
    ) -> Result<(), ClientError> {
        self.unset_key(&area, &key);

        // Nothing to overwrite if the store never saw the key.
        let Some(mut record) = self
            .store
            .get(&area, vec![key.clone()])
            .await?
            .remove(&key)
        else {
            return Ok(());
        };
        record.originator_id = self.config.node_name.clone();
        record.version += 1;
        record.ttl_ms = ttl_ms;
        record.ttl_version = 0;
        record.value = Some(value);
        record.hash = Some(record.compute_hash());

        self.store
            .set(&area, [(key, record)].into(), None)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Advertisement
    // -----------------------------------------------------------------------

    /// Drain the advertise queue for every key whose backoff permits; the
    /// rest set the next timer.
    async fn advertise_pending(&mut self) {
        let mut timeout = self.config.max_backoff;
        let areas: Vec<String> = self.keys_to_advertise.keys().cloned().collect();

        for area in areas {
            let keys: Vec<String> = self.keys_to_advertise[&area].iter().cloned().collect();
            let mut key_vals = BTreeMap::new();
            let mut advertised = Vec::new();

            for key in keys {
                let Some(record) = self.persisted.get(&area).and_then(|m| m.get(&key)).cloned()
                else {
                    self.keys_to_advertise
                        .get_mut(&area)
                        .expect("area present")
                        .remove(&key);
                    continue;
                };
                let backoff = self.backoffs.entry(key.clone()).or_insert_with(|| {
                    ExponentialBackoff::new(self.config.initial_backoff, self.config.max_backoff)
                });
                if !backoff.can_try_now() {
                    timeout = timeout.min(backoff.time_remaining_until_retry());
                    continue;
                }
                backoff.report_error();
                timeout = timeout.min(backoff.time_remaining_until_retry());
                tracing::debug!(
                    "advertising ({}, version {}, ttlVersion {}) in area ({})",
                    key,
                    record.version,
                    record.ttl_version,
                    area
                );
                key_vals.insert(key.clone(), record);
                advertised.push(key);
            }

            if key_vals.is_empty() {
                continue;
            }
            match self.store.set(&area, key_vals, None).await {
                Ok(()) => {
                    metrics()
                        .client_keys_advertised
                        .inc_by(advertised.len() as u64);
                    let set = self
                        .keys_to_advertise
                        .get_mut(&area)
                        .expect("area present");
                    for key in advertised {
                        set.remove(&key);
                    }
                }
                Err(e) => {
                    tracing::warn!("failed advertising keys to store: {}", e);
                }
            }
        }

        if let Some(id) = self.advertise_timer.take() {
            self.timers.cancel(id);
        }
        self.advertise_timer = Some(self.timers.schedule(timeout, ClientTimer::Advertise));
    }

    /// Create or replace the refresh entry for a key. A refresh goes out
    /// roughly every ttl/4, so a record is renewed about twice before it
    /// could expire.
    async fn schedule_ttl_updates(
        &mut self,
        area: &str,
        key: &str,
        version: u64,
        ttl_version: u64,
        ttl_ms: i64,
        advertise_immediately: bool,
    ) {
        let entries = self.ttl_entries.entry(area.to_string()).or_default();
        if ttl_ms == TTL_INFINITY {
            entries.remove(key);
            return;
        }

        let quarter = Duration::from_millis((ttl_ms / 4).max(1) as u64);
        let mut pacer = ExponentialBackoff::new(quarter, quarter + Duration::from_millis(1));
        if !advertise_immediately {
            // The full record just went out; the first refresh can wait.
            pacer.report_error();
        }
        let template = Value {
            version,
            originator_id: self.config.node_name.clone(),
            value: None,
            ttl_ms,
            ttl_version,
            hash: None,
        };
        entries.insert(key.to_string(), TtlEntry { template, pacer });

        self.advertise_ttl_updates().await;
    }

    /// Send value-less refresh records for every due key.
    async fn advertise_ttl_updates(&mut self) {
        let mut timeout = MAX_TTL_UPDATE_INTERVAL;
        let areas: Vec<String> = self.ttl_entries.keys().cloned().collect();

        for area in areas {
            let keys: Vec<String> = self.ttl_entries[&area].keys().cloned().collect();
            let mut key_vals = BTreeMap::new();

            for key in keys {
                let persisted_meta = self
                    .persisted
                    .get(&area)
                    .and_then(|m| m.get(&key))
                    .map(|p| (p.version, p.ttl_version));
                let entry = self
                    .ttl_entries
                    .get_mut(&area)
                    .and_then(|m| m.get_mut(&key))
                    .expect("key listed");

                if !entry.pacer.can_try_now() {
                    timeout = timeout.min(entry.pacer.time_remaining_until_retry());
                    continue;
                }
                entry.pacer.report_error();
                timeout = timeout.min(entry.pacer.time_remaining_until_retry());

                // The persisted record may have moved on.
                if let Some((version, ttl_version)) = persisted_meta {
                    if entry.template.version < version {
                        entry.template.version = version;
                        entry.template.ttl_version = ttl_version;
                    }
                }
                entry.template.ttl_version += 1;
                key_vals.insert(key, entry.template.clone());
            }

            if key_vals.is_empty() {
                continue;
            }
            metrics()
                .client_ttl_updates_sent
                .inc_by(key_vals.len() as u64);
            if let Err(e) = self.store.set(&area, key_vals, None).await {
                tracing::warn!("failed advertising ttl updates: {}", e);
            }
        }

        if let Some(id) = self.ttl_timer.take() {
            self.timers.cancel(id);
        }
        self.ttl_timer = Some(self.timers.schedule(timeout, ClientTimer::TtlAdvert));
    }

    /// The auditor: any persisted key the store lost is queued again.
    async fn check_persisted_keys(&mut self) {
        let areas: Vec<String> = self.persisted.keys().cloned().collect();
        for area in areas {
            let keys: Vec<String> = self.persisted[&area].keys().cloned().collect();
            if keys.is_empty() {
                continue;
            }
            match self.store.get(&area, keys.clone()).await {
                Ok(present) => {
                    let missing: Vec<String> = keys
                        .into_iter()
                        .filter(|key| !present.contains_key(key))
                        .collect();
                    if missing.is_empty() {
                        continue;
                    }
                    tracing::warn!(
                        "{} persisted key(s) missing from store in area ({}), re-advertising",
                        missing.len(),
                        area
                    );
                    let set = self.keys_to_advertise.entry(area.clone()).or_default();
                    for key in missing {
                        set.insert(key);
                    }
                }
                Err(e) => {
                    tracing::warn!("persisted-key audit failed: {}", e);
                }
            }
        }
        self.advertise_pending().await;
    }

    // -----------------------------------------------------------------------
    // Publications
    // -----------------------------------------------------------------------

    async fn process_publication(&mut self, publication: Publication) {
        let area = publication
            .area
            .clone()
            .unwrap_or_else(|| DEFAULT_AREA.to_string());
        let me = self.config.node_name.clone();
        let mut persisted_changed = false;

        for (key, rcvd) in &publication.key_vals {
            if rcvd.value.is_none() {
                // TTL updates carry nothing we track here.
                continue;
            }
            if let Some(cb) = &self.global_callback {
                cb(key, Some(rcvd));
            }

            let is_persisted = self
                .persisted
                .get(&area)
                .is_some_and(|m| m.contains_key(key));

            if !is_persisted {
                // One-shot set keys: keep or drop the refresh entry.
                let mut drop_entry = false;
                if let Some(entry) =
                    self.ttl_entries.get_mut(&area).and_then(|m| m.get_mut(key))
                {
                    let template = &mut entry.template;
                    if rcvd.version > template.version
                        || (rcvd.version == template.version
                            && rcvd.originator_id > template.originator_id)
                    {
                        // Key lost to a better record; stop refreshing.
                        drop_entry = true;
                    } else if rcvd.version == template.version
                        && rcvd.originator_id == template.originator_id
                        && rcvd.ttl_version > template.ttl_version
                    {
                        template.ttl_version = rcvd.ttl_version;
                    }
                }
                if drop_entry {
                    self.ttl_entries
                        .get_mut(&area)
                        .expect("area present")
                        .remove(key);
                }
                if let Some(cb) = self.key_callbacks.get(key) {
                    cb(key, Some(rcvd));
                }
                if let Some((filter, cb)) = &self.filter_callback {
                    if filter.matches(key, rcvd) {
                        cb(key, Some(rcvd));
                    }
                }
                continue;
            }

            // Persisted key: anything that disagrees gets overridden with a
            // strictly higher version.
            let mut updated: Option<Value> = None;
            {
                let cur = self
                    .persisted
                    .get_mut(&area)
                    .and_then(|m| m.get_mut(key))
                    .expect("checked above");
                if cur.version > rcvd.version {
                    continue;
                }

                let mut value_changed = false;
                if cur.version < rcvd.version {
                    cur.originator_id = me.clone();
                    cur.version = rcvd.version + 1;
                    cur.ttl_version = 0;
                    value_changed = true;
                } else if rcvd.originator_id != me {
                    cur.originator_id = me.clone();
                    cur.version += 1;
                    cur.ttl_version = 0;
                    value_changed = true;
                } else if cur.value != rcvd.value {
                    // Our own reflected update with a different payload.
                    cur.originator_id = me.clone();
                    cur.version += 1;
                    cur.ttl_version = 0;
                    value_changed = true;
                }

                if let Some(entry) =
                    self.ttl_entries.get_mut(&area).and_then(|m| m.get_mut(key))
                {
                    cur.ttl_version = entry.template.ttl_version;
                    if cur.ttl_version < rcvd.ttl_version {
                        entry.template.ttl_version = rcvd.ttl_version;
                        cur.ttl_version = rcvd.ttl_version;
                    }
                } else if cur.ttl_version < rcvd.ttl_version {
                    cur.ttl_version = rcvd.ttl_version;
                }

                if value_changed {
                    cur.hash = Some(cur.compute_hash());
                    updated = Some(cur.clone());
                }
            }

            if let Some(record) = updated {
                metrics().client_conflicts_overridden.inc();
                tracing::info!(
                    "overriding foreign write to persisted key ({}) with version {}",
                    key,
                    record.version
                );
                if let Some(cb) = self.key_callbacks.get(key) {
                    cb(key, Some(&record));
                }
                self.keys_to_advertise
                    .entry(area.clone())
                    .or_default()
                    .insert(key.clone());
                persisted_changed = true;
            }
        }

        if persisted_changed {
            self.run_persistence_hook(&area);
        }
        self.advertise_pending().await;

        for key in &publication.expired_keys {
            if let Some(cb) = &self.global_callback {
                cb(key, None);
            }
            if let Some(cb) = self.key_callbacks.get(key) {
                cb(key, None);
            }
        }
    }

    fn run_persistence_hook(&self, area: &str) {
        if let Some(hook) = &self.persistence_hook {
            match self.persisted.get(area) {
                Some(map) => hook(area, map),
                None => hook(area, &HashMap::new()),
            }
        }
    }
}
