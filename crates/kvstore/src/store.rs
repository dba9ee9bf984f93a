//! The per-area versioned map.
//!
//! Pure data structure: merge-rule installs, filtered dumps, and TTL
//! bookkeeping. Flooding, peers, and timers live in the actor.

use spindle_common::{merge_key_values, MergeStats, Value};
use spindle_metrics::metrics;
use std::collections::{BTreeMap, HashMap};

/// Optional constraints a store is constructed with: accepted key prefixes
/// and an originator allow-list.
#[derive(Debug, Clone, Default)]
pub struct KvFilters {
    pub key_prefixes: Vec<String>,
    pub originator_ids: Vec<String>,
}

impl KvFilters {
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        let prefix_ok = self.key_prefixes.is_empty()
            || self.key_prefixes.iter().any(|p| key.starts_with(p));
        let originator_ok = self.originator_ids.is_empty()
            || self.originator_ids.contains(&value.originator_id);
        prefix_ok && originator_ok
    }
}

/// One area's key-value database.
#[derive(Debug, Default)]
pub struct AreaStore {
    key_vals: HashMap<String, Value>,
    filters: Option<KvFilters>,
}

impl AreaStore {
    pub fn new(filters: Option<KvFilters>) -> Self {
        Self {
            key_vals: HashMap::new(),
            filters,
        }
    }

    pub fn len(&self) -> usize {
        self.key_vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
    }

    /// Merge received records under the total order. Returns the records
    /// that changed local state, which is the set to publish and re-flood.
    pub fn merge(&mut self, key_vals: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let filtered: HashMap<String, Value> = key_vals
            .into_iter()
            .filter(|(key, value)| match &self.filters {
                Some(filters) => filters.matches(key, value),
                None => true,
            })
            .collect();

        let mut stats = MergeStats::default();
        let updates = merge_key_values(&mut self.key_vals, filtered, &mut stats);

        let m = metrics();
        m.kv_merges_accepted.inc_by(stats.installed as u64);
        m.kv_merge_no_ops.inc_by(stats.no_ops as u64);
        m.kv_ttl_refreshes.inc_by(stats.ttl_updated as u64);

        updates.into_iter().collect()
    }

    /// The requested keys that exist locally.
    pub fn get(&self, keys: &[String]) -> BTreeMap<String, Value> {
        keys.iter()
            .filter_map(|key| {
                self.key_vals
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    /// Dump keys matching `prefix` and `originators`. With `known_hashes`,
    /// only keys absent from the map or hashing differently are returned
    /// (delta sync). With `hashes_only`, payloads are stripped.
    pub fn dump(
        &self,
        prefix: &str,
        originators: &[String],
        known_hashes: Option<&BTreeMap<String, u64>>,
        hashes_only: bool,
    ) -> BTreeMap<String, Value> {
        self.key_vals
            .iter()
            .filter(|(key, value)| {
                key.starts_with(prefix)
                    && (originators.is_empty() || originators.contains(&value.originator_id))
            })
            .filter(|(key, value)| match known_hashes {
                Some(hashes) => hashes
                    .get(key.as_str())
                    .map_or(true, |h| *h != value.hash_or_compute()),
                None => true,
            })
            .map(|(key, value)| {
                let value = if hashes_only {
                    value.without_payload()
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Per-key hashes of the whole area, for sync comparison.
    pub fn hashes(&self) -> BTreeMap<String, u64> {
        self.key_vals
            .iter()
            .map(|(key, value)| (key.clone(), value.hash_or_compute()))
            .collect()
    }

    /// Advance TTLs by `elapsed_ms` and reap. Returns the expired keys.
    pub fn expire_tick(&mut self, elapsed_ms: i64) -> Vec<String> {
        let mut expired = Vec::new();
        self.key_vals.retain(|key, value| {
            if value.has_infinite_ttl() {
                return true;
            }
            value.ttl_ms -= elapsed_ms;
            if value.ttl_ms <= 0 {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            metrics().kv_keys_expired.inc_by(expired.len() as u64);
        }
        expired.sort();
        expired
    }
}
