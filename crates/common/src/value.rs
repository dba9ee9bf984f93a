//! The versioned key-value record and its merge rule.
//!
//! Every key in the store maps to a [`Value`]. Conflicting records for the
//! same key are resolved by a total order on
//! `(version, originatorId, valueHash, ttlVersion)`, all descending. A
//! received record replaces the local one iff it strictly exceeds it; a
//! value-less record with matching `(version, originatorId)` and a higher
//! `ttlVersion` refreshes the TTL in place.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Sentinel TTL disabling expiry and refresh for a key.
pub const TTL_INFINITY: i64 = i32::MIN as i64;

/// A single versioned record in the key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Monotonic version, >= 1 for any advertised record.
    pub version: u64,
    /// Node that minted this version. Lexicographic tiebreak on version ties.
    pub originator_id: String,
    /// Opaque payload. `None` marks a TTL-refresh record.
    pub value: Option<Vec<u8>>,
    /// Remaining lifetime in milliseconds, or [`TTL_INFINITY`].
    pub ttl_ms: i64,
    /// Bumped on every TTL refresh; tiebreaks only when everything else ties.
    pub ttl_version: u64,
    /// Cached digest over (version, originatorId, value), for hash-based sync.
    pub hash: Option<u64>,
}

impl Value {
    /// Build a record, filling in the hash cache.
    pub fn new(
        version: u64,
        originator_id: impl Into<String>,
        value: Option<Vec<u8>>,
        ttl_ms: i64,
        ttl_version: u64,
    ) -> Self {
        let mut v = Self {
            version,
            originator_id: originator_id.into(),
            value,
            ttl_ms,
            ttl_version,
            hash: None,
        };
        v.hash = Some(v.compute_hash());
        v
    }

    /// Deterministic digest over (version, originatorId, value).
    pub fn compute_hash(&self) -> u64 {
        let mut hasher = Sha1::new();
        hasher.update(self.version.to_be_bytes());
        hasher.update(self.originator_id.as_bytes());
        if let Some(ref bytes) = self.value {
            hasher.update(bytes);
        }
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest >= 8 bytes"))
    }

    /// Cached hash, computing it on demand.
    pub fn hash_or_compute(&self) -> u64 {
        self.hash.unwrap_or_else(|| self.compute_hash())
    }

    /// A record without a payload only refreshes the TTL of an existing one.
    pub fn is_ttl_update(&self) -> bool {
        self.value.is_none()
    }

    /// Whether this record never expires.
    pub fn has_infinite_ttl(&self) -> bool {
        self.ttl_ms == TTL_INFINITY
    }

    /// Copy with the payload stripped, keeping metadata and hash. Used by
    /// hash-only dumps.
    pub fn without_payload(&self) -> Self {
        Self {
            version: self.version,
            originator_id: self.originator_id.clone(),
            value: None,
            ttl_ms: self.ttl_ms,
            ttl_version: self.ttl_version,
            hash: Some(self.hash_or_compute()),
        }
    }
}

/// Total order on records for the same key. `Greater` means `a` wins.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    (a.version, &a.originator_id, a.hash_or_compute(), a.ttl_version).cmp(&(
        b.version,
        &b.originator_id,
        b.hash_or_compute(),
        b.ttl_version,
    ))
}

/// Counters accumulated by one merge pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub installed: usize,
    pub ttl_updated: usize,
    pub no_ops: usize,
    pub invalid: usize,
}

/// Merge `key_vals` into `kv_store` under the total order.
///
/// Returns the subset that changed local state — full records for installs,
/// value-less records for TTL refreshes — which is exactly the set to
/// re-flood. Records that do not strictly exceed the local one are no-ops.
pub fn merge_key_values(
    kv_store: &mut HashMap<String, Value>,
    key_vals: HashMap<String, Value>,
    stats: &mut MergeStats,
) -> HashMap<String, Value> {
    let mut updates = HashMap::new();

    for (key, rcvd) in key_vals {
        if rcvd.version < 1 {
            stats.invalid += 1;
            continue;
        }

        let accepted = match kv_store.get_mut(&key) {
            None => {
                // A TTL refresh for a key we never stored carries nothing.
                if rcvd.value.is_some() {
                    let mut v = rcvd.clone();
                    v.hash = Some(v.compute_hash());
                    kv_store.insert(key.clone(), v);
                    stats.installed += 1;
                    true
                } else {
                    stats.no_ops += 1;
                    false
                }
            }
            Some(cur) => merge_one(cur, &rcvd, stats),
        };

        if accepted {
            updates.insert(key, rcvd);
        }
    }

    updates
}

/// Merge a single received record against the stored one. Returns whether
/// local state changed. `cur` is updated in place on install/refresh.
fn merge_one(cur: &mut Value, rcvd: &Value, stats: &mut MergeStats) -> bool {
    // TTL refreshes apply only on an exact (version, originatorId) match.
    if rcvd.is_ttl_update() {
        if rcvd.version == cur.version
            && rcvd.originator_id == cur.originator_id
            && rcvd.ttl_version > cur.ttl_version
        {
            cur.ttl_version = rcvd.ttl_version;
            cur.ttl_ms = rcvd.ttl_ms;
            stats.ttl_updated += 1;
            return true;
        }
        stats.no_ops += 1;
        return false;
    }

    match (rcvd.version, &rcvd.originator_id).cmp(&(cur.version, &cur.originator_id)) {
        Ordering::Greater => {
            install(cur, rcvd);
            stats.installed += 1;
            true
        }
        Ordering::Less => {
            stats.no_ops += 1;
            false
        }
        Ordering::Equal => {
            let (rh, ch) = (rcvd.hash_or_compute(), cur.hash_or_compute());
            match rh.cmp(&ch) {
                Ordering::Greater => {
                    install(cur, rcvd);
                    stats.installed += 1;
                    true
                }
                Ordering::Less => {
                    stats.no_ops += 1;
                    false
                }
                Ordering::Equal => {
                    // Identical content, so the ttlVersion tiebreaks.
                    if rcvd.ttl_version > cur.ttl_version {
                        cur.ttl_version = rcvd.ttl_version;
                        cur.ttl_ms = rcvd.ttl_ms;
                        stats.ttl_updated += 1;
                        true
                    } else {
                        stats.no_ops += 1;
                        false
                    }
                }
            }
        }
    }
}

fn install(cur: &mut Value, rcvd: &Value) {
    *cur = rcvd.clone();
    cur.hash = Some(cur.compute_hash());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(version: u64, originator: &str, value: &str, ttl_version: u64) -> Value {
        Value::new(
            version,
            originator,
            Some(value.as_bytes().to_vec()),
            60_000,
            ttl_version,
        )
    }

    fn ttl_refresh(version: u64, originator: &str, ttl_version: u64) -> Value {
        Value {
            version,
            originator_id: originator.to_string(),
            value: None,
            ttl_ms: 60_000,
            ttl_version,
            hash: None,
        }
    }

    fn merge(store: &mut HashMap<String, Value>, kv: &[(&str, Value)]) -> HashMap<String, Value> {
        let kv: HashMap<String, Value> =
            kv.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        merge_key_values(store, kv, &mut MergeStats::default())
    }

    #[test]
    fn test_higher_version_wins() {
        let mut store = HashMap::new();
        merge(&mut store, &[("k", val(1, "a", "v1", 0))]);
        let updates = merge(&mut store, &[("k", val(2, "b", "v2", 0))]);
        assert_eq!(updates.len(), 1);
        assert_eq!(store["k"].version, 2);
        assert_eq!(store["k"].value.as_deref(), Some(b"v2".as_slice()));
    }

    #[test]
    fn test_lower_version_is_noop() {
        let mut store = HashMap::new();
        merge(&mut store, &[("k", val(3, "a", "v3", 0))]);
        let updates = merge(&mut store, &[("k", val(2, "z", "v2", 9))]);
        assert!(updates.is_empty());
        assert_eq!(store["k"].version, 3);
    }

    #[test]
    fn test_originator_tiebreak() {
        let mut store = HashMap::new();
        merge(&mut store, &[("k", val(1, "alice", "v", 0))]);
        let updates = merge(&mut store, &[("k", val(1, "bob", "w", 0))]);
        assert_eq!(updates.len(), 1, "higher originator must win on version tie");
        assert_eq!(store["k"].originator_id, "bob");

        let updates = merge(&mut store, &[("k", val(1, "alice", "v", 5))]);
        assert!(updates.is_empty(), "lower originator must lose");
    }

    #[test]
    fn test_identical_record_is_noop() {
        let mut store = HashMap::new();
        merge(&mut store, &[("k", val(1, "a", "v", 0))]);
        let updates = merge(&mut store, &[("k", val(1, "a", "v", 0))]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_ttl_refresh_applies_on_exact_match() {
        let mut store = HashMap::new();
        merge(&mut store, &[("k", val(1, "a", "v", 0))]);

        let updates = merge(&mut store, &[("k", ttl_refresh(1, "a", 1))]);
        assert_eq!(updates.len(), 1, "ttl refresh must be re-flooded");
        assert!(updates["k"].is_ttl_update());
        assert_eq!(store["k"].ttl_version, 1);
        assert_eq!(
            store["k"].value.as_deref(),
            Some(b"v".as_slice()),
            "payload must survive a ttl refresh"
        );
    }

    #[test]
    fn test_ttl_refresh_rejected_on_mismatch() {
        let mut store = HashMap::new();
        merge(&mut store, &[("k", val(2, "a", "v", 0))]);

        // Wrong version.
        assert!(merge(&mut store, &[("k", ttl_refresh(1, "a", 7))]).is_empty());
        // Wrong originator.
        assert!(merge(&mut store, &[("k", ttl_refresh(2, "b", 7))]).is_empty());
        // Stale ttlVersion.
        assert!(merge(&mut store, &[("k", ttl_refresh(2, "a", 0))]).is_empty());
        assert_eq!(store["k"].ttl_version, 0);
    }

    #[test]
    fn test_ttl_refresh_for_unknown_key_dropped() {
        let mut store = HashMap::new();
        let updates = merge(&mut store, &[("ghost", ttl_refresh(1, "a", 1))]);
        assert!(updates.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_version_invalid() {
        let mut store = HashMap::new();
        let mut stats = MergeStats::default();
        let kv: HashMap<String, Value> = [("k".to_string(), val(0, "a", "v", 0))].into();
        let updates = merge_key_values(&mut store, kv, &mut stats);
        assert!(updates.is_empty());
        assert_eq!(stats.invalid, 1);
    }

    #[test]
    fn test_merge_is_order_insensitive() {
        // merge(a, merge(b, c)) == merge(merge(a, b), c): the winner depends
        // only on the multiset of inputs.
        let records = [
            val(1, "a", "x", 0),
            val(2, "b", "y", 3),
            val(2, "c", "z", 1),
            ttl_refresh(2, "c", 4),
        ];

        let mut left = HashMap::new();
        for r in &records {
            merge(&mut left, &[("k", r.clone())]);
        }

        let mut right = HashMap::new();
        for r in records.iter().rev() {
            merge(&mut right, &[("k", r.clone())]);
        }

        assert_eq!(left["k"].version, right["k"].version);
        assert_eq!(left["k"].originator_id, right["k"].originator_id);
        assert_eq!(left["k"].value, right["k"].value);
    }

    #[test]
    fn test_compare_values_total_order() {
        let a = val(2, "a", "v", 0);
        let b = val(1, "z", "w", 9);
        assert_eq!(compare_values(&a, &b), Ordering::Greater);
        assert_eq!(compare_values(&b, &a), Ordering::Less);
        assert_eq!(compare_values(&a, &a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = val(1, "a", "payload", 0);
        let b = val(1, "a", "payload", 42); // ttl_version not hashed
        assert_eq!(a.compute_hash(), b.compute_hash());

        let c = val(1, "a", "other", 0);
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn test_without_payload_keeps_hash() {
        let a = val(3, "a", "payload", 1);
        let stripped = a.without_payload();
        assert!(stripped.value.is_none());
        assert_eq!(stripped.hash, Some(a.hash_or_compute()));
        assert_eq!(stripped.version, 3);
    }
}
