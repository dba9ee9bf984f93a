//! Client behavior against a live store: persistence, conflict override,
//! TTL refresh, and subscription callbacks.

use spindle_common::{Value, TTL_INFINITY};
use spindle_kvclient::{KeyFilter, KvClientConfig, KvStoreClient};
use spindle_kvstore::{KvStore, KvStoreConfig, MemTransport};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};

fn spawn_store(name: &str) -> KvStore {
    let net = MemTransport::new();
    let (store, _join) = KvStore::spawn(KvStoreConfig::new(name), Arc::new(net));
    store
}

fn spawn_client(name: &str, store: &KvStore) -> KvStoreClient {
    let (client, _join) = KvStoreClient::spawn(KvClientConfig::new(name), store.clone());
    client
}

async fn wait_for<F: Fn(&BTreeMap<String, Value>) -> bool>(
    store: &KvStore,
    key: &str,
    predicate: F,
) -> BTreeMap<String, Value> {
    timeout(Duration::from_secs(30), async {
        loop {
            let got = store.get("0", vec![key.to_string()]).await.unwrap();
            if predicate(&got) {
                return got;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached")
}

#[tokio::test(start_paused = true)]
async fn test_persist_key_lands_in_store() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    let changed = client
        .persist_key("0", "prefix:lo", "v1", TTL_INFINITY)
        .await
        .unwrap();
    assert!(changed);

    let got = wait_for(&store, "prefix:lo", |m| m.contains_key("prefix:lo")).await;
    let record = &got["prefix:lo"];
    assert_eq!(record.version, 1);
    assert_eq!(record.originator_id, "thanos");
    assert_eq!(record.value.as_deref(), Some(b"v1".as_slice()));

    // Same value, same ttl: a no-op.
    let changed = client
        .persist_key("0", "prefix:lo", "v1", TTL_INFINITY)
        .await
        .unwrap();
    assert!(!changed);

    // New value bumps the version.
    assert!(client
        .persist_key("0", "prefix:lo", "v2", TTL_INFINITY)
        .await
        .unwrap());
    let got = wait_for(&store, "prefix:lo", |m| {
        m.get("prefix:lo").is_some_and(|v| v.version == 2)
    })
    .await;
    assert_eq!(got["prefix:lo"].value.as_deref(), Some(b"v2".as_slice()));
}

#[tokio::test(start_paused = true)]
async fn test_persistence_override_wins_conflict() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    client
        .persist_key("0", "k", "v1", TTL_INFINITY)
        .await
        .unwrap();
    wait_for(&store, "k", |m| m.contains_key("k")).await;

    // A foreign node injects a higher version with different content.
    let foreign = Value::new(2, "loki", Some(b"v2".to_vec()), TTL_INFINITY, 0);
    store
        .set("0", [("k".to_string(), foreign)].into(), None)
        .await
        .unwrap();

    // The client must fight back with a strictly higher version carrying
    // its own value.
    let got = wait_for(&store, "k", |m| {
        m.get("k").is_some_and(|v| v.originator_id == "thanos" && v.version >= 3)
    })
    .await;
    assert_eq!(got["k"].value.as_deref(), Some(b"v1".as_slice()));
}

#[tokio::test(start_paused = true)]
async fn test_ttl_refresh_keeps_key_alive() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    client.persist_key("0", "k", "v", 2_000).await.unwrap();
    wait_for(&store, "k", |m| m.contains_key("k")).await;

    // Far beyond the original TTL, refreshes must have kept it alive with
    // a growing ttlVersion.
    sleep(Duration::from_secs(10)).await;
    let got = store.get("0", vec!["k".to_string()]).await.unwrap();
    let record = got.get("k").expect("refreshes keep the key alive");
    assert!(record.ttl_version > 1, "ttlVersion was {}", record.ttl_version);
    assert_eq!(record.version, 1, "refreshes must not bump the version");
}

#[tokio::test(start_paused = true)]
async fn test_unset_key_lets_record_expire() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    client.persist_key("0", "k", "v", 2_000).await.unwrap();
    wait_for(&store, "k", |m| m.contains_key("k")).await;

    client.unset_key("0", "k").await.unwrap();

    // With nobody refreshing it, the reaper takes it out.
    wait_for(&store, "k", |m| m.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_key_fires_callback_with_none() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    let seen: Arc<Mutex<Vec<(String, Option<u64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .subscribe_key(
            "0",
            "mortal",
            Box::new(move |key, value| {
                sink.lock()
                    .unwrap()
                    .push((key.to_string(), value.map(|v| v.version)));
            }),
            false,
        )
        .await
        .unwrap();

    // Someone else's short-lived key.
    let record = Value::new(1, "loki", Some(b"v".to_vec()), 1_000, 0);
    store
        .set("0", [("mortal".to_string(), record)].into(), None)
        .await
        .unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            {
                let seen = seen.lock().unwrap();
                let got_install = seen.iter().any(|(k, v)| k == "mortal" && v.is_some());
                let got_expiry = seen.iter().any(|(k, v)| k == "mortal" && v.is_none());
                if got_install && got_expiry {
                    return;
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("callback must see install then expiry");
}

#[tokio::test(start_paused = true)]
async fn test_set_key_derives_next_version() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    let existing = Value::new(3, "loki", Some(b"old".to_vec()), TTL_INFINITY, 0);
    store
        .set("0", [("k".to_string(), existing)].into(), None)
        .await
        .unwrap();

    client
        .set_key("0", "k", "new", 0, TTL_INFINITY)
        .await
        .unwrap();

    let got = wait_for(&store, "k", |m| {
        m.get("k").is_some_and(|v| v.originator_id == "thanos")
    })
    .await;
    assert_eq!(got["k"].version, 4);
    assert_eq!(got["k"].value.as_deref(), Some(b"new".as_slice()));
}

#[tokio::test(start_paused = true)]
async fn test_clear_key_overwrites_cluster_wide() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    client
        .persist_key("0", "k", "keep-me", TTL_INFINITY)
        .await
        .unwrap();
    wait_for(&store, "k", |m| m.contains_key("k")).await;

    client.clear_key("0", "k", "", 10_000).await.unwrap();

    let got = wait_for(&store, "k", |m| {
        m.get("k").is_some_and(|v| v.value.as_deref() == Some(b"".as_slice()))
    })
    .await;
    assert_eq!(got["k"].version, 2);

    // Cleared keys are no longer defended: a foreign write sticks.
    let foreign = Value::new(5, "loki", Some(b"mine-now".to_vec()), TTL_INFINITY, 0);
    store
        .set("0", [("k".to_string(), foreign)].into(), None)
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;
    let got = store.get("0", vec!["k".to_string()]).await.unwrap();
    assert_eq!(got["k"].originator_id, "loki");
}

#[tokio::test(start_paused = true)]
async fn test_prefix_filter_callback() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .subscribe_key_filter(
            KeyFilter {
                prefixes: vec!["adj:".to_string()],
                originator_ids: vec!["loki".to_string()],
            },
            Box::new(move |key, _| sink.lock().unwrap().push(key.to_string())),
        )
        .await
        .unwrap();

    let make = |originator: &str| Value::new(1, originator, Some(b"v".to_vec()), TTL_INFINITY, 0);
    store
        .set(
            "0",
            [
                ("adj:match".to_string(), make("loki")),
                ("adj:wrong-origin".to_string(), make("odin")),
                ("prefix:wrong-key".to_string(), make("loki")),
            ]
            .into(),
            None,
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if seen.lock().unwrap().contains(&"adj:match".to_string()) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("filter callback must fire");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), ["adj:match".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_hook_sees_every_change() {
    let store = spawn_store("thanos");
    let client = spawn_client("thanos", &store);

    let snapshots: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    client
        .set_persistence_hook(Some(Box::new(move |_area, map| {
            sink.lock().unwrap().push(map.len());
        })))
        .await
        .unwrap();

    client
        .persist_key("0", "k1", "a", TTL_INFINITY)
        .await
        .unwrap();
    client
        .persist_key("0", "k2", "b", TTL_INFINITY)
        .await
        .unwrap();
    client.unset_key("0", "k1").await.unwrap();

    sleep(Duration::from_millis(100)).await;
    let snapshots = snapshots.lock().unwrap();
    assert_eq!(snapshots.as_slice(), [1, 2, 1]);
}
