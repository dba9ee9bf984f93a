//! Multi-store scenarios over the in-process transport: flooding, loop
//! suppression, spanning-tree pruning, TTL expiry, and hash-based sync.

use spindle_codec::Publication;
use spindle_common::{PeerSpec, Value, TTL_INFINITY};
use spindle_kvstore::{KvStore, KvStoreConfig, MemTransport};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

fn val(version: u64, originator: &str, payload: &str, ttl_ms: i64) -> Value {
    Value::new(
        version,
        originator,
        Some(payload.as_bytes().to_vec()),
        ttl_ms,
        0,
    )
}

fn kv(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn peer(name: &str, flood_optimization: bool) -> (String, PeerSpec) {
    (
        name.to_string(),
        PeerSpec {
            cmd_url: format!("{}:cmd", name),
            pub_url: format!("{}:pub", name),
            supports_flood_optimization: flood_optimization,
        },
    )
}

fn spawn_store(
    net: &MemTransport,
    name: &str,
    configure: impl FnOnce(&mut KvStoreConfig),
) -> KvStore {
    let mut config = KvStoreConfig::new(name);
    configure(&mut config);
    let (store, _join) = KvStore::spawn(config, Arc::new(net.clone()));
    net.register(format!("{}:cmd", name), store.clone());
    store
}

/// Count publications carrying `key` until the stream stays quiet.
async fn installs_of(rx: &mut mpsc::UnboundedReceiver<Publication>, key: &str) -> usize {
    let mut count = 0;
    while let Ok(Some(publication)) = timeout(Duration::from_millis(500), rx.recv()).await {
        if publication.key_vals.contains_key(key) {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn test_set_get_dump_roundtrip() {
    let net = MemTransport::new();
    let store = spawn_store(&net, "thanos", |_| {});

    store
        .set("0", kv(&[("k", val(1, "thanos", "v", TTL_INFINITY))]), None)
        .await
        .unwrap();

    let got = store.get("0", vec!["k".into(), "missing".into()]).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got["k"].value.as_deref(), Some(b"v".as_slice()));
    assert_eq!(got["k"].version, 1);

    let dumped = store.dump("0", "", vec![], None).await.unwrap();
    assert_eq!(dumped.len(), 1);

    let hashes = store.dump_hashes("0", "").await.unwrap();
    assert!(hashes["k"].value.is_none());
    assert!(hashes["k"].hash.is_some());

    // Unknown area is a structured error, not a panic.
    assert!(store.get("mars", vec!["k".into()]).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_and_get_snapshot_first() {
    let net = MemTransport::new();
    let store = spawn_store(&net, "thanos", |_| {});

    store
        .set("0", kv(&[("k1", val(1, "thanos", "a", TTL_INFINITY))]), None)
        .await
        .unwrap();

    let (snapshot, mut rx) = store.subscribe_and_get("0").await.unwrap();
    assert!(snapshot.key_vals.contains_key("k1"));

    store
        .set("0", kv(&[("k2", val(1, "thanos", "b", TTL_INFINITY))]), None)
        .await
        .unwrap();
    let publication = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(publication.key_vals.contains_key("k2"));
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_publishes_expired_keys() {
    let net = MemTransport::new();
    let store = spawn_store(&net, "thanos", |_| {});
    let mut rx = store.subscribe().await.unwrap();

    store
        .set("0", kv(&[("k", val(1, "thanos", "v1", 1_000))]), None)
        .await
        .unwrap();

    // Install publication first.
    let publication = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(publication.key_vals.contains_key("k"));

    // No refreshes: the reaper takes it out within ttl + one tick.
    let expiry = timeout(Duration::from_secs(5), async {
        loop {
            let publication = rx.recv().await.expect("stream open");
            if !publication.expired_keys.is_empty() {
                return publication;
            }
        }
    })
    .await
    .expect("expiry publication");
    assert_eq!(expiry.expired_keys, vec!["k".to_string()]);

    assert!(store.get("0", vec!["k".into()]).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_flood_reaches_peer_and_decrements_ttl() {
    let net = MemTransport::new();
    let a = spawn_store(&net, "thanos", |c| c.ttl_decrement_ms = 100);
    let b = spawn_store(&net, "gamora", |_| {});

    a.add_peers("0", [peer("gamora", false)].into()).await.unwrap();

    a.set("0", kv(&[("k", val(1, "thanos", "v", 60_000))]), None)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let got = b.get("0", vec!["k".into()]).await.unwrap();
    assert_eq!(got["k"].value.as_deref(), Some(b"v".as_slice()));
    assert!(
        got["k"].ttl_ms <= 60_000 - 100,
        "ttl must lose the per-hop decrement, got {}",
        got["k"].ttl_ms
    );
}

#[tokio::test(start_paused = true)]
async fn test_looped_publication_not_forwarded() {
    use spindle_codec::KvMessage;

    let net = MemTransport::new();
    let b = spawn_store(&net, "gamora", |_| {});
    let _c = spawn_store(&net, "nebula", |_| {});
    b.add_peers("0", [peer("nebula", false)].into()).await.unwrap();

    // A publication that claims to have visited us already: merge it, but
    // never forward it.
    let publication = Publication {
        key_vals: kv(&[("k", val(1, "thanos", "v", TTL_INFINITY))]),
        area: Some("0".into()),
        node_ids: Some(vec!["thanos".into(), "gamora".into()]),
        ..Default::default()
    };
    let response = b
        .handle_peer_message(KvMessage::Publication(publication))
        .await;
    assert!(matches!(response, KvMessage::Ack(a) if a.ok));
    sleep(Duration::from_millis(200)).await;

    assert!(
        b.get("0", vec!["k".into()]).await.unwrap().contains_key("k"),
        "record must still be merged locally"
    );
    let at_nebula = net_get(&net, "nebula:cmd", "k").await;
    assert!(
        at_nebula.is_empty(),
        "looped publication must not be forwarded"
    );
}

#[tokio::test(start_paused = true)]
async fn test_hash_sync_transfers_only_the_delta() {
    let net = MemTransport::new();
    let a = spawn_store(&net, "thanos", |_| {});
    let b = spawn_store(&net, "gamora", |_| {});

    // A holds ten keys; B holds nine of them plus an older tenth.
    let mut a_keys = Vec::new();
    for i in 0..10 {
        a_keys.push((format!("key-{i}"), val(2, "thanos", &format!("v2-{i}"), TTL_INFINITY)));
    }
    let a_kv: BTreeMap<String, Value> =
        a_keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    a.set("0", a_kv.clone(), None).await.unwrap();

    let mut b_kv = a_kv.clone();
    b_kv.insert("key-9".into(), val(1, "thanos", "v1-9", TTL_INFINITY));
    b.set("0", b_kv, None).await.unwrap();

    let mut b_events = b.subscribe().await.unwrap();

    // B peers with A and reconciles by hashes.
    b.add_peers("0", [peer("thanos", false)].into()).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let got = b.get("0", vec!["key-9".into()]).await.unwrap();
    assert_eq!(got["key-9"].version, 2, "stores must converge");

    // Exactly one delta publication, carrying exactly one key.
    let mut delta_publications = 0;
    while let Ok(Some(publication)) =
        timeout(Duration::from_millis(500), b_events.recv()).await
    {
        if publication.key_vals.is_empty() {
            continue;
        }
        delta_publications += 1;
        assert_eq!(
            publication.key_vals.len(),
            1,
            "only the mismatched key may transfer"
        );
        assert!(publication.key_vals.contains_key("key-9"));
    }
    assert_eq!(delta_publications, 1);
}

#[tokio::test(start_paused = true)]
async fn test_triangle_flood_suppression_with_dual() {
    let net = MemTransport::new();
    let a = spawn_store(&net, "thanos", |c| {
        c.enable_flood_optimization = true;
        c.is_flood_root = true;
    });
    let b = spawn_store(&net, "gamora", |c| c.enable_flood_optimization = true);
    let c = spawn_store(&net, "nebula", |c| c.enable_flood_optimization = true);

    a.add_peers("0", [peer("gamora", true), peer("nebula", true)].into())
        .await
        .unwrap();
    b.add_peers("0", [peer("thanos", true), peer("nebula", true)].into())
        .await
        .unwrap();
    c.add_peers("0", [peer("thanos", true), peer("gamora", true)].into())
        .await
        .unwrap();

    // Let the spanning tree for root "thanos" converge.
    sleep(Duration::from_millis(500)).await;

    let spt_b = b.spt_infos("0").await.unwrap();
    assert_eq!(
        spt_b["thanos"].parent.as_deref(),
        Some("thanos"),
        "B hangs directly off the root"
    );
    assert_eq!(spt_b["thanos"].cost, Some(1));

    let mut a_events = a.subscribe().await.unwrap();
    let mut b_events = b.subscribe().await.unwrap();
    let mut c_events = c.subscribe().await.unwrap();

    a.set("0", kv(&[("k", val(1, "thanos", "v", TTL_INFINITY))]), None)
        .await
        .unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(installs_of(&mut a_events, "k").await, 1, "only A's own install");
    assert_eq!(installs_of(&mut b_events, "k").await, 1, "B exactly once");
    assert_eq!(installs_of(&mut c_events, "k").await, 1, "C exactly once");

    assert!(b.get("0", vec!["k".into()]).await.unwrap().contains_key("k"));
    assert!(c.get("0", vec!["k".into()]).await.unwrap().contains_key("k"));
}

#[tokio::test(start_paused = true)]
async fn test_flood_rate_limit_coalesces() {
    let net = MemTransport::new();
    let a = spawn_store(&net, "thanos", |c| c.flood_rate = Some((1, 1)));
    let b = spawn_store(&net, "gamora", |_| {});

    a.add_peers("0", [peer("gamora", false)].into()).await.unwrap();

    // Burst of one: the first flood goes out, the rest coalesce.
    for i in 0..5 {
        a.set(
            "0",
            kv(&[(
                format!("k{i}").as_str(),
                val(1, "thanos", "v", TTL_INFINITY),
            )]),
            None,
        )
        .await
        .unwrap();
    }

    // After the bucket refills, everything must have arrived.
    sleep(Duration::from_secs(10)).await;
    let got = b.get("0", (0..5).map(|i| format!("k{i}")).collect()).await.unwrap();
    assert_eq!(got.len(), 5, "coalesced floods must flush, got {:?}", got.keys());
}

#[tokio::test(start_paused = true)]
async fn test_del_peers_stops_flooding() {
    let net = MemTransport::new();
    let a = spawn_store(&net, "thanos", |_| {});
    let b = spawn_store(&net, "gamora", |_| {});
    let _ = b;

    a.add_peers("0", [peer("gamora", false)].into()).await.unwrap();
    assert_eq!(a.get_peers("0").await.unwrap().len(), 1);

    a.del_peers("0", vec!["gamora".into()]).await.unwrap();
    assert!(a.get_peers("0").await.unwrap().is_empty());

    a.set("0", kv(&[("late", val(1, "thanos", "v", TTL_INFINITY))]), None)
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let got = net_get(&net, "gamora:cmd", "late").await;
    assert!(got.is_empty(), "removed peer must not receive floods");
}

/// Ask a store through the transport, as a peer would.
async fn net_get(net: &MemTransport, url: &str, key: &str) -> BTreeMap<String, Value> {
    use spindle_codec::{GetRequest, KvMessage};
    use spindle_kvstore::PeerTransport;

    let request = KvMessage::Get(GetRequest {
        area: "0".into(),
        keys: vec![key.to_string()],
    });
    match net.request(url, request).await {
        Ok(KvMessage::Publication(publication)) => publication.key_vals,
        _ => BTreeMap::new(),
    }
}
