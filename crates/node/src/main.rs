//! spindle-node: entry point for a routing daemon node.
//!
//! Loads config, starts neighbor discovery over the real UDP transport and
//! the key-value store over TCP, bridges neighbor events into the store's
//! peer set, and serves metrics. Interface snapshots come from a YAML file
//! standing in for the platform's netlink collaborator; the file is
//! re-read periodically so interface churn can be simulated by editing it.

use spindle_common::{InterfaceDatabase, NeighborEvent, NeighborEventKind, PeerSpec};
use spindle_config::NodeConfig;
use spindle_kvclient::{KvClientConfig, KvStoreClient};
use spindle_kvstore::{KvStore, KvStoreConfig, TcpPeerTransport};
use spindle_spark::{Spark, SparkConfig, UdpPacketIo};
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// How often the interface snapshot file is re-read.
const INTERFACE_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn spark_config(config: &NodeConfig) -> SparkConfig {
    SparkConfig {
        node_name: config.node_name.clone(),
        domain_name: config.domain_name.clone(),
        areas: Some(config.areas.clone()),
        enable_v4: config.enable_v4,
        enable_subnet_validation: config.enable_subnet_validation,
        enable_flood_optimization: config.enable_flood_optimization,
        hold_time: Duration::from_millis(config.spark.hold_time_ms),
        keep_alive_time: Duration::from_millis(config.spark.keep_alive_time_ms),
        fast_init_keep_alive_time: Duration::from_millis(
            config.spark.fast_init_keep_alive_time_ms,
        ),
        handshake_time: Duration::from_millis(config.spark.handshake_time_ms),
        negotiate_hold_time: Duration::from_millis(config.spark.negotiate_hold_time_ms),
        heartbeat_hold_time: Duration::from_millis(config.spark.heartbeat_hold_time_ms),
        kv_cmd_port: config.kvstore.cmd_port,
        kv_pub_port: config.kvstore.pub_port,
        sr_local_range: config.sr_local_range,
        max_allowed_pps: config.spark.max_allowed_pps,
    }
}

fn kvstore_config(config: &NodeConfig) -> KvStoreConfig {
    KvStoreConfig {
        node_name: config.node_name.clone(),
        areas: config.areas.clone(),
        enable_flood_optimization: config.enable_flood_optimization,
        is_flood_root: config.is_flood_root,
        ttl_decrement_ms: config.kvstore.ttl_decrement_ms as i64,
        ttl_reaper_interval: Duration::from_millis(config.kvstore.ttl_reaper_interval_ms),
        db_sync_interval: Duration::from_secs(config.kvstore.db_sync_interval_secs),
        flood_rate: config
            .kvstore
            .flood_rate
            .map(|rate| (rate.burst_size, rate.msgs_per_sec)),
        filters: None,
    }
}

/// Translate neighbor events into peer add/remove on the store.
async fn run_peer_manager(
    mut events: mpsc::Receiver<NeighborEvent>,
    store: KvStore,
    default_area: String,
    kv_cmd_port: u16,
    if_indexes: Arc<std::sync::Mutex<HashMap<String, u32>>>,
) {
    while let Some(event) = events.recv().await {
        let area = event.area.clone().unwrap_or_else(|| default_area.clone());
        let node = event.neighbor.node_name.clone();
        tracing::info!(
            "{} for ({}) on interface ({}) rtt={}us label={}",
            event.kind.as_str(),
            node,
            event.if_name,
            event.rtt_us,
            event.label
        );

        match event.kind {
            NeighborEventKind::Up | NeighborEventKind::Restarted => {
                let Some(v6) = event.neighbor.link_local_v6 else {
                    tracing::warn!("neighbor ({}) has no v6 transport address", node);
                    continue;
                };
                let scope = if_indexes
                    .lock()
                    .expect("ifindex lock")
                    .get(&event.if_name)
                    .copied()
                    .unwrap_or(0);
                let cmd_port = if event.neighbor.kv_cmd_port > 0 {
                    event.neighbor.kv_cmd_port
                } else {
                    kv_cmd_port
                };
                let pub_port = event.neighbor.kv_pub_port;
                let peer = PeerSpec {
                    cmd_url: peer_url(v6, cmd_port, scope),
                    pub_url: peer_url(v6, pub_port, scope),
                    supports_flood_optimization: event.supports_flood_optimization,
                };
                if let Err(e) = store.add_peers(&area, [(node.clone(), peer)].into()).await {
                    tracing::warn!("failed adding peer ({}): {}", node, e);
                }
            }
            NeighborEventKind::Down => {
                if let Err(e) = store.del_peers(&area, vec![node.clone()]).await {
                    tracing::warn!("failed removing peer ({}): {}", node, e);
                }
            }
            // The adjacency survives a graceful restart; peers stay.
            NeighborEventKind::Restarting | NeighborEventKind::RttChange => {}
        }
    }
}

fn peer_url(v6: Ipv6Addr, port: u16, scope: u32) -> String {
    SocketAddrV6::new(v6, port, 0, scope).to_string()
}

/// Poll the interface snapshot file and push changes into discovery. Stands
/// in for the platform netlink collaborator.
async fn run_interface_poller(
    path: PathBuf,
    spark: Spark,
    if_indexes: Arc<std::sync::Mutex<HashMap<String, u32>>>,
) {
    let mut last: Option<InterfaceDatabase> = None;
    loop {
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_yaml::from_str::<InterfaceDatabase>(&contents) {
                Ok(db) => {
                    if last.as_ref() != Some(&db) {
                        {
                            let mut indexes = if_indexes.lock().expect("ifindex lock");
                            indexes.clear();
                            for (name, entry) in &db.interfaces {
                                indexes.insert(name.clone(), entry.if_index);
                            }
                        }
                        if let Err(e) = spark.update_interfaces(db.clone()).await {
                            tracing::error!("interface snapshot rejected: {}", e);
                        } else {
                            tracing::info!(
                                "applied interface snapshot with {} interface(s)",
                                db.interfaces.len()
                            );
                        }
                        last = Some(db);
                    }
                }
                Err(e) => tracing::error!("failed parsing interface snapshot: {}", e),
            },
            Err(e) => tracing::debug!("interface snapshot unreadable: {}", e),
        }
        tokio::time::sleep(INTERFACE_POLL_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    spindle_metrics::init_tracing();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "spindle.yaml".to_string());
    let interfaces_path = PathBuf::from(
        args.next()
            .unwrap_or_else(|| "interfaces.yaml".to_string()),
    );

    let config = spindle_config::load_from_file(std::path::Path::new(&config_path))?;
    tracing::info!(
        "starting node ({}) in domain ({}) with {} area(s)",
        config.node_name,
        config.domain_name,
        config.areas.len()
    );

    // Metrics endpoint.
    if let Some(port) = config.metrics_port {
        let addr = format!("0.0.0.0:{}", port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = spindle_metrics::serve_metrics(addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Key-value store with its TCP command endpoint.
    let transport = Arc::new(TcpPeerTransport::new());
    let (store, _store_join) = KvStore::spawn(kvstore_config(&config), transport);
    let listener =
        tokio::net::TcpListener::bind(("::", config.kvstore.cmd_port)).await?;
    tokio::spawn(spindle_kvstore::serve_peer_endpoint(
        listener,
        store.clone(),
    ));

    // Key-value client for locally originated keys.
    let mut client_config = KvClientConfig::new(config.node_name.clone());
    client_config.check_persist_key_interval = Some(Duration::from_secs(60));
    let (_client, _client_join): (KvStoreClient, _) =
        KvStoreClient::spawn(client_config, store.clone());

    // Neighbor discovery over the real multicast transport.
    let io = UdpPacketIo::bind(config.spark.udp_mcast_port)?;
    let (spark, events, _spark_join) = Spark::spawn(spark_config(&config), io);

    // ifName -> ifIndex, shared between the snapshot poller and the peer
    // manager (peer URLs need the scope id).
    let if_indexes = Arc::new(std::sync::Mutex::new(HashMap::new()));

    let default_area = config
        .areas
        .iter()
        .next()
        .cloned()
        .unwrap_or_else(|| spindle_common::DEFAULT_AREA.to_string());
    tokio::spawn(run_peer_manager(
        events,
        store.clone(),
        default_area,
        config.kvstore.cmd_port,
        if_indexes.clone(),
    ));
    tokio::spawn(run_interface_poller(
        interfaces_path,
        spark.clone(),
        if_indexes,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    // Announce the restart before dropping adjacencies.
    spark.stop().await;
    store.stop().await;
    Ok(())
}
