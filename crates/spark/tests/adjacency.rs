//! End-to-end discovery scenarios over the simulated network.

use spindle_common::{
    CidrNetwork, InterfaceDatabase, InterfaceEntry, NeighborEvent, NeighborEventKind,
};
use spindle_spark::{SimNetwork, Spark, SparkConfig};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn iface_db(node: &str, if_name: &str, if_index: u32, addrs: &[(&str, u8)]) -> InterfaceDatabase {
    let mut interfaces = HashMap::new();
    interfaces.insert(
        if_name.to_string(),
        InterfaceEntry {
            is_up: true,
            if_index,
            networks: addrs
                .iter()
                .map(|(addr, len)| CidrNetwork::new(addr.parse().unwrap(), *len))
                .collect(),
        },
    );
    InterfaceDatabase {
        this_node_name: node.to_string(),
        interfaces,
    }
}

/// Wait for the next event of `kind`, skipping RTT-change noise.
async fn expect_event(
    rx: &mut mpsc::Receiver<NeighborEvent>,
    kind: NeighborEventKind,
) -> NeighborEvent {
    timeout(Duration::from_secs(60), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if event.kind == kind {
                return event;
            }
            assert_eq!(
                event.kind,
                NeighborEventKind::RttChange,
                "unexpected {} while waiting for {}",
                event.kind.as_str(),
                kind.as_str()
            );
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind.as_str()))
}

fn config(node: &str) -> SparkConfig {
    let mut config = SparkConfig::new(node, "universe");
    config.enable_v4 = true;
    config
}

#[tokio::test(start_paused = true)]
async fn test_two_node_adjacency() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b = net.io();
    net.connect(&io_a, 2, &io_b, 5);

    let (spark_a, mut events_a, _ha) = Spark::spawn(config("thanos"), io_a);
    let (spark_b, mut events_b, _hb) = Spark::spawn(config("gamora"), io_b);

    spark_a
        .update_interfaces(iface_db(
            "thanos",
            "eth0",
            2,
            &[("fe80::1", 64), ("10.0.0.1", 24)],
        ))
        .await
        .unwrap();
    spark_b
        .update_interfaces(iface_db(
            "gamora",
            "eth1",
            5,
            &[("fe80::2", 64), ("10.0.0.2", 24)],
        ))
        .await
        .unwrap();

    let up_a = expect_event(&mut events_a, NeighborEventKind::Up).await;
    let up_b = expect_event(&mut events_b, NeighborEventKind::Up).await;

    assert_eq!(up_a.neighbor.node_name, "gamora");
    assert_eq!(up_a.if_name, "eth0");
    assert_eq!(up_a.neighbor.remote_if_name, "eth1");
    assert!(up_a.rtt_us > 0, "rtt must be measured before UP");
    assert!((50_000..=59_999).contains(&up_a.label));

    assert_eq!(up_b.neighbor.node_name, "thanos");
    assert!(up_b.rtt_us > 0);
    assert!((50_000..=59_999).contains(&up_b.label));

    let neighbors = spark_a.neighbors().await.unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].state, "ESTABLISHED");
}

#[tokio::test(start_paused = true)]
async fn test_graceful_restart_preserves_label() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b1 = net.io();
    let io_b2 = net.io();
    net.connect(&io_a, 2, &io_b1, 5);
    net.connect(&io_a, 2, &io_b2, 5);

    let (spark_a, mut events_a, _ha) = Spark::spawn(config("thanos"), io_a);
    let (spark_b1, mut events_b1, _hb1) = Spark::spawn(config("gamora"), io_b1);

    let db_a = iface_db("thanos", "eth0", 2, &[("fe80::1", 64), ("10.0.0.1", 24)]);
    let db_b = iface_db("gamora", "eth1", 5, &[("fe80::2", 64), ("10.0.0.2", 24)]);

    spark_a.update_interfaces(db_a.clone()).await.unwrap();
    spark_b1.update_interfaces(db_b.clone()).await.unwrap();

    let up = expect_event(&mut events_a, NeighborEventKind::Up).await;
    expect_event(&mut events_b1, NeighborEventKind::Up).await;

    // B announces restart (three restarting hellos) and goes away.
    spark_b1.stop().await;

    let restarting = expect_event(&mut events_a, NeighborEventKind::Restarting).await;
    assert_eq!(restarting.neighbor.node_name, "gamora");

    // B comes back with a fresh incarnation before the hold expires.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (spark_b2, mut events_b2, _hb2) = Spark::spawn(config("gamora"), io_b2);
    spark_b2.update_interfaces(db_b).await.unwrap();

    let restarted = expect_event(&mut events_a, NeighborEventKind::Restarted).await;
    assert_eq!(restarted.neighbor.node_name, "gamora");
    assert_eq!(
        restarted.label, up.label,
        "label must survive a graceful restart"
    );
    expect_event(&mut events_b2, NeighborEventKind::Up).await;

    // No DOWN in between: the next event on A (if any) must not be DOWN.
    let neighbors = spark_a.neighbors().await.unwrap();
    assert_eq!(neighbors[0].state, "ESTABLISHED");
}

#[tokio::test(start_paused = true)]
async fn test_silent_neighbor_goes_down() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b = net.io();
    net.connect(&io_a, 2, &io_b, 5);

    let (spark_a, mut events_a, _ha) = Spark::spawn(config("thanos"), io_a);
    let (spark_b, _events_b, handle_b) = Spark::spawn(config("gamora"), io_b);

    spark_a
        .update_interfaces(iface_db(
            "thanos",
            "eth0",
            2,
            &[("fe80::1", 64), ("10.0.0.1", 24)],
        ))
        .await
        .unwrap();
    spark_b
        .update_interfaces(iface_db(
            "gamora",
            "eth1",
            5,
            &[("fe80::2", 64), ("10.0.0.2", 24)],
        ))
        .await
        .unwrap();

    expect_event(&mut events_a, NeighborEventKind::Up).await;

    // Kill B without any farewell: no restarting hellos, no down event.
    handle_b.abort();

    let down = expect_event(&mut events_a, NeighborEventKind::Down).await;
    assert_eq!(down.neighbor.node_name, "gamora");
    assert!(spark_a.neighbors().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_low_hop_limit_rejected() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b = net.io();
    net.connect(&io_a, 2, &io_b, 5);
    // B looks like an off-link spoofer.
    net.set_hop_limit(&io_b, 64);

    let (spark_a, mut events_a, _ha) = Spark::spawn(config("thanos"), io_a);
    let (spark_b, _events_b, _hb) = Spark::spawn(config("gamora"), io_b);

    spark_a
        .update_interfaces(iface_db(
            "thanos",
            "eth0",
            2,
            &[("fe80::1", 64), ("10.0.0.1", 24)],
        ))
        .await
        .unwrap();
    spark_b
        .update_interfaces(iface_db(
            "gamora",
            "eth1",
            5,
            &[("fe80::2", 64), ("10.0.0.2", 24)],
        ))
        .await
        .unwrap();

    // A must never even track the spoofer.
    let quiet = timeout(Duration::from_secs(30), events_a.recv()).await;
    assert!(quiet.is_err(), "no event expected from a spoofed source");
    assert!(spark_a.neighbors().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_v4_subnet_mismatch_blocks_adjacency() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b = net.io();
    net.connect(&io_a, 2, &io_b, 5);

    let (spark_a, mut events_a, _ha) = Spark::spawn(config("thanos"), io_a);
    let (spark_b, _events_b, _hb) = Spark::spawn(config("gamora"), io_b);

    spark_a
        .update_interfaces(iface_db(
            "thanos",
            "eth0",
            2,
            &[("fe80::1", 64), ("10.0.0.1", 24)],
        ))
        .await
        .unwrap();
    // B's v4 address is in a different /24.
    spark_b
        .update_interfaces(iface_db(
            "gamora",
            "eth1",
            5,
            &[("fe80::2", 64), ("10.9.9.2", 24)],
        ))
        .await
        .unwrap();

    let quiet = timeout(Duration::from_secs(30), events_a.recv()).await;
    assert!(
        quiet.is_err(),
        "adjacency must not form across v4 subnets"
    );
}

#[tokio::test(start_paused = true)]
async fn test_common_area_carried_on_events() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b = net.io();
    net.connect(&io_a, 2, &io_b, 5);

    let mut config_a = config("thanos");
    config_a.areas = Some(["0".to_string(), "pods".into()].into());
    let mut config_b = config("gamora");
    config_b.areas = Some(["pods".to_string(), "spine".into()].into());

    let (spark_a, mut events_a, _ha) = Spark::spawn(config_a, io_a);
    let (spark_b, _events_b, _hb) = Spark::spawn(config_b, io_b);

    spark_a
        .update_interfaces(iface_db(
            "thanos",
            "eth0",
            2,
            &[("fe80::1", 64), ("10.0.0.1", 24)],
        ))
        .await
        .unwrap();
    spark_b
        .update_interfaces(iface_db(
            "gamora",
            "eth1",
            5,
            &[("fe80::2", 64), ("10.0.0.2", 24)],
        ))
        .await
        .unwrap();

    let up = expect_event(&mut events_a, NeighborEventKind::Up).await;
    assert_eq!(up.area.as_deref(), Some("pods"));
}

#[tokio::test(start_paused = true)]
async fn test_interface_removal_downs_neighbors() {
    let net = SimNetwork::new();
    let io_a = net.io();
    let io_b = net.io();
    net.connect(&io_a, 2, &io_b, 5);

    let (spark_a, mut events_a, _ha) = Spark::spawn(config("thanos"), io_a);
    let (spark_b, _events_b, _hb) = Spark::spawn(config("gamora"), io_b);

    spark_a
        .update_interfaces(iface_db(
            "thanos",
            "eth0",
            2,
            &[("fe80::1", 64), ("10.0.0.1", 24)],
        ))
        .await
        .unwrap();
    spark_b
        .update_interfaces(iface_db(
            "gamora",
            "eth1",
            5,
            &[("fe80::2", 64), ("10.0.0.2", 24)],
        ))
        .await
        .unwrap();

    expect_event(&mut events_a, NeighborEventKind::Up).await;

    // The interface disappears from the snapshot.
    let empty = InterfaceDatabase {
        this_node_name: "thanos".into(),
        interfaces: HashMap::new(),
    };
    spark_a.update_interfaces(empty).await.unwrap();

    let down = expect_event(&mut events_a, NeighborEventKind::Down).await;
    assert_eq!(down.neighbor.node_name, "gamora");
    assert!(spark_a.neighbors().await.unwrap().is_empty());
}
