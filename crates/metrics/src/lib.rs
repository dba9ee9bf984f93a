//! Metrics and tracing setup for spindle.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus a lightweight HTTP server for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use prometheus::Encoder;
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a spindle node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Discovery packet counters ──
    pub hello_packets_sent: IntCounter,
    pub hello_packets_received: IntCounter,
    pub hello_packets_dropped: IntCounter,
    pub hello_bytes_sent: IntCounter,
    pub hello_bytes_received: IntCounter,
    pub handshake_packets_sent: IntCounter,
    pub heartbeat_packets_sent: IntCounter,

    /// Packets rejected before processing, by reason: `looped`, `domain`,
    /// `version`, `subnet`, `hop_limit`, `unknown_iface`, `malformed`,
    /// `rate_limited`, `no_common_area`, `multiple_common_area`.
    pub invalid_packets: IntCounterVec,

    // ── Neighbor state ──
    pub neighbor_events: IntCounterVec,
    pub neighbor_state_changes: IntCounter,
    pub state_machine_errors: IntCounter,
    pub tracked_neighbors: IntGauge,
    pub adjacent_neighbors: IntGauge,
    pub tracked_interfaces: IntGauge,

    // ── Key-value store ──
    pub kv_merges_accepted: IntCounter,
    pub kv_merge_no_ops: IntCounter,
    pub kv_ttl_refreshes: IntCounter,
    pub kv_keys_expired: IntCounter,
    pub kv_requests: IntCounterVec,
    pub kv_op_latency_secs: HistogramVec,
    pub flood_publications_sent: IntCounter,
    pub flood_suppressed: IntCounter,
    pub flood_rate_limited: IntCounter,
    pub sync_rounds: IntCounter,
    pub sync_delta_keys: IntCounter,

    // ── Key-value client ──
    pub client_keys_advertised: IntCounter,
    pub client_ttl_updates_sent: IntCounter,
    pub client_conflicts_overridden: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for store operation latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

macro_rules! counter {
    ($registry:expr, $name:literal, $help:literal) => {{
        let c = IntCounter::with_opts(Opts::new($name, $help)).expect($name);
        $registry.register(Box::new(c.clone())).expect($name);
        c
    }};
}

macro_rules! gauge {
    ($registry:expr, $name:literal, $help:literal) => {{
        let g = IntGauge::with_opts(Opts::new($name, $help)).expect($name);
        $registry.register(Box::new(g.clone())).expect($name);
        g
    }};
}

macro_rules! counter_vec {
    ($registry:expr, $name:literal, $help:literal, $labels:expr) => {{
        let c = IntCounterVec::new(Opts::new($name, $help), $labels).expect($name);
        $registry.register(Box::new(c.clone())).expect($name);
        c
    }};
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let hello_packets_sent = counter!(
            registry,
            "spindle_spark_hello_packets_sent_total",
            "Hello packets sent"
        );
        let hello_packets_received = counter!(
            registry,
            "spindle_spark_hello_packets_received_total",
            "Hello packets received"
        );
        let hello_packets_dropped = counter!(
            registry,
            "spindle_spark_hello_packets_dropped_total",
            "Hello packets dropped before processing"
        );
        let hello_bytes_sent = counter!(
            registry,
            "spindle_spark_hello_bytes_sent_total",
            "Total bytes of hello packets sent"
        );
        let hello_bytes_received = counter!(
            registry,
            "spindle_spark_hello_bytes_received_total",
            "Total bytes of hello packets received"
        );
        let handshake_packets_sent = counter!(
            registry,
            "spindle_spark_handshake_packets_sent_total",
            "Handshake packets sent"
        );
        let heartbeat_packets_sent = counter!(
            registry,
            "spindle_spark_heartbeat_packets_sent_total",
            "Heartbeat packets sent"
        );

        let invalid_packets = counter_vec!(
            registry,
            "spindle_spark_invalid_packets_total",
            "Packets rejected before processing, by reason",
            &["reason"]
        );

        let neighbor_events = counter_vec!(
            registry,
            "spindle_spark_neighbor_events_total",
            "Neighbor events emitted, by type",
            &["event"]
        );
        let neighbor_state_changes = counter!(
            registry,
            "spindle_spark_neighbor_state_changes_total",
            "Neighbor state machine transitions"
        );
        let state_machine_errors = counter!(
            registry,
            "spindle_spark_state_machine_errors_total",
            "Events with no legal transition from the current state"
        );
        let tracked_neighbors = gauge!(
            registry,
            "spindle_spark_tracked_neighbors",
            "Neighbors currently tracked"
        );
        let adjacent_neighbors = gauge!(
            registry,
            "spindle_spark_adjacent_neighbors",
            "Neighbors in ESTABLISHED"
        );
        let tracked_interfaces = gauge!(
            registry,
            "spindle_spark_tracked_interfaces",
            "Interfaces currently tracked"
        );

        let kv_merges_accepted = counter!(
            registry,
            "spindle_kv_merges_accepted_total",
            "Received records that replaced the local record"
        );
        let kv_merge_no_ops = counter!(
            registry,
            "spindle_kv_merge_no_ops_total",
            "Received records that did not exceed the local record"
        );
        let kv_ttl_refreshes = counter!(
            registry,
            "spindle_kv_ttl_refreshes_total",
            "TTL refreshes applied"
        );
        let kv_keys_expired = counter!(
            registry,
            "spindle_kv_keys_expired_total",
            "Keys removed by the TTL reaper"
        );
        let kv_requests = counter_vec!(
            registry,
            "spindle_kv_requests_total",
            "Store requests served, by operation",
            &["op"]
        );
        let kv_op_latency_secs = {
            let h = HistogramVec::new(
                HistogramOpts::new(
                    "spindle_kv_op_latency_seconds",
                    "Store operation latency in seconds",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["op"],
            )
            .expect("kv_op_latency_secs");
            registry
                .register(Box::new(h.clone()))
                .expect("kv_op_latency_secs");
            h
        };
        let flood_publications_sent = counter!(
            registry,
            "spindle_kv_flood_publications_sent_total",
            "Publications flooded to peers"
        );
        let flood_suppressed = counter!(
            registry,
            "spindle_kv_flood_suppressed_total",
            "Peer sends suppressed by loop or spanning-tree pruning"
        );
        let flood_rate_limited = counter!(
            registry,
            "spindle_kv_flood_rate_limited_total",
            "Publications delayed by the flood token bucket"
        );
        let sync_rounds = counter!(
            registry,
            "spindle_kv_sync_rounds_total",
            "Hash-based sync rounds with peers"
        );
        let sync_delta_keys = counter!(
            registry,
            "spindle_kv_sync_delta_keys_total",
            "Keys transferred by delta sync"
        );

        let client_keys_advertised = counter!(
            registry,
            "spindle_client_keys_advertised_total",
            "Keys advertised to the store by the client"
        );
        let client_ttl_updates_sent = counter!(
            registry,
            "spindle_client_ttl_updates_total",
            "TTL refresh records advertised by the client"
        );
        let client_conflicts_overridden = counter!(
            registry,
            "spindle_client_conflicts_overridden_total",
            "Foreign writes to persisted keys overridden with a higher version"
        );

        Self {
            registry,
            hello_packets_sent,
            hello_packets_received,
            hello_packets_dropped,
            hello_bytes_sent,
            hello_bytes_received,
            handshake_packets_sent,
            heartbeat_packets_sent,
            invalid_packets,
            neighbor_events,
            neighbor_state_changes,
            state_machine_errors,
            tracked_neighbors,
            adjacent_neighbors,
            tracked_interfaces,
            kv_merges_accepted,
            kv_merge_no_ops,
            kv_ttl_refreshes,
            kv_keys_expired,
            kv_requests,
            kv_op_latency_secs,
            flood_publications_sent,
            flood_suppressed,
            flood_rate_limited,
            sync_rounds,
            sync_delta_keys,
            client_keys_advertised,
            client_ttl_updates_sent,
            client_conflicts_overridden,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a store operation latency timer. Returns a guard that
/// records elapsed time on drop.
pub fn start_kv_timer(op: &str) -> prometheus::HistogramTimer {
    metrics().kv_op_latency_secs.with_label_values(&[op]).start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
