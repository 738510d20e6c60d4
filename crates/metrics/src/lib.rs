//! Metrics and tracing setup for orkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
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

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for an orkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Op-log pipeline, labelled by kind (ADD/REM) and origin (local/remote) ──
    pub ops_submitted: IntCounterVec,
    pub ops_applied: IntCounterVec,
    pub ops_failed: IntCounterVec,
    pub op_apply_secs: HistogramVec,

    // ── Reads ──
    pub loads: IntCounter,
    pub load_secs: HistogramVec,

    // ── Replication ──
    pub replica_bounced: IntCounter,
    pub broadcasts_queued: IntCounter,

    // ── Transport ──
    pub packets_sent: IntCounter,
    pub packets_received: IntCounter,
    pub packets_failed: IntCounter,
    pub streams_accepted: IntCounter,

    // ── Membership ──
    pub members: IntGauge,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts")
}

fn histogram_vec(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
        labels,
    )
    .expect("valid histogram opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let ops_submitted = counter_vec(
            "orkv_ops_submitted_total",
            "Operations handed to the op-log pipeline",
            &["kind", "origin"],
        );
        let ops_applied = counter_vec(
            "orkv_ops_applied_total",
            "Operations applied to the store",
            &["kind", "origin"],
        );
        let ops_failed = counter_vec(
            "orkv_ops_failed_total",
            "Operations dropped after an apply failure",
            &["kind", "origin"],
        );
        let op_apply_secs = histogram_vec(
            "orkv_op_apply_seconds",
            "Time to apply one operation",
            &["kind"],
        );

        let loads = counter("orkv_loads_total", "Key loads");
        let load_secs = histogram_vec("orkv_load_seconds", "Key load latency", &["policy"]);

        let replica_bounced = counter(
            "orkv_replica_bounced_total",
            "Replicated operations dropped because the inbound channel was full",
        );
        let broadcasts_queued = counter(
            "orkv_broadcasts_queued_total",
            "Operations queued for gossip broadcast",
        );

        let packets_sent = counter("orkv_packets_sent_total", "Gossip packets sent");
        let packets_received = counter("orkv_packets_received_total", "Gossip packets received");
        let packets_failed = counter(
            "orkv_packets_failed_total",
            "Gossip packets that failed to send or decode",
        );
        let streams_accepted = counter(
            "orkv_streams_accepted_total",
            "Inbound gossip streams accepted",
        );

        let members = IntGauge::with_opts(Opts::new(
            "orkv_cluster_members",
            "Cluster members currently known",
        ))
        .expect("members gauge");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(ops_submitted.clone()),
            Box::new(ops_applied.clone()),
            Box::new(ops_failed.clone()),
            Box::new(op_apply_secs.clone()),
            Box::new(loads.clone()),
            Box::new(load_secs.clone()),
            Box::new(replica_bounced.clone()),
            Box::new(broadcasts_queued.clone()),
            Box::new(packets_sent.clone()),
            Box::new(packets_received.clone()),
            Box::new(packets_failed.clone()),
            Box::new(streams_accepted.clone()),
            Box::new(members.clone()),
        ];
        for c in collectors {
            registry.register(c).expect("register metric");
        }

        Self {
            registry,
            ops_submitted,
            ops_applied,
            ops_failed,
            op_apply_secs,
            loads,
            load_secs,
            replica_bounced,
            broadcasts_queued,
            packets_sent,
            packets_received,
            packets_failed,
            streams_accepted,
            members,
        }
    }
}

/// Label value for the origin of an operation.
pub fn origin(is_remote: bool) -> &'static str {
    if is_remote {
        "remote"
    } else {
        "local"
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::error!("prometheus encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start an op-apply latency timer. Records elapsed time on drop.
pub fn start_apply_timer(kind: &str) -> prometheus::HistogramTimer {
    metrics()
        .op_apply_secs
        .with_label_values(&[kind])
        .start_timer()
}

/// Start a load latency timer.
pub fn start_load_timer(policy: &str) -> prometheus::HistogramTimer {
    metrics().load_secs.with_label_values(&[policy]).start_timer()
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
    let mut resp = Response::new(Full::new(Bytes::from(encode_metrics())));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(resp)
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
