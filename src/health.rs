//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::redis::SentinelMetrics;

/// Labels for reconciliation metrics (namespace + name)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl ReconcileLabels {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn shard(&self, shard: &str) -> ShardLabels {
        ShardLabels {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            shard: shard.to_string(),
        }
    }
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-resource topology metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ShardLabels {
    pub namespace: String,
    pub name: String,
    pub shard: String,
}

impl EncodeLabelSet for ShardLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("shard", self.shard.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Non-fatal discovery errors seen per resource
    pub discovery_errors_total: Family<ReconcileLabels, Counter>,
    /// Shards monitored per resource
    pub monitored_shards: Family<ReconcileLabels, Gauge>,
    /// Servers discovered per shard
    pub shard_servers: Family<ShardLabels, Gauge>,
    /// Sentinel-sourced gauges and event counters, shared with the
    /// background tasks
    pub sentinel: Arc<SentinelMetrics>,
    /// Shards last reported to `shard_servers`, per resource
    reported_shards: Mutex<HashMap<ReconcileLabels, BTreeSet<String>>>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "saas_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "saas_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "saas_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let discovery_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "saas_operator_discovery_errors",
            "Total number of non-fatal discovery errors",
            discovery_errors_total.clone(),
        );

        let monitored_shards = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "saas_operator_monitored_shards",
            "Number of shards monitored by each Sentinel resource",
            monitored_shards.clone(),
        );

        let shard_servers = Family::<ShardLabels, Gauge>::default();
        registry.register(
            "saas_operator_shard_servers",
            "Number of Redis servers discovered in each shard",
            shard_servers.clone(),
        );

        let sentinel = Arc::new(SentinelMetrics::new());
        sentinel.register(&mut registry);

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            discovery_errors_total,
            monitored_shards,
            shard_servers,
            sentinel,
            reported_shards: Mutex::new(HashMap::new()),
            registry,
        }
    }

    fn reported_shards(&self) -> MutexGuard<'_, HashMap<ReconcileLabels, BTreeSet<String>>> {
        self.reported_shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        let labels = ReconcileLabels::new(namespace, name);
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record non-fatal discovery errors of one reconciliation
    pub fn record_discovery_errors(&self, namespace: &str, name: &str, count: u64) {
        let labels = ReconcileLabels::new(namespace, name);
        self.discovery_errors_total
            .get_or_create(&labels)
            .inc_by(count);
    }

    /// Update the topology gauges of a resource. Shards reported last time
    /// but missing now lose their gauge.
    pub fn set_topology(&self, namespace: &str, name: &str, shards: &[(String, i64)]) {
        let labels = ReconcileLabels::new(namespace, name);
        self.monitored_shards
            .get_or_create(&labels)
            .set(i64::try_from(shards.len()).unwrap_or(i64::MAX));
        for (shard, servers) in shards {
            self.shard_servers
                .get_or_create(&labels.shard(shard))
                .set(*servers);
        }

        let current: BTreeSet<String> = shards.iter().map(|(shard, _)| shard.clone()).collect();
        let previous = self
            .reported_shards()
            .insert(labels.clone(), current.clone())
            .unwrap_or_default();
        for dropped in previous.difference(&current) {
            self.shard_servers.remove(&labels.shard(dropped));
        }
    }

    /// Drop every gauge reported for a deleted resource
    pub fn remove_resource(&self, namespace: &str, name: &str) {
        let labels = ReconcileLabels::new(namespace, name);
        self.monitored_shards.remove(&labels);
        let reported = self.reported_shards().remove(&labels).unwrap_or_default();
        for shard in &reported {
            self.shard_servers.remove(&labels.shard(shard));
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controller)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Port serving probes and metrics.
pub const HEALTH_PORT: u16 = 8080;

/// Run the health server on all interfaces.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
