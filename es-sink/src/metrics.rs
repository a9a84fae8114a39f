//! Prometheus metrics of the sink and the HTTP endpoints exposing them.

use std::iter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::error::Error;

const REGISTRY_PREFIX: &str = "es_sink";
const INDEX_LABEL: &str = "index";

const ACK_TOTAL: &str = "ack";
const FAIL_TOTAL: &str = "fail";
const BULK_REQUESTS_TOTAL: &str = "bulk_requests";
const BULK_RETRIES_TOTAL: &str = "bulk_retries";
const BULK_FAILURES_TOTAL: &str = "bulk_failures";
const BULK_RESPONSE_MISMATCH_TOTAL: &str = "bulk_response_mismatch";
const DRAIN_ABANDONED_TOTAL: &str = "drain_abandoned";
const WRITE_TIME: &str = "write_time";
const BULK_SIZE: &str = "bulk_size";
const INFLIGHT_FLUSHES: &str = "inflight_flushes";

type Labels = Vec<(String, String)>;

/// Exponential bucket distribution with range.
/// Creates `length` buckets, the lowest being `min` and the highest `max`.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let length = length.max(2);
    let min = if min <= 0.0 { 1.0 } else { min };
    let growth_factor = (max / min).powf(1.0 / (length as f64 - 1.0));

    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}

/// Metrics of one sink, labelled by the target index. Cloning shares the underlying metrics.
#[derive(Clone)]
pub struct SinkMetrics {
    labels: Labels,
    ack_total: Family<Labels, Counter>,
    fail_total: Family<Labels, Counter>,
    bulk_requests_total: Family<Labels, Counter>,
    bulk_retries_total: Family<Labels, Counter>,
    bulk_failures_total: Family<Labels, Counter>,
    bulk_response_mismatch_total: Family<Labels, Counter>,
    drain_abandoned_total: Family<Labels, Counter>,
    /// in microseconds
    write_time: Family<Labels, Histogram>,
    bulk_size: Family<Labels, Histogram>,
    inflight_flushes: Family<Labels, Gauge>,
}

impl SinkMetrics {
    /// Creates metrics that are not attached to any registry.
    pub fn new(index: &str) -> Self {
        Self {
            labels: vec![(INDEX_LABEL.to_string(), index.to_string())],
            ack_total: Family::default(),
            fail_total: Family::default(),
            bulk_requests_total: Family::default(),
            bulk_retries_total: Family::default(),
            bulk_failures_total: Family::default(),
            bulk_response_mismatch_total: Family::default(),
            drain_abandoned_total: Family::default(),
            write_time: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60_000_000.0, 10))
            }),
            bulk_size: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(1.0, 10_000.0, 10))
            }),
            inflight_flushes: Family::default(),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            ACK_TOTAL,
            "Total number of records acknowledged",
            self.ack_total.clone(),
        );
        registry.register(
            FAIL_TOTAL,
            "Total number of records failed",
            self.fail_total.clone(),
        );
        registry.register(
            BULK_REQUESTS_TOTAL,
            "Total number of bulk calls issued, retries included",
            self.bulk_requests_total.clone(),
        );
        registry.register(
            BULK_RETRIES_TOTAL,
            "Total number of retried bulk calls",
            self.bulk_retries_total.clone(),
        );
        registry.register(
            BULK_FAILURES_TOTAL,
            "Total number of bulk flushes that failed after all retries",
            self.bulk_failures_total.clone(),
        );
        registry.register(
            BULK_RESPONSE_MISMATCH_TOTAL,
            "Total number of bulk responses whose item count differs from the request",
            self.bulk_response_mismatch_total.clone(),
        );
        registry.register(
            DRAIN_ABANDONED_TOTAL,
            "Total number of records failed because the shutdown drain timed out",
            self.drain_abandoned_total.clone(),
        );
        registry.register(
            WRITE_TIME,
            "Time taken by a write to the store, in microseconds",
            self.write_time.clone(),
        );
        registry.register(
            BULK_SIZE,
            "Number of records in a flushed bulk",
            self.bulk_size.clone(),
        );
        registry.register(
            INFLIGHT_FLUSHES,
            "Number of bulk flushes currently in flight",
            self.inflight_flushes.clone(),
        );
    }

    pub(crate) fn record_ack(&self) {
        self.ack_total.get_or_create(&self.labels).inc();
    }

    pub(crate) fn record_fail(&self, count: usize) {
        self.fail_total
            .get_or_create(&self.labels)
            .inc_by(count as u64);
    }

    pub(crate) fn record_bulk_request(&self) {
        self.bulk_requests_total.get_or_create(&self.labels).inc();
    }

    pub(crate) fn record_bulk_retry(&self) {
        self.bulk_retries_total.get_or_create(&self.labels).inc();
    }

    pub(crate) fn record_bulk_failure(&self) {
        self.bulk_failures_total.get_or_create(&self.labels).inc();
    }

    pub(crate) fn record_response_mismatch(&self) {
        self.bulk_response_mismatch_total
            .get_or_create(&self.labels)
            .inc();
    }

    pub(crate) fn record_drain_abandoned(&self, count: usize) {
        self.drain_abandoned_total
            .get_or_create(&self.labels)
            .inc_by(count as u64);
    }

    pub(crate) fn observe_write_time(&self, elapsed: Duration) {
        self.write_time
            .get_or_create(&self.labels)
            .observe(elapsed.as_micros() as f64);
    }

    pub(crate) fn observe_bulk_size(&self, size: usize) {
        self.bulk_size
            .get_or_create(&self.labels)
            .observe(size as f64);
    }

    pub(crate) fn flush_started(&self) {
        self.inflight_flushes.get_or_create(&self.labels).inc();
    }

    pub(crate) fn flush_finished(&self) {
        self.inflight_flushes.get_or_create(&self.labels).dec();
    }

    pub fn ack_count(&self) -> u64 {
        self.ack_total.get_or_create(&self.labels).get()
    }

    pub fn fail_count(&self) -> u64 {
        self.fail_total.get_or_create(&self.labels).get()
    }

    pub fn bulk_request_count(&self) -> u64 {
        self.bulk_requests_total.get_or_create(&self.labels).get()
    }

    pub fn bulk_retry_count(&self) -> u64 {
        self.bulk_retries_total.get_or_create(&self.labels).get()
    }

    pub fn response_mismatch_count(&self) -> u64 {
        self.bulk_response_mismatch_total
            .get_or_create(&self.labels)
            .get()
    }

    pub fn inflight_flushes(&self) -> i64 {
        self.inflight_flushes.get_or_create(&self.labels).get()
    }
}

struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::default()),
    })
}

/// Creates sink metrics for `index` and attaches them to the registry served on `/metrics`.
pub fn registered_sink_metrics(index: &str) -> SinkMetrics {
    let metrics = SinkMetrics::new(index);
    metrics.register(&mut global_registry().registry.lock());
    metrics
}

/// Shared with the readiness probe; flipped once the sink is open.
#[derive(Clone, Default)]
pub struct MetricsState {
    ready: Arc<AtomicBool>,
}

impl MetricsState {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    let encoded = {
        let registry = global_registry().registry.lock();
        encode(&mut buffer, &registry)
    };
    if let Err(e) = encoded {
        error!(?e, "Encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(state): State<MetricsState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn metrics_router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Serves the metrics router on `addr` until `cancel` is triggered.
pub async fn start_metrics_server(
    addr: SocketAddr,
    state: MetricsState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Starting metrics server");
    axum::serve(listener, metrics_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Running metrics server: {e}")))
}
