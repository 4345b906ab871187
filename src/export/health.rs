use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "hostwatch";

/// Prometheus metrics describing the agent pipeline.
///
/// All metrics use the "hostwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Total events applied to the thread table.
    pub events_received: Counter,
    /// Total input records that could not be decoded.
    pub events_malformed: Counter,

    // === Analysis ===
    /// Threads currently tracked.
    pub threads_tracked: Gauge,
    /// Programs with a tracked main thread.
    pub processes_tracked: Gauge,
    /// Total open transactions expired by timeout.
    pub transactions_expired: Counter,
    /// Flush cycle duration.
    pub flush_duration: Histogram,
    /// Whether the last flush ran in subsampling mode (1=yes, 0=no).
    pub subsampling: Gauge,

    // === Output ===
    /// Total samples encoded.
    pub samples_encoded: Counter,
    /// Total samples placed on the outbound queue.
    pub samples_enqueued: Counter,
    /// Samples lost, by reason (encode, queue_full, queue_closed, shutdown).
    pub samples_dropped: CounterVec,
    /// Current outbound queue length.
    pub queue_depth: Gauge,
    /// Outbound queue capacity.
    pub queue_capacity: Gauge,
    /// Total envelopes handed to the transport.
    pub envelopes_sent: Counter,
    /// Total transport failures.
    pub transport_errors: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events applied to the thread table.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_malformed = Counter::with_opts(
            Opts::new(
                "events_malformed_total",
                "Total input records that could not be decoded.",
            )
            .namespace(NAMESPACE),
        )?;
        let threads_tracked = Gauge::with_opts(
            Opts::new("threads_tracked", "Threads currently tracked.").namespace(NAMESPACE),
        )?;
        let processes_tracked = Gauge::with_opts(
            Opts::new(
                "processes_tracked",
                "Programs with a tracked main thread.",
            )
            .namespace(NAMESPACE),
        )?;
        let transactions_expired = Counter::with_opts(
            Opts::new(
                "transactions_expired_total",
                "Total open transactions expired by timeout.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Flush cycle duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        let subsampling = Gauge::with_opts(
            Opts::new(
                "subsampling",
                "Whether the last flush ran in subsampling mode (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_encoded = Counter::with_opts(
            Opts::new("samples_encoded_total", "Total samples encoded.").namespace(NAMESPACE),
        )?;
        let samples_enqueued = Counter::with_opts(
            Opts::new(
                "samples_enqueued_total",
                "Total samples placed on the outbound queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_dropped = CounterVec::new(
            Opts::new("samples_dropped_total", "Samples lost, by reason.").namespace(NAMESPACE),
            &["reason"],
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new("queue_depth", "Current outbound queue length.").namespace(NAMESPACE),
        )?;
        let queue_capacity = Gauge::with_opts(
            Opts::new("queue_capacity", "Outbound queue capacity.").namespace(NAMESPACE),
        )?;
        let envelopes_sent = Counter::with_opts(
            Opts::new(
                "envelopes_sent_total",
                "Total envelopes handed to the transport.",
            )
            .namespace(NAMESPACE),
        )?;
        let transport_errors = Counter::with_opts(
            Opts::new("transport_errors_total", "Total transport failures.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_malformed.clone()))?;
        registry.register(Box::new(threads_tracked.clone()))?;
        registry.register(Box::new(processes_tracked.clone()))?;
        registry.register(Box::new(transactions_expired.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(subsampling.clone()))?;
        registry.register(Box::new(samples_encoded.clone()))?;
        registry.register(Box::new(samples_enqueued.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;
        registry.register(Box::new(envelopes_sent.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_malformed,
            threads_tracked,
            processes_tracked,
            transactions_expired,
            flush_duration,
            subsampling,
            samples_encoded,
            samples_enqueued,
            samples_dropped,
            queue_depth,
            queue_capacity,
            envelopes_sent,
            transport_errors,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
