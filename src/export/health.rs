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

const NAMESPACE: &str = "netstatsd";

/// Prometheus metrics for the accounting engine.
///
/// All metrics use the "netstatsd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Polls by outcome (completed/coalesced).
    pub polls_total: CounterVec,
    /// Wall time of a completed poll, rendezvous included.
    pub poll_duration: Histogram,
    /// Counter rows that went backwards, by recorder.
    pub non_monotonic_total: CounterVec,
    /// Bytes recorded into pending collections, by recorder.
    pub recorded_bytes_total: CounterVec,
    /// Failed persists by recorder.
    pub persist_errors_total: CounterVec,
    /// Failed counter source reads by source (uid/dev/tether).
    pub source_errors_total: CounterVec,
    /// Provider rounds that hit the rendezvous timeout.
    pub provider_timeouts_total: Counter,
    /// Currently registered providers.
    pub providers_registered: Gauge,
    /// Session polls downgraded by the rate limiter.
    pub session_polls_throttled_total: Counter,
    /// Legacy migration results by outcome (success/failure/fallback/skipped).
    pub migration_total: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let polls_total = CounterVec::new(
            Opts::new("polls_total", "Total poll requests by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let poll_duration = Histogram::with_opts(
            HistogramOpts::new("poll_duration_seconds", "Time to complete one poll.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        let non_monotonic_total = CounterVec::new(
            Opts::new(
                "non_monotonic_total",
                "Counter rows that decreased between polls.",
            )
            .namespace(NAMESPACE),
            &["recorder"],
        )?;
        let recorded_bytes_total = CounterVec::new(
            Opts::new("recorded_bytes_total", "Bytes recorded by recorder.").namespace(NAMESPACE),
            &["recorder"],
        )?;
        let persist_errors_total = CounterVec::new(
            Opts::new("persist_errors_total", "Failed persists by recorder.").namespace(NAMESPACE),
            &["recorder"],
        )?;
        let source_errors_total = CounterVec::new(
            Opts::new(
                "source_errors_total",
                "Failed counter source reads by source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let provider_timeouts_total = Counter::with_opts(
            Opts::new(
                "provider_timeouts_total",
                "Provider refresh rounds that timed out.",
            )
            .namespace(NAMESPACE),
        )?;
        let providers_registered = Gauge::with_opts(
            Opts::new("providers_registered", "Number of registered providers.")
                .namespace(NAMESPACE),
        )?;
        let session_polls_throttled_total = Counter::with_opts(
            Opts::new(
                "session_polls_throttled_total",
                "Session poll requests downgraded by the rate limiter.",
            )
            .namespace(NAMESPACE),
        )?;
        let migration_total = CounterVec::new(
            Opts::new("migration_total", "Legacy migration results by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;
        registry.register(Box::new(non_monotonic_total.clone()))?;
        registry.register(Box::new(recorded_bytes_total.clone()))?;
        registry.register(Box::new(persist_errors_total.clone()))?;
        registry.register(Box::new(source_errors_total.clone()))?;
        registry.register(Box::new(provider_timeouts_total.clone()))?;
        registry.register(Box::new(providers_registered.clone()))?;
        registry.register(Box::new(session_polls_throttled_total.clone()))?;
        registry.register(Box::new(migration_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            polls_total,
            poll_duration,
            non_monotonic_total,
            recorded_bytes_total,
            persist_errors_total,
            source_errors_total,
            provider_timeouts_total,
            providers_registered,
            session_polls_throttled_total,
            migration_total,
        })
    }

    /// Metrics not attached to any address, for tests and embedded use.
    pub fn detached() -> Result<Self> {
        Self::new("")
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Does nothing
    /// when no address is configured.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            tracing::info!("health metrics server disabled");
            return Ok(());
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
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
    match render(&state.registry) {
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
