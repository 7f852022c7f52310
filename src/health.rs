use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for engine health and observability, served over HTTP
/// on /metrics with a /healthz liveness probe. All metrics use the
/// "netspectra" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total packets accepted into the inbox.
    pub packets_received: Counter,
    /// Packets dropped by reason (inbox_full, malformed).
    pub packets_dropped: CounterVec,
    /// Configured tasks per aggregator kind.
    pub tasks_configured: GaugeVec,
    /// Inbox capacity.
    pub inbox_capacity: Gauge,
    /// Current inbox depth.
    pub inbox_length: Gauge,
    /// Snapshots written per writer.
    pub snapshots_total: CounterVec,
    /// Snapshot write failures per writer.
    pub snapshot_write_errors: CounterVec,
    /// Measurement-window resets.
    pub resets_total: Counter,
    /// Alert rule evaluation passes.
    pub alert_evaluations: Counter,
    /// Alerts that produced a notification body.
    pub alerts_triggered: Counter,
    /// Notifier deliveries that failed.
    pub notifications_failed: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let packets_received = Counter::with_opts(
            Opts::new(
                "packets_received_total",
                "Total packets accepted into the inbox.",
            )
            .namespace("netspectra"),
        )?;
        let packets_dropped = CounterVec::new(
            Opts::new("packets_dropped_total", "Total packets dropped by reason.")
                .namespace("netspectra"),
            &["reason"],
        )?;
        let tasks_configured = GaugeVec::new(
            Opts::new("tasks_configured", "Configured tasks per aggregator kind.")
                .namespace("netspectra"),
            &["kind"],
        )?;
        let inbox_capacity = Gauge::with_opts(
            Opts::new("inbox_capacity", "Bounded packet inbox capacity.").namespace("netspectra"),
        )?;
        let inbox_length = Gauge::with_opts(
            Opts::new("inbox_length", "Current packet inbox depth.").namespace("netspectra"),
        )?;
        let snapshots_total = CounterVec::new(
            Opts::new("snapshots_total", "Snapshots written per writer.").namespace("netspectra"),
            &["writer"],
        )?;
        let snapshot_write_errors = CounterVec::new(
            Opts::new(
                "snapshot_write_errors_total",
                "Snapshot write failures per writer.",
            )
            .namespace("netspectra"),
            &["writer"],
        )?;
        let resets_total = Counter::with_opts(
            Opts::new("resets_total", "Measurement-window resets across all tasks.")
                .namespace("netspectra"),
        )?;
        let alert_evaluations = Counter::with_opts(
            Opts::new("alert_evaluations_total", "Alert rule evaluation passes.")
                .namespace("netspectra"),
        )?;
        let alerts_triggered = Counter::with_opts(
            Opts::new(
                "alerts_triggered_total",
                "Alert evaluations that produced a notification.",
            )
            .namespace("netspectra"),
        )?;
        let notifications_failed = Counter::with_opts(
            Opts::new(
                "notifications_failed_total",
                "Notifier deliveries that failed.",
            )
            .namespace("netspectra"),
        )?;

        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(packets_dropped.clone()))?;
        registry.register(Box::new(tasks_configured.clone()))?;
        registry.register(Box::new(inbox_capacity.clone()))?;
        registry.register(Box::new(inbox_length.clone()))?;
        registry.register(Box::new(snapshots_total.clone()))?;
        registry.register(Box::new(snapshot_write_errors.clone()))?;
        registry.register(Box::new(resets_total.clone()))?;
        registry.register(Box::new(alert_evaluations.clone()))?;
        registry.register(Box::new(alerts_triggered.clone()))?;
        registry.register(Box::new(notifications_failed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            packets_received,
            packets_dropped,
            tasks_configured,
            inbox_capacity,
            inbox_length,
            snapshots_total,
            snapshot_write_errors,
            resets_total,
            alert_evaluations,
            alerts_triggered,
            notifications_failed,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(AppState { registry }));

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

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").expect("metrics build");
        health.packets_received.inc();
        health
            .packets_dropped
            .with_label_values(&["inbox_full"])
            .inc();

        let families = health.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "netspectra_packets_received_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "netspectra_packets_dropped_total"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics build");
        health.start().await.expect("server starts");
        health.stop().await.expect("server stops");
    }
}
