//! Prometheus-kompatible Metriken fuer livegate
//!
//! Registrierte Metriken:
//! - `livegate_active_connections` – Gauge: offene WebSocket-Verbindungen
//! - `livegate_active_sessions` – Gauge: offene Upstream-Sitzungen
//! - `livegate_frames_total` – Counter: eingehende Frames (typ)
//! - `livegate_rate_limited_total` – Counter: abgelehnte Frames (klasse)
//! - `livegate_synthetic_turns_total` – Counter: synthetische turn_complete
//! - `livegate_tool_calls_total` – Counter: Tool-Aufrufe (ergebnis)
//! - `livegate_upstream_errors_total` – Counter: Upstream-Fehler (kategorie)
//! - `livegate_session_duration_seconds` – Histogram: Dauer beendeter Sitzungen
//! - `livegate_http_requests_total` – Counter: HTTP-Anfragen (method, path, status)
//! - `livegate_http_request_duration_seconds` – Histogram: HTTP-Antwortzeit

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Alle livegate-Prometheus-Metriken
#[derive(Clone)]
pub struct GatewayMetrics {
    pub registry: Arc<Registry>,

    // Gateway
    pub active_connections: IntGauge,
    pub active_sessions: IntGauge,
    pub frames_total: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub synthetic_turns_total: IntCounter,
    pub tool_calls_total: IntCounterVec,
    pub upstream_errors_total: IntCounterVec,
    pub session_duration_seconds: Histogram,

    // HTTP
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
}

impl GatewayMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let active_connections = IntGauge::with_opts(Opts::new(
            "livegate_active_connections",
            "Anzahl offener WebSocket-Verbindungen",
        ))?;
        registry.register(Box::new(active_connections.clone()))?;

        let active_sessions = IntGauge::with_opts(Opts::new(
            "livegate_active_sessions",
            "Anzahl offener Upstream-Sitzungen",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        let frames_total = IntCounterVec::new(
            Opts::new("livegate_frames_total", "Eingehende Frames nach Typ"),
            &["typ"],
        )?;
        registry.register(Box::new(frames_total.clone()))?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "livegate_rate_limited_total",
                "Wegen Rate-Limit abgelehnte Frames",
            ),
            &["klasse"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let synthetic_turns_total = IntCounter::with_opts(Opts::new(
            "livegate_synthetic_turns_total",
            "Nach Stille synthetisch erzeugte turn_complete-Frames",
        ))?;
        registry.register(Box::new(synthetic_turns_total.clone()))?;

        let tool_calls_total = IntCounterVec::new(
            Opts::new("livegate_tool_calls_total", "Ausgefuehrte Tool-Aufrufe"),
            &["ergebnis"],
        )?;
        registry.register(Box::new(tool_calls_total.clone()))?;

        let upstream_errors_total = IntCounterVec::new(
            Opts::new(
                "livegate_upstream_errors_total",
                "Upstream-Fehler nach Kategorie",
            ),
            &["kategorie"],
        )?;
        registry.register(Box::new(upstream_errors_total.clone()))?;

        let session_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "livegate_session_duration_seconds",
                "Dauer beendeter Upstream-Sitzungen in Sekunden",
            )
            .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        )?;
        registry.register(Box::new(session_duration_seconds.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("livegate_http_requests_total", "Gesamtanzahl HTTP-Anfragen"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "livegate_http_request_duration_seconds",
                "HTTP-Antwortzeit in Sekunden",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["method", "path"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            active_connections,
            active_sessions,
            frames_total,
            rate_limited_total,
            synthetic_turns_total,
            tool_calls_total,
            upstream_errors_total,
            session_duration_seconds,
            http_requests_total,
            http_request_duration_seconds,
        })
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: GatewayMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<GatewayMetrics>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            axum::http::StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
