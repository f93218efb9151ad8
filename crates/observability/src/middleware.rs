//! Request-Timing Middleware fuer die HTTP-Endpunkte des Gateways
//!
//! Misst die Antwortzeit jeder HTTP-Anfrage (Health, Upgrade, 404) und
//! schreibt sie als Log-Event und in die Prometheus-Metriken.

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    middleware::Next,
};
use std::time::Instant;

use crate::metrics::GatewayMetrics;

/// Axum-Middleware: misst Antwortzeit, loggt strukturiert, zaehlt in Prometheus.
///
/// Verwendung:
/// ```ignore
/// Router::new()
///     .route("/health", get(handler))
///     .layer(axum::middleware::from_fn_with_state(metriken, timing_middleware))
/// ```
pub async fn timing_middleware(
    State(metriken): State<GatewayMetrics>,
    req: Request<Body>,
    next: Next,
) -> Response<Body> {
    let methode = req.method().to_string();
    let pfad = pfad_label(req.uri().path());
    let start = Instant::now();

    let response = next.run(req).await;

    let dauer = start.elapsed();
    let status = response.status().as_u16();

    metriken
        .http_requests_total
        .with_label_values(&[methode.as_str(), pfad, status.to_string().as_str()])
        .inc();
    metriken
        .http_request_duration_seconds
        .with_label_values(&[methode.as_str(), pfad])
        .observe(dauer.as_secs_f64());

    tracing::debug!(
        method = %methode,
        path = pfad,
        status = status,
        duration_ms = dauer.as_millis() as u64,
        "HTTP-Anfrage abgeschlossen"
    );

    response
}

/// Begrenzt die Label-Kardinalitaet auf bekannte Pfade
pub fn pfad_label(pfad: &str) -> &'static str {
    match pfad {
        "/" => "/",
        "/ws" => "/ws",
        "/health" => "/health",
        "/metrics" => "/metrics",
        _ => "andere",
    }
}
