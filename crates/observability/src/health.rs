//! Health-Check-Endpunkt fuer livegate
//!
//! Endpoint: `GET /health`
//! Response: JSON mit Status, Version, Uptime und aktueller Last

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Status des Health-Checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Antwort des Health-Check-Endpunkts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub active_sessions: usize,
}

/// Liefert die aktuelle Last fuer den Health-Check
///
/// Wird vom Gateway-Registry implementiert.
pub trait LastQuelle: Send + Sync + 'static {
    fn aktive_verbindungen(&self) -> usize;
    fn aktive_sitzungen(&self) -> usize;
}

/// Geteilter Zustand fuer den Health-Check-Handler
#[derive(Clone)]
pub struct HealthState {
    pub start_time: Arc<Instant>,
    pub quelle: Arc<dyn LastQuelle>,
    /// Ohne Upstream-Credential kann keine Sitzung starten
    pub upstream_konfiguriert: bool,
}

impl HealthState {
    pub fn neu(quelle: Arc<dyn LastQuelle>, upstream_konfiguriert: bool) -> Self {
        Self {
            start_time: Arc::new(Instant::now()),
            quelle,
            upstream_konfiguriert,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Baut die Antwort aus dem aktuellen Zustand
    pub fn antwort(&self) -> HealthResponse {
        let status = if self.upstream_konfiguriert {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            active_connections: self.quelle.aktive_verbindungen(),
            active_sessions: self.quelle.aktive_sitzungen(),
        }
    }
}

/// Axum-Router fuer den `/health`-Endpunkt
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET /health` – gibt den Serverstatus zurueck
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.antwort();

    let http_status = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK, // 200 auch bei degraded (Probe soll nicht failen)
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}
