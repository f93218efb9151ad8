//! livegate-server – Bibliotheks-Root
//!
//! Deklariert alle Server-Module und stellt den oeffentlichen Einstiegspunkt
//! fuer Integrationstests bereit.

pub mod config;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use config::ServerConfig;
use livegate_gateway::collaborators::Kollaborateure;
use livegate_gateway::heartbeat;
use livegate_gateway::tools::ToolRegistry;
use livegate_gateway::upstream::gemini::GeminiConnector;
use livegate_gateway::GatewayState;
use livegate_observability::{observability_server_starten, GatewayMetrics, HealthState, LastQuelle};
use tokio_util::sync::CancellationToken;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Server-Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Metriken, Gateway-Zustand und Standard-Kollaborateure aufbauen
    /// 2. Heartbeat-Sweep starten
    /// 3. Observability-Server starten (optional)
    /// 4. WebSocket-/Health-Listener starten
    /// 5. Auf Ctrl-C warten, dann offene Verbindungen ueber den normalen
    ///    Aufraeum-Pfad beenden
    pub async fn starten(self) -> Result<()> {
        let metriken = GatewayMetrics::neu()?;
        let werkzeuge = ToolRegistry::mit_standardwerkzeugen();
        let kollaborateure = Kollaborateure::standard(self.config.admin.sitzungen.clone());
        let connector = Arc::new(GeminiConnector::neu(self.config.upstream.endpunkt.clone()));

        tracing::info!(
            adresse = %self.config.bind_adresse(),
            modell = %self.config.upstream.modell,
            werkzeuge = werkzeuge.anzahl(),
            upstream_konfiguriert = self.config.upstream_konfiguriert(),
            "Server startet"
        );
        if !self.config.upstream_konfiguriert() {
            tracing::warn!("Kein API-Schluessel konfiguriert – jeder start endet mit MISSING_CREDENTIAL");
        }

        let state = GatewayState::neu(
            self.config.gateway_config(),
            kollaborateure,
            connector,
            werkzeuge,
            metriken.clone(),
        );
        let quelle: Arc<dyn LastQuelle> = state.registry.clone();
        let health = HealthState::neu(quelle, self.config.upstream_konfiguriert());
        let shutdown = CancellationToken::new();

        let sweep = tokio::spawn(heartbeat::sweep_schleife(Arc::clone(&state), shutdown.clone()));

        if self.config.observability.aktiviert {
            let addr: SocketAddr = self.config.observability_bind_adresse().parse()?;
            let metriken = metriken.clone();
            let health = health.clone();
            tokio::spawn(async move {
                if let Err(e) = observability_server_starten(addr, metriken, health).await {
                    tracing::error!(fehler = %e, "Observability-Server beendet");
                }
            });
        }

        let app = transport::router(Arc::clone(&state), health, shutdown.clone());
        let listener = tokio::net::TcpListener::bind(self.config.bind_adresse()).await?;
        tracing::info!(adresse = %listener.local_addr()?, "Gateway bereit. Warte auf Shutdown-Signal (Ctrl-C)...");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await?;

        shutdown.cancel();
        let _ = sweep.await;
        tracing::info!(
            verbindungen = state.registry.verbindungen_anzahl(),
            sitzungen = state.registry.sitzungen_anzahl(),
            "Server beendet"
        );
        Ok(())
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(fehler = %e, "Ctrl-C-Handler konnte nicht installiert werden");
        shutdown.cancelled().await;
        return;
    }
    tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
    shutdown.cancel();
}
