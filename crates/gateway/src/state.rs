//! Gemeinsamer Zustand aller Handler
//!
//! Wird einmal pro Prozess gebaut und als `Arc<GatewayState>` an Transport,
//! Router und Sitzungs-Tasks verteilt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use livegate_observability::GatewayMetrics;

use crate::collaborators::Kollaborateure;
use crate::injection::{InjektionsKonfig, KontextInjektor};
use crate::rate_limit::{RateLimitKonfig, RateLimiter};
use crate::registry::Registry;
use crate::tools::{ToolCallProcessor, ToolRegistry};
use crate::turn_detector::{TurnDetector, STANDARD_STILLE};
use crate::upstream::gemini::STANDARD_ENDPUNKT;
use crate::upstream::UpstreamConnector;

/// Einstellungen fuer das KI-Backend
#[derive(Debug, Clone)]
pub struct UpstreamEinstellungen {
    /// Ohne Schluessel schlaegt jeder `start` mit `MISSING_CREDENTIAL` fehl
    pub api_key: Option<String>,
    pub modell: String,
    pub endpunkt: String,
    pub standard_stimme: String,
    pub standard_sprache: String,
    pub system_anweisung: String,
    /// Harte Obergrenze fuer den Verbindungsaufbau
    pub verbindungs_timeout: Duration,
}

impl Default for UpstreamEinstellungen {
    fn default() -> Self {
        Self {
            api_key: None,
            modell: "models/gemini-2.0-flash-live-001".to_string(),
            endpunkt: STANDARD_ENDPUNKT.to_string(),
            standard_stimme: "Puck".to_string(),
            standard_sprache: "de-DE".to_string(),
            system_anweisung: "Du bist ein freundlicher, kompetenter Gespraechspartner. \
                               Antworte knapp und in der Sprache des Nutzers."
                .to_string(),
            verbindungs_timeout: Duration::from_secs(30),
        }
    }
}

/// Laufzeit-Konfiguration des Gateways
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream: UpstreamEinstellungen,
    pub limits: RateLimitKonfig,
    pub stille_timeout: Duration,
    pub injektion: InjektionsKonfig,
    /// Wartezeit auf den SessionRecord bei `REALTIME_INPUT` (Versuche x Intervall)
    pub sitzung_warte_versuche: u32,
    pub sitzung_warte_intervall: Duration,
    pub heartbeat_intervall: Duration,
    pub heartbeat_timeout: Duration,
    /// Verzeichnis fuer Sitzungs-Logs; `None` schaltet sie ab
    pub sitzungs_verzeichnis: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamEinstellungen::default(),
            limits: RateLimitKonfig::default(),
            stille_timeout: STANDARD_STILLE,
            injektion: InjektionsKonfig::default(),
            sitzung_warte_versuche: 5,
            sitzung_warte_intervall: Duration::from_millis(100),
            heartbeat_intervall: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            sitzungs_verzeichnis: None,
        }
    }
}

/// Alles, was Handler zur Laufzeit brauchen
pub struct GatewayState {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub kollaborateure: Kollaborateure,
    pub connector: Arc<dyn UpstreamConnector>,
    pub werkzeuge: Arc<ToolRegistry>,
    pub rate_limiter: RateLimiter,
    pub turn_detector: TurnDetector,
    pub injektor: KontextInjektor,
    pub tool_prozessor: ToolCallProcessor,
    pub metriken: GatewayMetrics,
}

impl GatewayState {
    pub fn neu(
        config: GatewayConfig,
        kollaborateure: Kollaborateure,
        connector: Arc<dyn UpstreamConnector>,
        werkzeuge: ToolRegistry,
        metriken: GatewayMetrics,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::neu());
        let werkzeuge = Arc::new(werkzeuge);

        let rate_limiter = RateLimiter::neu(config.limits.clone(), Arc::clone(&registry));
        let turn_detector =
            TurnDetector::neu(Arc::clone(&registry), config.stille_timeout, metriken.clone());
        let injektor = KontextInjektor::neu(Arc::clone(&registry), config.injektion.clone());
        let tool_prozessor = ToolCallProcessor::neu(
            Arc::clone(&werkzeuge),
            Arc::clone(&kollaborateure.kontext),
            metriken.clone(),
        );

        Arc::new(Self {
            config,
            registry,
            kollaborateure,
            connector,
            werkzeuge,
            rate_limiter,
            turn_detector,
            injektor,
            tool_prozessor,
            metriken,
        })
    }

    /// Gauges aus der Registry nachziehen
    pub fn last_aktualisieren(&self) {
        self.metriken
            .active_connections
            .set(self.registry.verbindungen_anzahl() as i64);
        self.metriken
            .active_sessions
            .set(self.registry.sitzungen_anzahl() as i64);
    }
}
