//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist. Nur der API-Schluessel fuer das KI-Backend fehlt dann;
//! er kann auch ueber `GEMINI_API_KEY` kommen.

use std::path::PathBuf;
use std::time::Duration;

use livegate_gateway::injection::InjektionsKonfig;
use livegate_gateway::rate_limit::RateLimitKonfig;
use livegate_gateway::{GatewayConfig, UpstreamEinstellungen};
use livegate_observability::logging::{log_format_gueltig, log_level_gueltig};
use serde::{Deserialize, Serialize};

/// Umgebungsvariable fuer den API-Schluessel
pub const API_KEY_VARIABLE: &str = "GEMINI_API_KEY";

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub netzwerk: NetzwerkEinstellungen,
    /// KI-Backend (Gemini Live)
    pub upstream: UpstreamAbschnitt,
    pub limits: LimitEinstellungen,
    pub heartbeat: HeartbeatEinstellungen,
    pub turn: TurnEinstellungen,
    /// Visueller Kontext (Bildschirm, Webcam)
    pub injektion: InjektionsEinstellungen,
    pub router: RouterEinstellungen,
    pub logging: LoggingEinstellungen,
    /// Observability-Einstellungen (Metriken, Health)
    pub observability: ObservabilityEinstellungen,
    pub admin: AdminEinstellungen,
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    /// Port fuer WebSocket und `/health`
    pub port: u16,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// `[upstream]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamAbschnitt {
    /// Leer = aus `GEMINI_API_KEY`
    pub api_key: Option<String>,
    pub modell: String,
    pub endpunkt: String,
    pub standard_stimme: String,
    pub standard_sprache: String,
    pub system_anweisung: String,
    pub verbindungs_timeout_sek: u64,
}

impl Default for UpstreamAbschnitt {
    fn default() -> Self {
        let basis = UpstreamEinstellungen::default();
        Self {
            api_key: None,
            modell: basis.modell,
            endpunkt: basis.endpunkt,
            standard_stimme: basis.standard_stimme,
            standard_sprache: basis.standard_sprache,
            system_anweisung: basis.system_anweisung,
            verbindungs_timeout_sek: basis.verbindungs_timeout.as_secs(),
        }
    }
}

/// Budgets pro Verbindung
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitEinstellungen {
    pub allgemein_pro_minute: u32,
    pub allgemein_admin_pro_minute: u32,
    pub audio_pro_sekunde: u32,
    pub medien_pro_minute: u32,
}

impl Default for LimitEinstellungen {
    fn default() -> Self {
        let basis = RateLimitKonfig::default();
        Self {
            allgemein_pro_minute: basis.allgemein_pro_minute,
            allgemein_admin_pro_minute: basis.allgemein_admin_pro_minute,
            audio_pro_sekunde: basis.audio_pro_sekunde,
            medien_pro_minute: basis.medien_pro_minute,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatEinstellungen {
    pub intervall_sek: u64,
    /// Ohne Ping/Pong-Aktivitaet wird die Verbindung danach beendet
    pub timeout_sek: u64,
}

impl Default for HeartbeatEinstellungen {
    fn default() -> Self {
        Self {
            intervall_sek: 25,
            timeout_sek: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnEinstellungen {
    pub stille_timeout_ms: u64,
}

impl Default for TurnEinstellungen {
    fn default() -> Self {
        Self {
            stille_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjektionsEinstellungen {
    pub aktiviert: bool,
    pub entprellung_ms: u64,
    pub mindestabstand_ms: u64,
    pub visuell_aktuell_sek: u64,
}

impl Default for InjektionsEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            entprellung_ms: 1500,
            mindestabstand_ms: 10_000,
            visuell_aktuell_sek: 30,
        }
    }
}

/// Wartezeit von `REALTIME_INPUT` auf den Sitzungseintrag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterEinstellungen {
    pub sitzung_warte_versuche: u32,
    pub sitzung_warte_intervall_ms: u64,
}

impl Default for RouterEinstellungen {
    fn default() -> Self {
        Self {
            sitzung_warte_versuche: 5,
            sitzung_warte_intervall_ms: 100,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level oder EnvFilter-Direktive
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
    /// Verzeichnis fuer Sitzungs-Logs (leer = keine)
    pub sitzungs_verzeichnis: Option<String>,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            sitzungs_verzeichnis: None,
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    pub aktiviert: bool,
    /// Port fuer `/metrics` und `/health` (Standard: 9300)
    pub port: u16,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            port: 9300,
        }
    }
}

/// Sitzungs-IDs mit erhoehtem Budget
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminEinstellungen {
    pub sitzungen: Vec<String>,
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => Self::aus_toml(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
                ))
            }
        };
        config.api_key_ergaenzen(std::env::var(API_KEY_VARIABLE).ok());
        config.validieren()?;
        Ok(config)
    }

    pub fn aus_toml(inhalt: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(inhalt)
    }

    /// Setzt den Schluessel aus der Umgebung, falls die Datei keinen hat
    pub fn api_key_ergaenzen(&mut self, aus_umgebung: Option<String>) {
        let fehlt = self
            .upstream
            .api_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty());
        if fehlt {
            self.upstream.api_key = aus_umgebung.filter(|k| !k.trim().is_empty());
        }
    }

    /// Prueft Werte, die erst zur Laufzeit auffallen wuerden
    pub fn validieren(&self) -> anyhow::Result<()> {
        if self.netzwerk.port == 0 {
            anyhow::bail!("netzwerk.port darf nicht 0 sein");
        }
        if self.heartbeat.intervall_sek == 0 {
            anyhow::bail!("heartbeat.intervall_sek darf nicht 0 sein");
        }
        if self.heartbeat.timeout_sek <= self.heartbeat.intervall_sek {
            anyhow::bail!(
                "heartbeat.timeout_sek ({}) muss groesser als intervall_sek ({}) sein",
                self.heartbeat.timeout_sek,
                self.heartbeat.intervall_sek
            );
        }
        if !log_format_gueltig(&self.logging.format) {
            anyhow::bail!("logging.format '{}' unbekannt (text|json)", self.logging.format);
        }
        if !log_level_gueltig(&self.logging.level) {
            // EnvFilter-Direktiven wie "livegate_gateway=debug" sind erlaubt
            tracing::debug!(level = %self.logging.level, "Log-Level wird als Filter-Direktive interpretiert");
        }
        Ok(())
    }

    pub fn upstream_konfiguriert(&self) -> bool {
        self.upstream.api_key.is_some()
    }

    /// Gibt die Bind-Adresse fuer WebSocket und Health zurueck
    pub fn bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.port)
    }

    /// Gibt die Bind-Adresse fuer den Observability-Server zurueck
    pub fn observability_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.observability.port)
    }

    /// Laufzeit-Konfiguration fuer das Gateway
    pub fn gateway_config(&self) -> GatewayConfig {
        let upstream = &self.upstream;
        GatewayConfig {
            upstream: UpstreamEinstellungen {
                api_key: upstream.api_key.clone(),
                modell: upstream.modell.clone(),
                endpunkt: upstream.endpunkt.clone(),
                standard_stimme: upstream.standard_stimme.clone(),
                standard_sprache: upstream.standard_sprache.clone(),
                system_anweisung: upstream.system_anweisung.clone(),
                verbindungs_timeout: Duration::from_secs(upstream.verbindungs_timeout_sek),
            },
            limits: RateLimitKonfig {
                allgemein_pro_minute: self.limits.allgemein_pro_minute,
                allgemein_admin_pro_minute: self.limits.allgemein_admin_pro_minute,
                audio_pro_sekunde: self.limits.audio_pro_sekunde,
                medien_pro_minute: self.limits.medien_pro_minute,
            },
            stille_timeout: Duration::from_millis(self.turn.stille_timeout_ms),
            injektion: InjektionsKonfig {
                aktiviert: self.injektion.aktiviert,
                entprellung: Duration::from_millis(self.injektion.entprellung_ms),
                mindestabstand: Duration::from_millis(self.injektion.mindestabstand_ms),
                visuell_aktuell: Duration::from_secs(self.injektion.visuell_aktuell_sek),
            },
            sitzung_warte_versuche: self.router.sitzung_warte_versuche,
            sitzung_warte_intervall: Duration::from_millis(self.router.sitzung_warte_intervall_ms),
            heartbeat_intervall: Duration::from_secs(self.heartbeat.intervall_sek),
            heartbeat_timeout: Duration::from_secs(self.heartbeat.timeout_sek),
            sitzungs_verzeichnis: self
                .logging
                .sitzungs_verzeichnis
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.netzwerk.port, 8080);
        assert_eq!(cfg.heartbeat.timeout_sek, 60);
        assert_eq!(cfg.limits.audio_pro_sekunde, 200);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validieren().is_ok());
        assert!(!cfg.upstream_konfiguriert());
    }

    #[test]
    fn bind_adressen() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_adresse(), "0.0.0.0:8080");
        assert_eq!(cfg.observability_bind_adresse(), "0.0.0.0:9300");
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [netzwerk]
            port = 9000

            [upstream]
            modell = "models/test-live"
            standard_sprache = "en-US"

            [limits]
            audio_pro_sekunde = 50

            [injektion]
            aktiviert = false

            [admin]
            sitzungen = ["lead-admin"]
        "#;
        let cfg = ServerConfig::aus_toml(toml).unwrap();
        assert_eq!(cfg.netzwerk.port, 9000);
        assert_eq!(cfg.upstream.modell, "models/test-live");
        assert_eq!(cfg.limits.audio_pro_sekunde, 50);
        assert!(!cfg.injektion.aktiviert);
        assert_eq!(cfg.admin.sitzungen, vec!["lead-admin".to_string()]);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.netzwerk.bind_adresse, "0.0.0.0");
        assert_eq!(cfg.upstream.standard_stimme, "Puck");
        assert_eq!(cfg.limits.medien_pro_minute, 300);
    }

    #[test]
    fn unbekannter_typ_ist_fehler() {
        let toml = r#"
            [netzwerk]
            port = "achtzig"
        "#;
        assert!(ServerConfig::aus_toml(toml).is_err());
    }

    #[test]
    fn api_key_aus_umgebung_nur_wenn_datei_keinen_hat() {
        let mut cfg = ServerConfig::default();
        cfg.api_key_ergaenzen(Some("aus-env".into()));
        assert_eq!(cfg.upstream.api_key.as_deref(), Some("aus-env"));

        let mut cfg = ServerConfig::aus_toml("[upstream]\napi_key = \"aus-datei\"").unwrap();
        cfg.api_key_ergaenzen(Some("aus-env".into()));
        assert_eq!(cfg.upstream.api_key.as_deref(), Some("aus-datei"));

        let mut cfg = ServerConfig::aus_toml("[upstream]\napi_key = \"  \"").unwrap();
        cfg.api_key_ergaenzen(None);
        assert_eq!(cfg.upstream.api_key, None);
    }

    #[test]
    fn heartbeat_timeout_muss_groesser_als_intervall_sein() {
        let cfg = ServerConfig::aus_toml("[heartbeat]\nintervall_sek = 30\ntimeout_sek = 30").unwrap();
        assert!(cfg.validieren().is_err());
    }

    #[test]
    fn ungueltiges_log_format() {
        let cfg = ServerConfig::aus_toml("[logging]\nformat = \"xml\"").unwrap();
        assert!(cfg.validieren().is_err());
    }

    #[test]
    fn umrechnung_in_gateway_config() {
        let toml = r#"
            [upstream]
            verbindungs_timeout_sek = 12

            [turn]
            stille_timeout_ms = 2500

            [router]
            sitzung_warte_versuche = 3
            sitzung_warte_intervall_ms = 50

            [logging]
            sitzungs_verzeichnis = "/var/log/livegate"
        "#;
        let gw = ServerConfig::aus_toml(toml).unwrap().gateway_config();
        assert_eq!(gw.upstream.verbindungs_timeout, Duration::from_secs(12));
        assert_eq!(gw.stille_timeout, Duration::from_millis(2500));
        assert_eq!(gw.sitzung_warte_versuche, 3);
        assert_eq!(gw.sitzung_warte_intervall, Duration::from_millis(50));
        assert_eq!(gw.heartbeat_intervall, Duration::from_secs(25));
        assert_eq!(gw.injektion.entprellung, Duration::from_millis(1500));
        assert_eq!(gw.sitzungs_verzeichnis, Some(PathBuf::from("/var/log/livegate")));
    }
}
