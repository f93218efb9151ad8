//! Fehlertypen fuer das Gateway
//!
//! Jeder Handler-Fehler wird in einen `error`-Frame mit maschinenlesbarem
//! Code uebersetzt. Die Verbindung ueberlebt jeden dieser Fehler.

use livegate_protocol::{ErrorCode, ServerMessage};
use thiserror::Error;

use crate::rate_limit::LimitKlasse;
use crate::upstream::UpstreamError;

// ---------------------------------------------------------------------------
// Upstream-Fehlerkategorien
// ---------------------------------------------------------------------------

/// Kategorie eines Upstream-Fehlers, abgeleitet aus dem Fehlertext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FehlerKategorie {
    ApiKeyUngueltig,
    KontingentErschoepft,
    Zeitlimit,
    CredentialAbgelaufen,
    Allgemein,
}

impl FehlerKategorie {
    /// Ordnet einen Fehlertext einer Kategorie zu
    pub fn klassifizieren(nachricht: &str) -> Self {
        let text = nachricht.to_lowercase();
        let enthaelt = |muster: &[&str]| muster.iter().any(|m| text.contains(m));

        // "expired" zuerst: "API key expired" ist ein Ablauf, kein falscher Key
        if enthaelt(&["expired", "abgelaufen"]) {
            Self::CredentialAbgelaufen
        } else if enthaelt(&[
            "api key",
            "api_key",
            "apikey",
            "unauthenticated",
            "unauthorized",
            "permission denied",
            "401",
            "403",
        ]) {
            Self::ApiKeyUngueltig
        } else if enthaelt(&["quota", "resource_exhausted", "resource exhausted", "429", "rate limit"]) {
            Self::KontingentErschoepft
        } else if enthaelt(&["timeout", "timed out", "deadline", "zeitlimit"]) {
            Self::Zeitlimit
        } else {
            Self::Allgemein
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ApiKeyUngueltig => ErrorCode::ApiKeyInvalid,
            Self::KontingentErschoepft => ErrorCode::QuotaExceeded,
            Self::Zeitlimit => ErrorCode::UpstreamTimeout,
            Self::CredentialAbgelaufen => ErrorCode::CredentialExpired,
            Self::Allgemein => ErrorCode::UpstreamError,
        }
    }

    /// Text fuer den Client
    pub fn nutzer_nachricht(&self) -> &'static str {
        match self {
            Self::ApiKeyUngueltig => "Der API-Schluessel fuer das KI-Backend ist ungueltig",
            Self::KontingentErschoepft => {
                "Das Kontingent des KI-Backends ist erschoepft, bitte spaeter erneut versuchen"
            }
            Self::Zeitlimit => "Das KI-Backend hat nicht rechtzeitig geantwortet",
            Self::CredentialAbgelaufen => "Die Zugangsdaten fuer das KI-Backend sind abgelaufen",
            Self::Allgemein => "Fehler in der Verbindung zum KI-Backend",
        }
    }

    /// Label fuer Metriken
    pub fn label(&self) -> &'static str {
        match self {
            Self::ApiKeyUngueltig => "api_key_invalid",
            Self::KontingentErschoepft => "quota_exceeded",
            Self::Zeitlimit => "timeout",
            Self::CredentialAbgelaufen => "credential_expired",
            Self::Allgemein => "upstream",
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayError
// ---------------------------------------------------------------------------

/// Fehlertyp aller Gateway-Handler
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Sitzung noch nicht bereit (Setup nicht abgeschlossen)
    #[error("Live-Sitzung ist noch nicht bereit")]
    NichtBereit,

    /// Rate-Limit einer Klasse ueberschritten
    #[error("Rate-Limit ueberschritten ({klasse:?}), erneut in {remaining_secs}s")]
    RateLimit {
        klasse: LimitKlasse,
        remaining_secs: u64,
    },

    /// Kein SessionRecord fuer die Verbindung
    #[error("Keine aktive Sitzung")]
    KeineSitzung,

    /// Nachricht verletzt den Vertrag ihres Typs
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    /// Kein Credential fuer das KI-Backend konfiguriert
    #[error("Kein API-Schluessel fuer das KI-Backend konfiguriert")]
    CredentialFehlt,

    /// Ungueltige Sitzungskonfiguration
    #[error("Ungueltige Konfiguration: {0}")]
    Konfiguration(String),

    /// Klassifizierter Upstream-Fehler
    #[error("Upstream-Fehler ({kategorie:?}): {nachricht}")]
    Upstream {
        kategorie: FehlerKategorie,
        nachricht: String,
    },

    /// Tool-Batch konnte nicht zurueckgesendet werden
    #[error("Tool-Aufruf fehlgeschlagen: {0}")]
    ToolAufruf(String),

    /// Interner Fehler
    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl GatewayError {
    /// Erstellt einen internen Fehler
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Erstellt einen Fehler fuer eine ungueltige Nachricht
    pub fn ungueltig(msg: impl Into<String>) -> Self {
        Self::UngueltigeNachricht(msg.into())
    }

    /// Klassifiziert einen Upstream-Fehlertext
    pub fn upstream(nachricht: impl Into<String>) -> Self {
        let nachricht = nachricht.into();
        Self::Upstream {
            kategorie: FehlerKategorie::klassifizieren(&nachricht),
            nachricht,
        }
    }

    /// Wire-Code fuer den `error`-Frame
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NichtBereit => ErrorCode::LiveNotReady,
            Self::RateLimit { .. } => ErrorCode::RateLimitExceeded,
            Self::KeineSitzung => ErrorCode::NoActiveSession,
            Self::UngueltigeNachricht(_) => ErrorCode::InvalidMessage,
            Self::CredentialFehlt => ErrorCode::MissingCredential,
            Self::Konfiguration(_) => ErrorCode::InvalidConfig,
            Self::Upstream { kategorie, .. } => kategorie.code(),
            Self::ToolAufruf(_) => ErrorCode::ToolCallFailed,
            Self::Intern(_) => ErrorCode::InternalError,
        }
    }

    /// Text fuer den Client (interne Details bleiben im Log)
    pub fn client_nachricht(&self) -> String {
        match self {
            Self::Upstream { kategorie, .. } => kategorie.nutzer_nachricht().to_string(),
            Self::Intern(_) => "Interner Fehler".to_string(),
            andere => andere.to_string(),
        }
    }

    /// Baut den `error`-Frame
    pub fn als_nachricht(&self) -> ServerMessage {
        match self {
            Self::RateLimit { remaining_secs, .. } => {
                ServerMessage::rate_limit(self.client_nachricht(), *remaining_secs)
            }
            _ => ServerMessage::error(self.code(), self.client_nachricht()),
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(fehler: UpstreamError) -> Self {
        Self::upstream(fehler.to_string())
    }
}

/// Result-Typ fuer das Gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn klassifizierung_nach_text() {
        assert_eq!(
            FehlerKategorie::klassifizieren("API key not valid. Please pass a valid API key."),
            FehlerKategorie::ApiKeyUngueltig
        );
        assert_eq!(
            FehlerKategorie::klassifizieren("RESOURCE_EXHAUSTED: quota exceeded"),
            FehlerKategorie::KontingentErschoepft
        );
        assert_eq!(
            FehlerKategorie::klassifizieren("HTTP 429 Too Many Requests"),
            FehlerKategorie::KontingentErschoepft
        );
        assert_eq!(
            FehlerKategorie::klassifizieren("Deadline exceeded while waiting"),
            FehlerKategorie::Zeitlimit
        );
        assert_eq!(
            FehlerKategorie::klassifizieren("API key expired. Please renew."),
            FehlerKategorie::CredentialAbgelaufen
        );
        assert_eq!(
            FehlerKategorie::klassifizieren("connection reset by peer"),
            FehlerKategorie::Allgemein
        );
    }

    #[test]
    fn codes_der_kategorien() {
        assert_eq!(FehlerKategorie::ApiKeyUngueltig.code(), ErrorCode::ApiKeyInvalid);
        assert_eq!(FehlerKategorie::Zeitlimit.code(), ErrorCode::UpstreamTimeout);
        assert_eq!(FehlerKategorie::Allgemein.code(), ErrorCode::UpstreamError);
    }

    #[test]
    fn rate_limit_frame_traegt_restzeit() {
        let fehler = GatewayError::RateLimit {
            klasse: LimitKlasse::Audio,
            remaining_secs: 1,
        };
        match fehler.als_nachricht() {
            ServerMessage::Error(e) => {
                assert_eq!(e.code, ErrorCode::RateLimitExceeded);
                assert_eq!(e.remaining, Some(1));
            }
            andere => panic!("Erwartet Error, erhalten {andere:?}"),
        }
    }

    #[test]
    fn interne_details_bleiben_intern() {
        let fehler = GatewayError::intern("DashMap-Eintrag fehlt fuer conn:42");
        assert_eq!(fehler.client_nachricht(), "Interner Fehler");
        assert_eq!(fehler.code(), ErrorCode::InternalError);
    }

    #[test]
    fn upstream_fehler_nutzt_kategorie_text() {
        let fehler = GatewayError::upstream("quota exceeded for project 123");
        assert_eq!(fehler.code(), ErrorCode::QuotaExceeded);
        assert!(!fehler.client_nachricht().contains("project 123"));
    }
}
