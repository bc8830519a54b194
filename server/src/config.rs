//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen und danach von
//! `CB_*`-Umgebungsvariablen ueberschrieben. Alle Felder haben sinnvolle
//! Standardwerte; ohne Datei muss nur ein Auth-Verfahren gesetzt werden.

use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use callbridge_admission::{AdmissionConfig, IpSchutzConfig};
use callbridge_gateway::{AuthConfig, GatewayConfig, SessionConfig};
use callbridge_media::{BridgeConfig, EnergyConfig, JitterBufferConfig};
use callbridge_observability::logging;
use serde::Deserialize;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub netzwerk: NetzwerkEinstellungen,
    pub logging: LoggingEinstellungen,
    /// Parameter jeder Session (Timer, Limits, Orchestrierung)
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub admission: AdmissionConfig,
    pub ip_schutz: IpSchutzConfig,
    pub jitter: JitterBufferConfig,
    pub energie: EnergyConfig,
    pub bridge: BridgeEinstellungen,
    pub observability: ObservabilityEinstellungen,
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    /// Port des Session-Gateways (Framed TCP)
    pub session_port: u16,
    /// Port fuer Metriken, Health und Control-Webhooks
    pub http_port: u16,
    /// CORS-Origins der HTTP-Schnittstelle (leer = alle erlaubt)
    pub cors_origins: Vec<String>,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            session_port: 9400,
            http_port: 9300,
            cors_origins: vec![],
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Filter-Ausdruck: "info", "debug", "callbridge_gateway=trace,info" ...
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Media-Bridge (RTP-Legs zur Telefonie)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeEinstellungen {
    pub aktiviert: bool,
    pub leg: BridgeConfig,
}

/// Observability-Einstellungen
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    /// HTTP-Server fuer Metriken, Health und Control-Routen
    pub aktiviert: bool,
    pub metrik_intervall_ms: u64,
    /// Kapazitaet der Zustell-Queue fuer Timeline-Ereignisse
    pub zustell_kapazitaet: usize,
    /// Timelines ohne neue Ereignisse werden danach verworfen
    pub timeline_max_alter_sek: u64,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            metrik_intervall_ms: 5_000,
            zustell_kapazitaet: 1_024,
            timeline_max_alter_sek: 24 * 3600,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => Self::aus_toml(&inhalt)
                .with_context(|| format!("Konfigurationsfehler in '{pfad}'")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow!("Konfigurationsdatei '{pfad}' nicht lesbar: {e}")),
        }
    }

    pub fn aus_toml(inhalt: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(inhalt)?)
    }

    /// Uebernimmt `CB_*`-Umgebungsvariablen aus dem Prozess
    pub fn umgebung_anwenden(&mut self) -> anyhow::Result<()> {
        self.umgebung_anwenden_von(|name| std::env::var(name).ok())
    }

    /// Wie [`umgebung_anwenden`](Self::umgebung_anwenden), mit beliebiger Quelle
    pub fn umgebung_anwenden_von(
        &mut self,
        lesen: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        let text = |name: &str| lesen(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = text("CB_API_KEY") {
            self.auth.api_key = Some(v);
        }
        if let Some(v) = text("CB_HMAC_SECRET") {
            self.auth.hmac_geheimnis = Some(v);
        }
        if let Some(v) = text("CB_JWT_PUBLIC_KEY") {
            self.auth.jwt_public_key = Some(v);
        }
        if let Some(v) = text("CB_IP_ALLOWLIST") {
            self.ip_schutz.allowlist = liste(&v);
        }
        if let Some(v) = text("CB_IP_BLOCKLIST") {
            self.ip_schutz.blocklist = liste(&v);
        }

        if let Some(v) = text("CB_SESSION_PORT") {
            self.netzwerk.session_port = zahl("CB_SESSION_PORT", &v)?;
        }
        if let Some(v) = text("CB_HTTP_PORT") {
            self.netzwerk.http_port = zahl("CB_HTTP_PORT", &v)?;
        }
        if let Some(v) = text("CB_GLOBAL_LIMIT") {
            self.admission.global_limit = zahl("CB_GLOBAL_LIMIT", &v)?;
        }
        if let Some(v) = text("CB_CAMPAIGN_LIMIT") {
            self.admission.campaign_limit = zahl("CB_CAMPAIGN_LIMIT", &v)?;
        }
        if let Some(v) = text("CB_TOKEN_TTL_SEK") {
            self.admission.token_ttl_sek = zahl("CB_TOKEN_TTL_SEK", &v)?;
        }
        if let Some(v) = text("CB_CALL_TIMEOUT_SEK") {
            self.admission.call_timeout_sek = zahl("CB_CALL_TIMEOUT_SEK", &v)?;
        }
        if let Some(v) = text("CB_BREAKER_SCHWELLE") {
            self.admission.breaker_schwelle = zahl("CB_BREAKER_SCHWELLE", &v)?;
        }
        if let Some(v) = text("CB_BREAKER_COOLDOWN_SEK") {
            self.admission.breaker_cooldown_sek = zahl("CB_BREAKER_COOLDOWN_SEK", &v)?;
        }
        if let Some(v) = text("CB_MAX_CONN_PER_CALL") {
            self.session.max_verbindungen_pro_call = zahl("CB_MAX_CONN_PER_CALL", &v)?;
        }
        if let Some(v) = text("CB_MSG_RATE_PER_MIN") {
            self.session.nachrichten_pro_minute = zahl("CB_MSG_RATE_PER_MIN", &v)?;
        }
        if let Some(v) = text("CB_SILENCE_TIMEOUT_MS") {
            self.session.orchestrierung.silence_timeout_ms = zahl("CB_SILENCE_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }

    /// Prueft die Konfiguration einmalig beim Start
    pub fn validieren(&self) -> anyhow::Result<()> {
        if !logging::filter_gueltig(&self.logging.level) {
            return Err(anyhow!("logging.level '{}' ungueltig", self.logging.level));
        }
        if !logging::log_format_gueltig(&self.logging.format) {
            return Err(anyhow!("logging.format '{}' ungueltig", self.logging.format));
        }
        self.session_bind_adresse()?;
        self.http_bind_adresse()?;
        self.gateway_config()
            .validieren()
            .map_err(|e| anyhow!("[session]/[auth]: {e}"))?;
        self.admission
            .validieren()
            .map_err(|e| anyhow!("[admission]: {e}"))?;
        if self.observability.metrik_intervall_ms == 0 {
            return Err(anyhow!("observability.metrik_intervall_ms muss > 0 sein"));
        }
        if self.bridge.aktiviert && self.bridge_config().uplink.hmac_geheimnis.is_empty() {
            return Err(anyhow!(
                "[bridge] benoetigt ein HMAC-Geheimnis (bridge.leg.uplink.hmac_geheimnis oder auth.hmac_geheimnis)"
            ));
        }
        Ok(())
    }

    /// Konfiguration des Session-Gateways
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            session: self.session.clone(),
            auth: self.auth.clone(),
            jitter: self.jitter.clone(),
            energie: self.energie.clone(),
        }
    }

    /// Bridge-Konfiguration; ohne eigenes Geheimnis gilt das des Gateways
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut config = self.bridge.leg.clone();
        if config.uplink.hmac_geheimnis.is_empty() {
            if let Some(geheimnis) = &self.auth.hmac_geheimnis {
                config.uplink.hmac_geheimnis = geheimnis.clone();
            }
        }
        config
    }

    pub fn session_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        adresse(&self.netzwerk.bind_adresse, self.netzwerk.session_port)
    }

    pub fn http_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        adresse(&self.netzwerk.bind_adresse, self.netzwerk.http_port)
    }
}

fn adresse(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("ungueltige Bind-Adresse '{host}:{port}'"))
}

fn liste(wert: &str) -> Vec<String> {
    wert.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn zahl<T: std::str::FromStr>(name: &str, wert: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    wert.trim()
        .parse()
        .map_err(|e| anyhow!("{name}='{wert}' ungueltig: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn mit_hmac() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.auth.hmac_geheimnis = Some("geheim".into());
        cfg
    }

    #[test]
    fn standardwerte() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.netzwerk.session_port, 9400);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.bridge.aktiviert);
        assert_eq!(
            cfg.session_bind_adresse().unwrap(),
            "0.0.0.0:9400".parse().unwrap()
        );
    }

    #[test]
    fn ohne_auth_ungueltig() {
        assert!(ServerConfig::default().validieren().is_err());
        assert!(mit_hmac().validieren().is_ok());
    }

    #[test]
    fn config_aus_toml_string() {
        let cfg = ServerConfig::aus_toml(
            r#"
            [netzwerk]
            session_port = 10000

            [auth]
            api_key = "k"

            [admission]
            global_limit = 20

            [session.orchestrierung]
            silenceTimeoutMs = 1500

            [jitter]
            min_delay_ms = 40
        "#,
        )
        .unwrap();
        assert_eq!(cfg.netzwerk.session_port, 10000);
        assert_eq!(cfg.admission.global_limit, 20);
        assert_eq!(cfg.session.orchestrierung.silence_timeout_ms, 1500);
        assert_eq!(cfg.jitter.min_delay_ms, 40);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.netzwerk.http_port, 9300);
        assert!(cfg.validieren().is_ok());
    }

    #[test]
    fn umgebung_ueberschreibt_datei() {
        let mut cfg = mit_hmac();
        let env: HashMap<&str, &str> = [
            ("CB_GLOBAL_LIMIT", "7"),
            ("CB_IP_BLOCKLIST", "10.0.0.1, 10.0.1.0/24,"),
            ("CB_API_KEY", "schluessel"),
            ("CB_MSG_RATE_PER_MIN", "30"),
            ("CB_HMAC_SECRET", ""),
        ]
        .into_iter()
        .collect();
        cfg.umgebung_anwenden_von(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.admission.global_limit, 7);
        assert_eq!(cfg.ip_schutz.blocklist, vec!["10.0.0.1", "10.0.1.0/24"]);
        assert_eq!(cfg.auth.api_key.as_deref(), Some("schluessel"));
        assert_eq!(cfg.session.nachrichten_pro_minute, 30);
        // Leere Variablen aendern nichts
        assert_eq!(cfg.auth.hmac_geheimnis.as_deref(), Some("geheim"));
    }

    #[test]
    fn ungueltige_zahl_in_umgebung() {
        let mut cfg = mit_hmac();
        let fehler = cfg
            .umgebung_anwenden_von(|k| (k == "CB_GLOBAL_LIMIT").then(|| "viele".to_string()))
            .unwrap_err();
        assert!(fehler.to_string().contains("CB_GLOBAL_LIMIT"));
    }

    #[test]
    fn ungueltiges_log_level() {
        let mut cfg = mit_hmac();
        cfg.logging.level = "callbridge=laut".into();
        assert!(cfg.validieren().is_err());
    }

    #[test]
    fn bridge_erbt_hmac_geheimnis() {
        let mut cfg = mit_hmac();
        cfg.bridge.aktiviert = true;
        assert_eq!(cfg.bridge_config().uplink.hmac_geheimnis, "geheim");
        assert!(cfg.validieren().is_ok());

        cfg.auth.hmac_geheimnis = None;
        cfg.auth.api_key = Some("k".into());
        assert!(cfg.validieren().is_err());
    }
}
