//! Konfiguration des Session-Gateways

use std::time::Duration;

use callbridge_media::{EnergyConfig, JitterBufferConfig};
use callbridge_protocol::OrchestrationConfig;
use serde::Deserialize;

use crate::auth::AuthConfig;

/// Parameter pro Session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frist fuer die `auth`-Nachricht nach dem Verbindungsaufbau
    pub auth_timeout_ms: u64,
    pub max_verbindungen_pro_call: u32,
    /// Steuerungsnachrichten pro Anruf und Minute
    pub nachrichten_pro_minute: u32,
    pub ping_intervall_sek: u64,
    /// Ohne Lebenszeichen wird die Session nach dieser Zeit geschlossen
    pub heartbeat_timeout_sek: u64,
    /// Kapazitaet der Ausgangs-Queue (Orchestrator → Verbindung)
    pub ausgang_kapazitaet: usize,
    /// Kapazitaet der Audio-Queue zur Erkennung; volle Queue verwirft
    pub asr_kapazitaet: usize,
    pub max_frame_bytes: usize,
    /// `emotion.window` an den Client senden
    pub emotion_fenster_senden: bool,
    /// Startwerte jeder Session, per `config` live aenderbar
    pub orchestrierung: OrchestrationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 5_000,
            max_verbindungen_pro_call: 1,
            nachrichten_pro_minute: 100,
            ping_intervall_sek: 15,
            heartbeat_timeout_sek: 45,
            ausgang_kapazitaet: 256,
            asr_kapazitaet: 64,
            max_frame_bytes: 256 * 1024,
            emotion_fenster_senden: true,
            orchestrierung: OrchestrationConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn ping_intervall(&self) -> Duration {
        Duration::from_secs(self.ping_intervall_sek)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_sek)
    }

    pub fn validieren(&self) -> Result<(), String> {
        if self.auth_timeout_ms == 0 {
            return Err("auth_timeout_ms muss > 0 sein".into());
        }
        if self.max_verbindungen_pro_call == 0 || self.nachrichten_pro_minute == 0 {
            return Err("max_verbindungen_pro_call und nachrichten_pro_minute muessen > 0 sein".into());
        }
        if self.ping_intervall_sek == 0 || self.heartbeat_timeout_sek <= self.ping_intervall_sek {
            return Err("heartbeat_timeout_sek muss groesser als ping_intervall_sek (> 0) sein".into());
        }
        if self.ausgang_kapazitaet == 0 || self.asr_kapazitaet == 0 {
            return Err("Queue-Kapazitaeten muessen > 0 sein".into());
        }
        if self.max_frame_bytes < 1024 {
            return Err("max_frame_bytes muss mindestens 1024 sein".into());
        }
        self.orchestrierung.validieren()
    }
}

/// Gesamtkonfiguration des Gateways
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub jitter: JitterBufferConfig,
    pub energie: EnergyConfig,
}

impl GatewayConfig {
    pub fn validieren(&self) -> Result<(), String> {
        self.session.validieren()?;
        if !self.auth.ist_konfiguriert() {
            return Err("mindestens ein Auth-Verfahren (api_key, hmac_geheimnis, jwt_public_key) erforderlich".into());
        }
        self.jitter.validieren()?;
        self.energie.validieren()
    }
}
